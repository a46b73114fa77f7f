//! Incremental server-sent events decoder.
//!
//! Bytes arrive in arbitrary chunks; [`SseDecoder::feed`] buffers partial
//! lines and yields every frame completed by the chunk. Lines end with LF
//! or CRLF. A blank line dispatches the pending event.

use std::time::Duration;

const DEFAULT_EVENT: &str = "message";

/// One decoded unit of the event stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseFrame {
    /// A dispatched event.
    Event {
        event: String,
        data: String,
        id: Option<String>,
    },
    /// A `:`-prefixed comment line (used by servers as keep-alive).
    Comment(String),
    /// Server-provided reconnection delay.
    Retry(Duration),
}

#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
    id: Option<String>,
    last_event_id: Option<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// The id of the most recent event carrying one, for `Last-Event-ID`.
    pub fn last_event_id(&self) -> Option<&str> {
        self.last_event_id.as_deref()
    }

    /// Drop any partially received event, keeping the last event id.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.event = None;
        self.data.clear();
        self.id = None;
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buffer.extend_from_slice(chunk);

        let mut frames = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let mut line: Vec<u8> = self.buffer.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            let line = String::from_utf8_lossy(&line);
            if let Some(frame) = self.process_line(&line) {
                frames.push(frame);
            }
        }
        frames
    }

    fn process_line(&mut self, line: &str) -> Option<SseFrame> {
        if line.is_empty() {
            return self.dispatch();
        }

        if let Some(comment) = line.strip_prefix(':') {
            return Some(SseFrame::Comment(comment.trim_start().to_string()));
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            "id" if !value.contains('\0') => self.id = Some(value.to_string()),
            "retry" => {
                if let Ok(ms) = value.parse::<u64>() {
                    return Some(SseFrame::Retry(Duration::from_millis(ms)));
                }
            }
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseFrame> {
        let event = self.event.take();
        let id = self.id.take();
        if id.is_some() {
            self.last_event_id = id.clone();
        }

        if self.data.is_empty() && event.is_none() {
            return None;
        }

        let data = self.data.join("\n");
        self.data.clear();
        Some(SseFrame::Event {
            event: event
                .filter(|e| !e.is_empty())
                .unwrap_or_else(|| DEFAULT_EVENT.to_string()),
            data,
            id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(event: &str, data: &str) -> SseFrame {
        SseFrame::Event {
            event: event.to_string(),
            data: data.to_string(),
            id: None,
        }
    }

    #[test]
    fn test_welcome_and_mutation() {
        let mut decoder = SseDecoder::new();
        let frames = decoder.feed(
            b"event: welcome\ndata: {\"listenerName\":\"abc\"}\n\nevent: mutation\ndata: {}\n\n",
        );
        assert_eq!(
            frames,
            vec![
                event("welcome", "{\"listenerName\":\"abc\"}"),
                event("mutation", "{}"),
            ]
        );
    }

    #[test]
    fn test_frames_split_across_chunks() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.feed(b"event: disc").is_empty());
        assert!(decoder.feed(b"onnect\r\ndata: {\"reason\":").is_empty());
        let frames = decoder.feed(b"\"bad query\"}\r\n\r\n");
        assert_eq!(frames, vec![event("disconnect", "{\"reason\":\"bad query\"}")]);
    }

    #[test]
    fn test_multiline_data_and_default_event() {
        let mut decoder = SseDecoder::new();
        let frames = decoder.feed(b"data: line one\ndata: line two\n\n");
        assert_eq!(frames, vec![event("message", "line one\nline two")]);
    }

    #[test]
    fn test_comments_retry_and_ids() {
        let mut decoder = SseDecoder::new();
        let frames = decoder.feed(b": keep-alive\nretry: 1500\nid: evt-7\nevent: mutation\ndata: x\n\n");
        assert_eq!(
            frames,
            vec![
                SseFrame::Comment("keep-alive".to_string()),
                SseFrame::Retry(Duration::from_millis(1500)),
                SseFrame::Event {
                    event: "mutation".to_string(),
                    data: "x".to_string(),
                    id: Some("evt-7".to_string()),
                },
            ]
        );
        assert_eq!(decoder.last_event_id(), Some("evt-7"));
    }

    #[test]
    fn test_blank_lines_without_fields_dispatch_nothing() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.feed(b"\n\n\r\n").is_empty());
        assert!(decoder.feed(b"retry: soon\n\n").is_empty());
    }

    const STREAM: &[u8] = b": hi\r\nevent: welcome\ndata: {}\n\nid: 4\nevent: mutation\r\ndata: a\ndata: b\r\n\r\nretry: 250\nevent: disconnect\ndata: {\"reason\":\"x\"}\n\n";

    proptest::proptest! {
        #[test]
        fn prop_chunk_boundaries_do_not_change_frames(splits in proptest::collection::vec(0..STREAM.len(), 0..8)) {
            let expected = SseDecoder::new().feed(STREAM);

            let mut cuts = splits;
            cuts.sort_unstable();
            let mut decoder = SseDecoder::new();
            let mut frames = Vec::new();
            let mut start = 0;
            for cut in cuts.into_iter().chain(std::iter::once(STREAM.len())) {
                frames.extend(decoder.feed(&STREAM[start..cut]));
                start = cut;
            }

            proptest::prop_assert_eq!(frames, expected);
            proptest::prop_assert_eq!(decoder.last_event_id(), Some("4"));
        }
    }

    #[test]
    fn test_reset_discards_partial_event() {
        let mut decoder = SseDecoder::new();
        decoder.feed(b"id: 1\nevent: welcome\n\nevent: mutation\ndata: par");
        decoder.reset();
        assert!(decoder.feed(b"\n\n").is_empty());
        assert_eq!(decoder.last_event_id(), Some("1"));
    }
}
