//! Change-feed streams.
//!
//! A [`ChangeFeed`] opens one long-lived stream per listen endpoint and
//! hands back a [`ChangeStream`]: a [`StreamHandle`] that stops the stream
//! and an ordered channel of [`StreamEvent`]s. The receiver sees `None`
//! once the stream task has exited.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::header::{ACCEPT, CACHE_CONTROL};
use reqwest::Client;
use tidings_core::{ListenEndpoint, StreamError, TidingsConfig};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::sse::{SseDecoder, SseFrame};

/// Events buffered per stream before the transport waits on the consumer.
const EVENT_BUFFER: usize = 64;

/// Signals delivered to a stream's consumer, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// The transport connected and is ready to receive.
    Opened,
    /// A server-sent event (`welcome`, `mutation`, `disconnect`, ...).
    Message {
        event: String,
        data: String,
        id: Option<String>,
    },
    Comment(String),
    Error(StreamError),
    /// The transport will not reconnect.
    Closed,
}

impl StreamEvent {
    pub fn message(event: impl Into<String>, data: impl Into<String>) -> Self {
        Self::Message {
            event: event.into(),
            data: data.into(),
            id: None,
        }
    }
}

/// Owner-side control of one stream.
///
/// Closing is idempotent and also happens on drop.
#[derive(Debug)]
pub struct StreamHandle {
    endpoint: ListenEndpoint,
    shutdown: watch::Sender<bool>,
    closed: AtomicBool,
}

impl StreamHandle {
    /// Create a handle plus the receiver the stream task watches for shutdown.
    pub fn new(endpoint: ListenEndpoint) -> (Self, watch::Receiver<bool>) {
        let (shutdown, rx) = watch::channel(false);
        let handle = Self {
            endpoint,
            shutdown,
            closed: AtomicBool::new(false),
        };
        (handle, rx)
    }

    pub fn endpoint(&self) -> &ListenEndpoint {
        &self.endpoint
    }

    /// Stop the stream. Returns false if it was already closed.
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        let _ = self.shutdown.send(true);
        debug!(endpoint = %self.endpoint, "Stream handle closed");
        true
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        self.close();
    }
}

/// An open stream: its control handle and its event channel.
#[derive(Debug)]
pub struct ChangeStream {
    pub handle: StreamHandle,
    pub events: mpsc::Receiver<StreamEvent>,
}

impl ChangeStream {
    pub fn into_parts(self) -> (StreamHandle, mpsc::Receiver<StreamEvent>) {
        (self.handle, self.events)
    }
}

/// Opens change-feed streams.
///
/// `open` never fails synchronously; connection problems arrive as
/// [`StreamEvent::Error`] followed by [`StreamEvent::Closed`].
pub trait ChangeFeed: Send + Sync {
    fn open(&self, endpoint: &ListenEndpoint) -> ChangeStream;
}

/// Resolves once the handle has been closed or dropped.
pub async fn wait_for_close(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// Reconnecting server-sent events client.
#[derive(Debug, Clone)]
pub struct SseChangeFeed {
    client: Client,
    retry_delay: Duration,
    max_retries: u32,
}

impl SseChangeFeed {
    pub fn new(client: Client, retry_delay: Duration, max_retries: u32) -> Self {
        Self {
            client,
            retry_delay,
            max_retries,
        }
    }

    pub fn from_config(client: Client, config: &TidingsConfig) -> Self {
        Self::new(client, config.stream_retry_delay, config.stream_max_retries)
    }
}

impl ChangeFeed for SseChangeFeed {
    fn open(&self, endpoint: &ListenEndpoint) -> ChangeStream {
        let (handle, shutdown) = StreamHandle::new(endpoint.clone());
        let (events, rx) = mpsc::channel(EVENT_BUFFER);

        let worker = FeedWorker {
            client: self.client.clone(),
            endpoint: endpoint.clone(),
            retry_delay: self.retry_delay,
            max_retries: self.max_retries,
            decoder: SseDecoder::new(),
            events,
        };
        tokio::spawn(worker.run(shutdown));

        ChangeStream { handle, events: rx }
    }
}

/// How one connection attempt ended.
enum SessionEnd {
    Reset { error: StreamError, opened: bool },
    Fatal(StreamError),
    ReceiverGone,
}

struct FeedWorker {
    client: Client,
    endpoint: ListenEndpoint,
    retry_delay: Duration,
    max_retries: u32,
    decoder: SseDecoder,
    events: mpsc::Sender<StreamEvent>,
}

impl FeedWorker {
    async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut failures: u32 = 0;

        loop {
            let outcome = tokio::select! {
                biased;
                _ = wait_for_close(&mut shutdown) => break,
                outcome = self.session() => outcome,
            };

            match outcome {
                SessionEnd::ReceiverGone => break,
                SessionEnd::Fatal(err) => {
                    error!(endpoint = %self.endpoint, error = %err, "Change feed rejected");
                    self.finish(err).await;
                    break;
                }
                SessionEnd::Reset { error, opened } => {
                    if opened {
                        failures = 0;
                    }
                    failures += 1;

                    if failures > self.max_retries {
                        let err = StreamError::fatal(format!(
                            "giving up after {} consecutive failures: {}",
                            failures, error
                        ));
                        error!(endpoint = %self.endpoint, error = %err, "Change feed retries exhausted");
                        self.finish(err).await;
                        break;
                    }

                    warn!(
                        endpoint = %self.endpoint,
                        error = %error,
                        attempt = failures,
                        retry_in_ms = self.retry_delay.as_millis() as u64,
                        "Change feed reset, reconnecting"
                    );
                    if !self.emit(StreamEvent::Error(error)).await {
                        break;
                    }

                    tokio::select! {
                        biased;
                        _ = wait_for_close(&mut shutdown) => break,
                        _ = tokio::time::sleep(self.retry_delay) => {}
                    }
                }
            }
        }

        debug!(endpoint = %self.endpoint, "Change feed task stopped");
    }

    async fn session(&mut self) -> SessionEnd {
        let mut request = self
            .client
            .get(self.endpoint.as_str())
            .header(ACCEPT, "text/event-stream")
            .header(CACHE_CONTROL, "no-cache");
        if let Some(id) = self.decoder.last_event_id() {
            request = request.header("Last-Event-ID", id);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                return SessionEnd::Reset {
                    error: StreamError::reset(format!("connect failed: {}", e)),
                    opened: false,
                }
            }
        };

        let status = response.status();
        if !status.is_success() {
            return SessionEnd::Fatal(StreamError::fatal(format!(
                "change feed answered HTTP {}",
                status.as_u16()
            )));
        }

        info!(endpoint = %self.endpoint, "Change feed connected");
        self.decoder.reset();
        if !self.emit(StreamEvent::Opened).await {
            return SessionEnd::ReceiverGone;
        }

        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    return SessionEnd::Reset {
                        error: StreamError::reset(format!("stream interrupted: {}", e)),
                        opened: true,
                    }
                }
            };

            for frame in self.decoder.feed(&chunk) {
                let event = match frame {
                    SseFrame::Event { event, data, id } => StreamEvent::Message { event, data, id },
                    SseFrame::Comment(comment) => StreamEvent::Comment(comment),
                    SseFrame::Retry(delay) => {
                        self.retry_delay = delay;
                        continue;
                    }
                };
                if !self.emit(event).await {
                    return SessionEnd::ReceiverGone;
                }
            }
        }

        SessionEnd::Reset {
            error: StreamError::reset("server closed the connection"),
            opened: true,
        }
    }

    async fn emit(&self, event: StreamEvent) -> bool {
        self.events.send(event).await.is_ok()
    }

    async fn finish(&self, err: StreamError) {
        if self.emit(StreamEvent::Error(err)).await {
            let _ = self.emit(StreamEvent::Closed).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    fn endpoint() -> ListenEndpoint {
        ListenEndpoint::new("http://127.0.0.1:9/v1/data/listen/ds?query=q")
    }

    #[test]
    fn test_handle_close_is_idempotent() {
        let (handle, rx) = StreamHandle::new(endpoint());
        assert!(!handle.is_closed());
        assert!(handle.close());
        assert!(!handle.close());
        assert!(handle.is_closed());
        assert!(*rx.borrow());
    }

    #[tokio::test]
    async fn test_wait_for_close_resolves_on_close_and_drop() {
        let (handle, mut rx) = StreamHandle::new(endpoint());
        let waiter = tokio::spawn(async move { wait_for_close(&mut rx).await });
        handle.close();
        timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();

        let (handle, mut rx) = StreamHandle::new(endpoint());
        drop(handle);
        timeout(Duration::from_secs(1), wait_for_close(&mut rx))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_unreachable_feed_gives_up_with_fatal_then_closed() {
        // Port 9 (discard) on loopback refuses connections.
        let feed = SseChangeFeed::new(Client::new(), Duration::from_millis(10), 2);
        let (_handle, mut events) = feed.open(&endpoint()).into_parts();

        let mut received = Vec::new();
        while let Some(event) = timeout(Duration::from_secs(10), events.recv())
            .await
            .unwrap()
        {
            received.push(event);
        }

        let resets = received
            .iter()
            .filter(|e| matches!(e, StreamEvent::Error(err) if err.is_transient()))
            .count();
        assert_eq!(resets, 2);
        assert!(matches!(
            received[received.len() - 2],
            StreamEvent::Error(StreamError::Fatal { .. })
        ));
        assert_eq!(received.last(), Some(&StreamEvent::Closed));
        assert!(!received.contains(&StreamEvent::Opened));
    }

    #[tokio::test]
    async fn test_closing_handle_ends_event_channel() {
        let feed = SseChangeFeed::new(Client::new(), Duration::from_secs(60), 100);
        let (handle, mut events) = feed.open(&endpoint()).into_parts();
        handle.close();

        // The task may have reported one reset before observing the close.
        let drained = timeout(Duration::from_secs(10), async {
            while let Some(event) = events.recv().await {
                assert_ne!(event, StreamEvent::Closed);
            }
        })
        .await;
        assert!(drained.is_ok());
    }
}
