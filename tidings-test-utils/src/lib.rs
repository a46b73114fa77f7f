//! Tidings Test Utilities
//!
//! Shared test infrastructure for the tidings workspace:
//! - [`StubFetcher`]: scriptable, call-counting content backend
//! - [`ManualFeed`]: change feed whose events are pushed by the test
//! - Proptest generators and fixtures for documents and schedules

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};

pub use tidings_core::{
    CacheKey, Entry, ListenEndpoint, MediaMode, MediaRef, QueryKey, QueryResult, SlideImage,
    StreamError, TidingsConfig, UpstreamError,
};
pub use tidings_upstream::{
    wait_for_close, ChangeFeed, ChangeStream, ContentFetcher, StreamEvent, StreamHandle,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ============================================================================
// STUB FETCHER
// ============================================================================

/// In-memory [`ContentFetcher`].
///
/// Unscripted queries succeed with [`fixtures::versioned_result`], numbered
/// by how many times that key has been fetched, so a refetch is always
/// distinguishable from the previous fetch. Scripted responses override
/// that per key.
#[derive(Debug, Default)]
pub struct StubFetcher {
    responses: Mutex<HashMap<QueryKey, Result<QueryResult, UpstreamError>>>,
    media: Mutex<HashMap<String, Result<Vec<u8>, UpstreamError>>>,
    calls: Mutex<HashMap<QueryKey, usize>>,
    query_calls: AtomicUsize,
    media_calls: AtomicUsize,
    delay: Mutex<Option<Duration>>,
}

impl StubFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep this long inside every query fetch.
    pub fn with_delay(self, delay: Duration) -> Self {
        *lock(&self.delay) = Some(delay);
        self
    }

    pub fn set_response(&self, key: &QueryKey, result: QueryResult) {
        lock(&self.responses).insert(key.clone(), Ok(result));
    }

    pub fn set_error(&self, key: &QueryKey, error: UpstreamError) {
        lock(&self.responses).insert(key.clone(), Err(error));
    }

    /// Go back to versioned results for `key`.
    pub fn clear_response(&self, key: &QueryKey) {
        lock(&self.responses).remove(key);
    }

    pub fn set_media(&self, path: &str, bytes: Vec<u8>) {
        lock(&self.media).insert(path.to_string(), Ok(bytes));
    }

    pub fn set_media_error(&self, path: &str, error: UpstreamError) {
        lock(&self.media).insert(path.to_string(), Err(error));
    }

    /// Total query fetches across all keys.
    pub fn query_calls(&self) -> usize {
        self.query_calls.load(Ordering::SeqCst)
    }

    pub fn calls_for(&self, key: &QueryKey) -> usize {
        lock(&self.calls).get(key).copied().unwrap_or(0)
    }

    pub fn media_calls(&self) -> usize {
        self.media_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ContentFetcher for StubFetcher {
    async fn fetch_query(&self, key: &QueryKey) -> Result<QueryResult, UpstreamError> {
        self.query_calls.fetch_add(1, Ordering::SeqCst);
        let version = {
            let mut calls = lock(&self.calls);
            let count = calls.entry(key.clone()).or_insert(0);
            *count += 1;
            *count
        };

        let delay = *lock(&self.delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        match lock(&self.responses).get(key) {
            Some(scripted) => scripted.clone(),
            None => Ok(fixtures::versioned_result(key, version)),
        }
    }

    async fn fetch_media(&self, media: &MediaRef, _dataset: &str) -> Result<Vec<u8>, UpstreamError> {
        self.media_calls.fetch_add(1, Ordering::SeqCst);
        match lock(&self.media).get(media.as_str()) {
            Some(scripted) => scripted.clone(),
            None => Ok(media.as_str().as_bytes().to_vec()),
        }
    }
}

// ============================================================================
// MANUAL FEED
// ============================================================================

#[derive(Debug)]
struct ManualStream {
    sender: Option<mpsc::Sender<StreamEvent>>,
    shutdown: watch::Receiver<bool>,
}

impl ManualStream {
    fn is_closed(&self) -> bool {
        *self.shutdown.borrow() || self.sender.is_none()
    }
}

type StreamTable = HashMap<ListenEndpoint, Vec<ManualStream>>;

/// [`ChangeFeed`] driven by the test.
///
/// Every `open` is recorded. Events are pushed into the most recently
/// opened stream for an endpoint. Closing a handle ends that stream's
/// event channel, as the network feed does.
#[derive(Debug, Clone, Default)]
pub struct ManualFeed {
    streams: Arc<Mutex<StreamTable>>,
}

impl ManualFeed {
    pub fn new() -> Self {
        Self::default()
    }

    /// How many streams have been opened for `endpoint`.
    pub fn open_count(&self, endpoint: &ListenEndpoint) -> usize {
        lock(&self.streams).get(endpoint).map_or(0, Vec::len)
    }

    pub fn total_opened(&self) -> usize {
        lock(&self.streams).values().map(Vec::len).sum()
    }

    /// Whether the latest stream for `endpoint` has been closed by its owner.
    pub fn is_closed(&self, endpoint: &ListenEndpoint) -> bool {
        lock(&self.streams)
            .get(endpoint)
            .and_then(|streams| streams.last())
            .map_or(true, ManualStream::is_closed)
    }

    /// Number of opened streams for `endpoint` that are now closed.
    pub fn closed_count(&self, endpoint: &ListenEndpoint) -> usize {
        lock(&self.streams)
            .get(endpoint)
            .map_or(0, |streams| streams.iter().filter(|s| s.is_closed()).count())
    }

    /// Push an event into the latest open stream. Returns false if there is none.
    pub async fn push(&self, endpoint: &ListenEndpoint, event: StreamEvent) -> bool {
        let sender = lock(&self.streams)
            .get(endpoint)
            .and_then(|streams| streams.last())
            .filter(|stream| !stream.is_closed())
            .and_then(|stream| stream.sender.clone());

        match sender {
            Some(sender) => sender.send(event).await.is_ok(),
            None => false,
        }
    }

    pub async fn welcome(&self, endpoint: &ListenEndpoint) -> bool {
        self.push(endpoint, StreamEvent::Opened).await
            && self
                .push(endpoint, StreamEvent::message("welcome", r#"{"listenerName":"stub"}"#))
                .await
    }

    pub async fn mutation(&self, endpoint: &ListenEndpoint) -> bool {
        self.push(endpoint, StreamEvent::message("mutation", "{}"))
            .await
    }

    pub async fn disconnect(&self, endpoint: &ListenEndpoint) -> bool {
        self.push(
            endpoint,
            StreamEvent::message("disconnect", r#"{"reason":"forced"}"#),
        )
        .await
    }

    /// Report a transport error followed by the terminal close signal.
    pub async fn fail(&self, endpoint: &ListenEndpoint, reason: &str) -> bool {
        self.push(endpoint, StreamEvent::Error(StreamError::fatal(reason)))
            .await
            && self.push(endpoint, StreamEvent::Closed).await
    }
}

impl ChangeFeed for ManualFeed {
    fn open(&self, endpoint: &ListenEndpoint) -> ChangeStream {
        let (handle, shutdown) = StreamHandle::new(endpoint.clone());
        let (sender, events) = mpsc::channel(64);

        let index = {
            let mut streams = lock(&self.streams);
            let slot = streams.entry(endpoint.clone()).or_default();
            slot.push(ManualStream {
                sender: Some(sender),
                shutdown: shutdown.clone(),
            });
            slot.len() - 1
        };

        let table = Arc::clone(&self.streams);
        let endpoint = endpoint.clone();
        let mut watcher = shutdown;
        tokio::spawn(async move {
            wait_for_close(&mut watcher).await;
            if let Some(stream) = lock(&table)
                .get_mut(&endpoint)
                .and_then(|streams| streams.get_mut(index))
            {
                stream.sender = None;
            }
        });

        ChangeStream { handle, events }
    }
}

// ============================================================================
// ASYNC ASSERTIONS
// ============================================================================

/// Poll `check` until it holds or `timeout` elapses. Returns the final outcome.
///
/// Works under a paused clock: each retry sleeps, which lets background
/// tasks run and auto-advances time.
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for tidings types.

    use super::*;
    use chrono::{DateTime, TimeZone, Utc, Weekday};
    use proptest::prelude::*;

    pub fn arb_weekday() -> impl Strategy<Value = Weekday> {
        (0u8..7).prop_map(|n| match n {
            0 => Weekday::Mon,
            1 => Weekday::Tue,
            2 => Weekday::Wed,
            3 => Weekday::Thu,
            4 => Weekday::Fri,
            5 => Weekday::Sat,
            _ => Weekday::Sun,
        })
    }

    pub fn arb_hour() -> impl Strategy<Value = u32> {
        0u32..24
    }

    /// Any instant between 2000 and 2100, to the second.
    pub fn arb_utc_datetime() -> impl Strategy<Value = DateTime<Utc>> {
        (946_684_800i64..4_102_444_800i64, 0u32..1_000_000_000).prop_filter_map(
            "representable instant",
            |(secs, nanos)| Utc.timestamp_opt(secs, nanos).single(),
        )
    }

    pub fn arb_dataset() -> impl Strategy<Value = String> {
        "[a-z][a-z0-9_-]{0,15}"
    }

    pub fn arb_query_key() -> impl Strategy<Value = QueryKey> {
        ("\\*\\[_type=='[a-z]{1,10}'\\]", arb_dataset())
            .prop_map(|(query, dataset)| QueryKey::new(query, dataset))
    }
}

// ============================================================================
// FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built documents and configs.

    use super::*;
    use serde_json::json;

    /// Config pointed at a project named `test-project`.
    pub fn test_config() -> TidingsConfig {
        TidingsConfig::new("test-project")
    }

    pub fn entry(title: &str) -> Entry {
        entry_json(json!({
            "title": title,
            "_id": format!("doc-{}", title),
            "description": [{"_type": "block", "children": [{"text": title}]}],
            "date": "2024-01-15",
        }))
    }

    pub fn result_with_titles(titles: &[&str]) -> QueryResult {
        QueryResult::new(titles.iter().map(|t| entry(t)).collect())
    }

    pub fn empty_result() -> QueryResult {
        QueryResult::default()
    }

    /// A single entry whose one-slide modal references `asset_ref`.
    pub fn result_with_image(title: &str, asset_ref: &str) -> QueryResult {
        QueryResult::new(vec![entry_json(json!({
            "title": title,
            "_id": format!("doc-{}", title),
            "modal": {
                "numSlides": 1,
                "modalHeader": title,
                "modalSlide1": {
                    "slideHeader": "Slide",
                    "slideImage": {"_type": "image", "asset": {"_ref": asset_ref, "_type": "reference"}},
                    "altText": "screenshot",
                }
            }
        }))])
    }

    /// Result whose single entry title is `"{query}@{dataset}#v{version}"`.
    pub fn versioned_result(key: &QueryKey, version: usize) -> QueryResult {
        result_with_titles(&[&versioned_title(key, version)])
    }

    pub fn versioned_title(key: &QueryKey, version: usize) -> String {
        format!("{}@{}#v{}", key.query, key.dataset, version)
    }

    fn entry_json(value: serde_json::Value) -> Entry {
        match serde_json::from_value(value) {
            Ok(entry) => entry,
            Err(e) => panic!("fixture entry does not deserialize: {}", e),
        }
    }
}
