//! End-to-end flows through the relay with a hand-driven change feed.

use std::sync::Arc;
use std::time::Duration;

use tidings_core::{ListenEndpoint, QueryKey, QueryResult};
use tidings_sync::ContentRelay;
use tidings_test_utils::{eventually, fixtures, ManualFeed, StubFetcher};
use tidings_upstream::{BackendEndpoints, StreamEvent};

struct Scenario {
    relay: ContentRelay,
    fetcher: Arc<StubFetcher>,
    feed: Arc<ManualFeed>,
    key: QueryKey,
    endpoint: ListenEndpoint,
}

impl Scenario {
    fn new() -> Self {
        let config = fixtures::test_config();
        let fetcher = Arc::new(StubFetcher::new());
        let feed = Arc::new(ManualFeed::new());
        let endpoints = BackendEndpoints::from_config(&config).unwrap();
        let key = QueryKey::new("X", "ds");
        let endpoint = endpoints.listen_endpoint(&key);
        let relay = ContentRelay::new(fetcher.clone(), feed.clone(), endpoints, &config);
        Self {
            relay,
            fetcher,
            feed,
            key,
            endpoint,
        }
    }

    async fn query(&self, with_media: bool) -> QueryResult {
        self.relay
            .query(&self.key.query, &self.key.dataset, with_media)
            .await
            .unwrap()
    }

    /// Scenario A: first query fetches and subscribes, the second is cached.
    async fn subscribed(&self) -> QueryResult {
        let first = self.query(false).await;
        assert_eq!(self.fetcher.calls_for(&self.key), 1);
        assert!(!first.is_empty());
        assert_eq!(self.feed.open_count(&self.endpoint), 1);

        let second = self.query(false).await;
        assert_eq!(second, first);
        assert_eq!(self.fetcher.calls_for(&self.key), 1);

        assert!(self.feed.welcome(&self.endpoint).await);
        first
    }
}

#[tokio::test]
async fn scenario_a_second_query_is_served_from_cache() {
    let s = Scenario::new();
    s.subscribed().await;

    assert!(s.relay.is_subscribed("X", "ds"));
    assert_eq!(s.fetcher.query_calls(), 1);
}

#[tokio::test]
async fn scenario_b_mutation_refreshes_without_caller_invalidation() {
    let s = Scenario::new();
    let before = s.subscribed().await;

    assert!(s.feed.mutation(&s.endpoint).await);

    let relay = &s.relay;
    let refreshed = eventually(Duration::from_secs(2), move || {
        let before = before.clone();
        async move {
            relay
                .query("X", "ds", false)
                .await
                .map_or(false, |current| current != before)
        }
    })
    .await;
    assert!(refreshed);

    // One initial fetch plus one per cache variant on refresh.
    assert_eq!(s.fetcher.calls_for(&s.key), 3);
    assert!(s.relay.is_subscribed("X", "ds"));
}

#[tokio::test]
async fn scenario_b_refresh_overwrites_both_variants() {
    let s = Scenario::new();
    s.subscribed().await;
    let embedded_before = s.query(true).await;
    let referenced_before = s.query(false).await;
    let calls_before = s.fetcher.calls_for(&s.key);

    assert!(s.feed.mutation(&s.endpoint).await);
    let fetcher = &s.fetcher;
    assert!(
        eventually(Duration::from_secs(2), move || async move {
            fetcher.calls_for(&QueryKey::new("X", "ds")) == calls_before + 2
        })
        .await
    );

    let relay = &s.relay;
    assert!(
        eventually(Duration::from_secs(2), move || {
            let embedded_before = embedded_before.clone();
            let referenced_before = referenced_before.clone();
            async move {
                let embedded = relay.query("X", "ds", true).await.ok();
                let referenced = relay.query("X", "ds", false).await.ok();
                embedded.is_some_and(|e| e != embedded_before)
                    && referenced.is_some_and(|r| r != referenced_before)
            }
        })
        .await
    );
    // Served from the refreshed caches, not refetched.
    assert_eq!(s.fetcher.calls_for(&s.key), calls_before + 2);
}

#[tokio::test]
async fn scenario_c_disconnect_forces_fresh_fetch_and_subscription() {
    let s = Scenario::new();
    s.subscribed().await;

    assert!(s.feed.disconnect(&s.endpoint).await);
    let relay = &s.relay;
    let cache_key = s.key.cache_key();
    assert!(
        eventually(Duration::from_secs(2), move || {
            let cache_key = cache_key.clone();
            async move {
                !relay.is_subscribed("X", "ds")
                    && !relay.manager().caches().referenced().contains(&cache_key)
            }
        })
        .await
    );
    assert!(s.feed.is_closed(&s.endpoint));

    let after = s.query(false).await;
    assert_eq!(s.fetcher.calls_for(&s.key), 2);
    assert_eq!(after.result[0].title, fixtures::versioned_title(&s.key, 2));
    assert_eq!(s.feed.open_count(&s.endpoint), 2);
    assert!(s.relay.is_subscribed("X", "ds"));
}

#[tokio::test]
async fn events_for_one_stream_apply_in_order() {
    let s = Scenario::new();
    s.subscribed().await;

    // A mutation queued behind a disconnect must not resurrect the entry.
    assert!(s.feed.disconnect(&s.endpoint).await);
    let _ = s.feed.push(&s.endpoint, StreamEvent::message("mutation", "{}")).await;

    let relay = &s.relay;
    assert!(
        eventually(Duration::from_secs(2), move || async move {
            !relay.is_subscribed("X", "ds")
        })
        .await
    );
    tokio::time::sleep(Duration::from_millis(50)).await;

    let caches = s.relay.manager().caches();
    assert!(!caches.referenced().contains(&s.key.cache_key()));
    assert_eq!(s.fetcher.calls_for(&s.key), 1);
}

#[tokio::test]
async fn transient_reset_keeps_cache_and_subscription() {
    let s = Scenario::new();
    s.subscribed().await;

    assert!(
        s.feed
            .push(
                &s.endpoint,
                StreamEvent::Error(tidings_core::StreamError::reset("connection reset")),
            )
            .await
    );
    assert!(s.feed.push(&s.endpoint, StreamEvent::Opened).await);
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(s.relay.is_subscribed("X", "ds"));
    s.query(false).await;
    assert_eq!(s.fetcher.calls_for(&s.key), 1);
}
