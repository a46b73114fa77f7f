//! Request-path entry point.
//!
//! [`ContentRelay`] answers queries from the caches, fetching on a miss,
//! and makes sure every non-empty result has a live change feed keeping
//! it fresh.

use std::sync::Arc;

use reqwest::Client;
use tidings_core::{
    ConfigError, MediaMode, MediaRef, QueryKey, QueryResult, TidingsConfig, UpstreamError,
};
use tidings_storage::{CacheConfig, CacheSet, CacheStats};
use tidings_upstream::{
    fetch_with_media, BackendEndpoints, ChangeFeed, ContentFetcher, HttpContentClient,
    SseChangeFeed,
};
use tracing::{debug, info};

use crate::lifecycle::SubscriptionManager;
use crate::scheduler::RefreshSchedule;

/// Asset ids carry this prefix; anything else is taken as a CDN path.
const ASSET_PREFIX: &str = "image-";

#[derive(Clone)]
pub struct ContentRelay {
    manager: SubscriptionManager,
    endpoints: BackendEndpoints,
}

impl ContentRelay {
    pub fn new(
        fetcher: Arc<dyn ContentFetcher>,
        feed: Arc<dyn ChangeFeed>,
        endpoints: BackendEndpoints,
        config: &TidingsConfig,
    ) -> Self {
        let caches = CacheSet::new(CacheConfig::from_config(config));
        let manager = SubscriptionManager::new(
            fetcher,
            feed,
            caches,
            RefreshSchedule::from_config(config),
        );
        Self { manager, endpoints }
    }

    /// Wire the HTTP client and SSE change feed against the configured backend.
    pub fn from_config(config: &TidingsConfig) -> Result<Self, ConfigError> {
        let endpoints = BackendEndpoints::from_config(config)?;
        let http = Client::new();
        let fetcher = Arc::new(HttpContentClient::with_client(http.clone(), endpoints.clone()));
        let feed = Arc::new(SseChangeFeed::from_config(http, config));

        info!(
            project_id = %config.project_id,
            api_base = %config.api_base_url(),
            cache_ttl_secs = config.cache_ttl.as_secs(),
            "Content relay configured"
        );
        Ok(Self::new(fetcher, feed, endpoints, config))
    }

    /// Results for `query_text` against `dataset`.
    ///
    /// Served from cache when present; otherwise fetched once (concurrent
    /// callers share the fetch) and cached. Upstream failures are returned
    /// unchanged and never cached. A non-empty result ensures a change feed
    /// is subscribed for the query.
    pub async fn query(
        &self,
        query_text: &str,
        dataset: &str,
        with_media: bool,
    ) -> Result<QueryResult, UpstreamError> {
        let key = QueryKey::new(query_text, dataset);
        let mode = MediaMode::from_with_media(with_media);
        let cache = self.manager.caches().for_mode(mode);

        let fetcher = Arc::clone(self.manager.fetcher());
        let fetch_key = key.clone();
        let read = cache
            .get_or_compute(&key.cache_key(), || async move {
                match mode {
                    MediaMode::Embedded => fetch_with_media(fetcher.as_ref(), &fetch_key).await,
                    MediaMode::Referenced => fetcher.fetch_query(&fetch_key).await,
                }
            })
            .await?;

        debug!(
            query = %key,
            ?mode,
            cache_hit = read.was_cache_hit(),
            age_ms = read.staleness().as_millis() as u64,
            "Query served"
        );

        let result = read.into_value();
        if !result.is_empty() {
            let endpoint = self.endpoints.listen_endpoint(&key);
            if !self.manager.registry().contains(&endpoint) {
                self.manager.ensure_subscribed(&endpoint, &key);
            }
        }
        Ok(result)
    }

    /// Raw bytes of one media binary. Accepts an asset id or a CDN path.
    pub async fn fetch_image(
        &self,
        media_ref: &str,
        dataset: &str,
    ) -> Result<Vec<u8>, UpstreamError> {
        let media = MediaRef::from_asset_ref(media_ref);
        if media_ref.starts_with(ASSET_PREFIX) {
            debug!(asset_ref = media_ref, path = %media, "Normalised media reference");
        }
        self.manager.fetcher().fetch_media(&media, dataset).await
    }

    /// Tear down every subscription and evict their cache entries.
    pub async fn shutdown(&self) -> usize {
        let closed = self.manager.teardown_all().await;
        info!(closed, "Content relay shut down");
        closed
    }

    pub fn subscription_count(&self) -> usize {
        self.manager.registry().len()
    }

    /// Whether a change feed is active for `query_text` on `dataset`.
    pub fn is_subscribed(&self, query_text: &str, dataset: &str) -> bool {
        let key = QueryKey::new(query_text, dataset);
        self.manager
            .registry()
            .contains(&self.endpoints.listen_endpoint(&key))
    }

    /// Stats for the (embedded, referenced) caches.
    pub fn cache_stats(&self) -> (CacheStats, CacheStats) {
        self.manager.caches().stats()
    }

    pub fn endpoints(&self) -> &BackendEndpoints {
        &self.endpoints
    }

    pub fn manager(&self) -> &SubscriptionManager {
        &self.manager
    }
}

impl std::fmt::Debug for ContentRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentRelay")
            .field("project_id", &self.endpoints.project_id())
            .field("subscriptions", &self.subscription_count())
            .finish()
    }
}
