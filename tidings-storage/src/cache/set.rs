//! The two query caches kept side by side.
//!
//! One holds results with embedded media, the other results whose media
//! stay referenced by id. A change to the underlying data invalidates both,
//! so eviction always goes through [`CacheSet::evict`].

use tidings_core::{CacheKey, MediaMode, QueryResult};

use super::query_cache::{CacheConfig, QueryCache};
use super::stats::CacheStats;

#[derive(Debug, Clone)]
pub struct CacheSet {
    embedded: QueryCache<QueryResult>,
    referenced: QueryCache<QueryResult>,
}

impl CacheSet {
    /// Create both caches with the same configuration.
    pub fn new(config: CacheConfig) -> Self {
        Self {
            embedded: QueryCache::new("embedded", config.clone()),
            referenced: QueryCache::new("referenced", config),
        }
    }

    /// The cache serving the given variant.
    pub fn for_mode(&self, mode: MediaMode) -> &QueryCache<QueryResult> {
        match mode {
            MediaMode::Embedded => &self.embedded,
            MediaMode::Referenced => &self.referenced,
        }
    }

    pub fn embedded(&self) -> &QueryCache<QueryResult> {
        &self.embedded
    }

    pub fn referenced(&self) -> &QueryCache<QueryResult> {
        &self.referenced
    }

    /// Overwrite both variants for `key`.
    pub async fn put_both(&self, key: &CacheKey, embedded: QueryResult, referenced: QueryResult) {
        self.embedded.put(key.clone(), embedded).await;
        self.referenced.put(key.clone(), referenced).await;
    }

    /// Evict `key` from both caches.
    pub async fn evict(&self, key: &CacheKey) {
        self.embedded.evict(key).await;
        self.referenced.evict(key).await;
    }

    /// Stats for (embedded, referenced).
    pub fn stats(&self) -> (CacheStats, CacheStats) {
        (self.embedded.stats(), self.referenced.stats())
    }
}
