//! Cache read results carrying hit/miss and age metadata.

use chrono::{DateTime, Utc};
use std::time::Duration;

/// Result of a cache read.
///
/// Callers that only need the value use [`CacheRead::into_value`]; the
/// metadata is there for logging and tests that need to tell a hit from
/// an upstream fetch.
#[derive(Debug, Clone)]
pub struct CacheRead<T> {
    value: T,
    /// When this value was inserted (or fetched, on a miss).
    cached_at: DateTime<Utc>,
    was_cache_hit: bool,
}

impl<T> CacheRead<T> {
    /// Create a read served from an existing entry.
    pub fn from_cache(value: T, cached_at: DateTime<Utc>) -> Self {
        Self {
            value,
            cached_at,
            was_cache_hit: true,
        }
    }

    /// Create a read whose value was just computed by this caller.
    pub fn from_upstream(value: T, cached_at: DateTime<Utc>) -> Self {
        Self {
            value,
            cached_at,
            was_cache_hit: false,
        }
    }

    pub fn into_value(self) -> T {
        self.value
    }

    pub fn value(&self) -> &T {
        &self.value
    }

    pub fn cached_at(&self) -> DateTime<Utc> {
        self.cached_at
    }

    /// Time since the value was cached. Zero if the clock went backwards.
    pub fn staleness(&self) -> Duration {
        Utc::now()
            .signed_duration_since(self.cached_at)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }

    pub fn was_cache_hit(&self) -> bool {
        self.was_cache_hit
    }

    pub fn was_cache_miss(&self) -> bool {
        !self.was_cache_hit
    }
}
