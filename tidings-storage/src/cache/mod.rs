//! Query result caches.
//!
//! [`QueryCache`] is a bounded, TTL-expiring store with single-flight
//! fills. [`CacheSet`] pairs the embedded-media and referenced-media
//! instances and evicts them together.
//!
//! # Example
//!
//! ```ignore
//! let caches = CacheSet::new(CacheConfig::from_config(&config));
//! let read = caches
//!     .for_mode(MediaMode::Referenced)
//!     .get_or_compute(&key.cache_key(), || fetcher.fetch_query(&key))
//!     .await?;
//!
//! if read.was_cache_hit() {
//!     tracing::debug!(age = ?read.staleness(), "Served from cache");
//! }
//! ```

pub mod query_cache;
pub mod read;
pub mod set;
pub mod stats;

pub use query_cache::{CacheConfig, QueryCache};
pub use read::CacheRead;
pub use set::CacheSet;
pub use stats::CacheStats;
