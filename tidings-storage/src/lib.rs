//! Tidings Storage - Query Caches
//!
//! In-memory caches for query results. Nothing is persisted; a restart
//! starts from empty caches.

pub mod cache;

pub use cache::{CacheConfig, CacheRead, CacheSet, CacheStats, QueryCache};
