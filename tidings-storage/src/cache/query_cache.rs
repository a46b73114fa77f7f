//! Bounded, time-expiring query cache with single-flight fills.
//!
//! Backed by `moka`'s async cache: entries expire a fixed TTL after
//! insertion, the store is capped at `max_entries` with least-recently-used
//! eviction, and concurrent misses for one key run the compute future once.
//!
//! A fill never overwrites a [`QueryCache::put`] or [`QueryCache::evict`]
//! that landed while it was computing: each key carries a write generation
//! that the fill checks before storing its result.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use moka::future::Cache;
use moka::notification::RemovalCause;
use moka::policy::EvictionPolicy;
use tidings_core::constants::{DEFAULT_CACHE_MAX_ENTRIES, DEFAULT_CACHE_TTL_SECS};
use tidings_core::{CacheKey, TidingsConfig};
use tokio::sync::Mutex;
use tracing::debug;

use super::read::CacheRead;
use super::stats::{CacheStats, StatCounters};

/// Configuration for one query cache instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    /// TTL for cached entries, measured from insertion.
    pub entry_ttl: Duration,
    /// Maximum number of entries before LRU eviction.
    pub max_entries: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            entry_ttl: Duration::from_secs(DEFAULT_CACHE_TTL_SECS),
            max_entries: DEFAULT_CACHE_MAX_ENTRIES,
        }
    }
}

impl CacheConfig {
    /// Create a new cache config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the cache settings from the runtime config.
    pub fn from_config(config: &TidingsConfig) -> Self {
        Self {
            entry_ttl: config.cache_ttl,
            max_entries: config.cache_max_entries,
        }
    }

    /// Set the entry TTL.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.entry_ttl = ttl;
        self
    }

    /// Set the max entries.
    pub fn with_max_entries(mut self, max: u64) -> Self {
        self.max_entries = max;
        self
    }
}

#[derive(Debug, Clone)]
struct Stamped<V> {
    value: V,
    cached_at: DateTime<Utc>,
}

impl<V> Stamped<V> {
    fn now(value: V) -> Self {
        Self {
            value,
            cached_at: Utc::now(),
        }
    }
}

/// Coordination state for one key, alive only while someone uses it.
#[derive(Debug, Default)]
struct KeySlot {
    /// Held for a whole fill. Later fillers wait, then re-read.
    fill: Mutex<()>,
    /// Held around every store, never across a compute.
    write: Mutex<()>,
    /// Bumped by every put and evict.
    generation: AtomicU64,
}

type Slots = DashMap<CacheKey, Arc<KeySlot>>;

/// A claim on a key's slot. The slot leaves the map with its last lease.
struct SlotLease<'a> {
    slots: &'a Slots,
    key: &'a CacheKey,
    slot: Arc<KeySlot>,
}

impl<'a> SlotLease<'a> {
    fn acquire(slots: &'a Slots, key: &'a CacheKey) -> Self {
        let slot = Arc::clone(slots.entry(key.clone()).or_default().value());
        Self { slots, key, slot }
    }
}

impl Drop for SlotLease<'_> {
    fn drop(&mut self) {
        // The map and this lease hold the only references.
        self.slots.remove_if(self.key, |_, slot| {
            Arc::ptr_eq(slot, &self.slot) && Arc::strong_count(slot) == 2
        });
    }
}

/// Key/value store that the request path reads.
///
/// Cloning is cheap; clones share the same entries and counters.
#[derive(Clone)]
pub struct QueryCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    name: &'static str,
    inner: Cache<CacheKey, Stamped<V>>,
    slots: Arc<Slots>,
    counters: Arc<StatCounters>,
    config: CacheConfig,
}

impl<V> QueryCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Create a cache. `name` only shows up in logs.
    pub fn new(name: &'static str, config: CacheConfig) -> Self {
        let counters = Arc::new(StatCounters::default());
        let listener_counters = Arc::clone(&counters);

        let inner = Cache::builder()
            .max_capacity(config.max_entries)
            .time_to_live(config.entry_ttl)
            .eviction_policy(EvictionPolicy::lru())
            .eviction_listener(move |key: Arc<CacheKey>, _value, cause| {
                if matches!(cause, RemovalCause::Size) {
                    listener_counters.record_eviction();
                    debug!(cache = name, cache_key = %key, "Evicted least-recently-used entry");
                }
            })
            .build();

        Self {
            name,
            inner,
            slots: Arc::new(DashMap::new()),
            counters,
            config,
        }
    }

    /// Return the cached value for `key`, or run `compute` and cache its result.
    ///
    /// Concurrent callers missing on the same key run `compute` once; the
    /// others wait and read what it stored. A failed computation is not
    /// cached and the next waiter computes again. If a put or evict lands
    /// while `compute` runs, the caller still gets the computed value but
    /// the cache keeps the newer write.
    pub async fn get_or_compute<F, Fut, E>(
        &self,
        key: &CacheKey,
        compute: F,
    ) -> Result<CacheRead<V>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        if let Some(read) = self.read_hit(key).await {
            return Ok(read);
        }

        let lease = SlotLease::acquire(&self.slots, key);
        let _filling = lease.slot.fill.lock().await;
        if let Some(read) = self.read_hit(key).await {
            return Ok(read);
        }

        let generation = lease.slot.generation.load(Ordering::Acquire);
        let stamped = Stamped::now(compute().await?);
        self.counters.record_miss();

        let _writing = lease.slot.write.lock().await;
        if lease.slot.generation.load(Ordering::Acquire) == generation {
            self.inner.insert(key.clone(), stamped.clone()).await;
            debug!(cache = self.name, cache_key = %key, "Cache miss, value computed");
        } else {
            debug!(
                cache = self.name,
                cache_key = %key,
                "Cache miss, newer write landed during compute; result not stored"
            );
        }
        Ok(CacheRead::from_upstream(stamped.value, stamped.cached_at))
    }

    async fn read_hit(&self, key: &CacheKey) -> Option<CacheRead<V>> {
        let stamped = self.inner.get(key).await?;
        self.counters.record_hit();
        debug!(cache = self.name, cache_key = %key, "Cache hit");
        Some(CacheRead::from_cache(stamped.value, stamped.cached_at))
    }

    /// Read without filling on a miss.
    pub async fn get(&self, key: &CacheKey) -> Option<CacheRead<V>> {
        self.inner
            .get(key)
            .await
            .map(|stamped| CacheRead::from_cache(stamped.value, stamped.cached_at))
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.inner.contains_key(key)
    }

    /// Insert or overwrite unconditionally. The TTL restarts.
    ///
    /// Never waits for an in-flight fill; the fill's result is dropped instead.
    pub async fn put(&self, key: CacheKey, value: V) {
        let lease = SlotLease::acquire(&self.slots, &key);
        let _writing = lease.slot.write.lock().await;
        lease.slot.generation.fetch_add(1, Ordering::AcqRel);
        debug!(cache = self.name, cache_key = %key, "Cache put");
        self.inner.insert(key.clone(), Stamped::now(value)).await;
    }

    /// Remove unconditionally. Absent keys are a no-op.
    pub async fn evict(&self, key: &CacheKey) {
        let lease = SlotLease::acquire(&self.slots, key);
        let _writing = lease.slot.write.lock().await;
        lease.slot.generation.fetch_add(1, Ordering::AcqRel);
        debug!(cache = self.name, cache_key = %key, "Cache evict");
        self.inner.invalidate(key).await;
    }

    /// Approximate entry count; call [`Self::sync`] first for an exact figure.
    pub fn entry_count(&self) -> u64 {
        self.inner.entry_count()
    }

    /// Apply pending evictions and expirations.
    pub async fn sync(&self) {
        self.inner.run_pending_tasks().await;
    }

    pub fn stats(&self) -> CacheStats {
        self.counters.snapshot(self.inner.entry_count())
    }
}

impl<V> std::fmt::Debug for QueryCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryCache")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("entry_count", &self.inner.entry_count())
            .field("active_keys", &self.slots.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tidings_core::QueryKey;

    fn key(query: &str) -> CacheKey {
        QueryKey::new(query, "production").cache_key()
    }

    fn small_cache(ttl: Duration, max: u64) -> QueryCache<String> {
        QueryCache::new("test", CacheConfig::new().with_ttl(ttl).with_max_entries(max))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_misses_compute_once() {
        let cache = small_cache(Duration::from_secs(60), 100);
        let calls = Arc::new(AtomicUsize::new(0));
        let k = key("slow");

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let cache = cache.clone();
            let calls = Arc::clone(&calls);
            let k = k.clone();
            tasks.push(tokio::spawn(async move {
                cache
                    .get_or_compute(&k, || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        Ok::<_, String>("computed".to_string())
                    })
                    .await
                    .map(CacheRead::into_value)
            }));
        }

        for result in futures_util::future::join_all(tasks).await {
            assert_eq!(result.unwrap().unwrap(), "computed");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 15);
    }

    #[tokio::test]
    async fn test_second_read_is_hit() {
        let cache = small_cache(Duration::from_secs(60), 100);
        let k = key("q");

        let first = cache
            .get_or_compute(&k, || async { Ok::<_, String>("v1".to_string()) })
            .await
            .unwrap();
        assert!(first.was_cache_miss());

        let second = cache
            .get_or_compute(&k, || async { Ok::<_, String>("v2".to_string()) })
            .await
            .unwrap();
        assert!(second.was_cache_hit());
        assert_eq!(second.into_value(), "v1");
    }

    #[tokio::test]
    async fn test_failures_are_not_cached() {
        let cache = small_cache(Duration::from_secs(60), 100);
        let k = key("failing");

        let err = cache
            .get_or_compute(&k, || async { Err::<String, _>("upstream 500".to_string()) })
            .await
            .unwrap_err();
        assert_eq!(err, "upstream 500");
        assert!(cache.get(&k).await.is_none());

        let ok = cache
            .get_or_compute(&k, || async { Ok::<_, String>("recovered".to_string()) })
            .await
            .unwrap();
        assert!(ok.was_cache_miss());
        assert_eq!(ok.into_value(), "recovered");
    }

    fn spawn_slow_fill(
        cache: &QueryCache<String>,
        k: &CacheKey,
        value: &'static str,
    ) -> tokio::task::JoinHandle<Result<CacheRead<String>, String>> {
        let cache = cache.clone();
        let k = k.clone();
        tokio::spawn(async move {
            cache
                .get_or_compute(&k, || async move {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    Ok::<_, String>(value.to_string())
                })
                .await
        })
    }

    #[tokio::test]
    async fn test_put_during_fill_is_kept() {
        let cache = small_cache(Duration::from_secs(60), 100);
        let k = key("racing");

        let fill = spawn_slow_fill(&cache, &k, "pre-mutation");
        tokio::time::sleep(Duration::from_millis(50)).await;
        cache.put(k.clone(), "post-mutation".to_string()).await;
        assert!(!fill.is_finished());

        let filled = fill.await.unwrap().unwrap();
        assert!(filled.was_cache_miss());
        assert_eq!(filled.into_value(), "pre-mutation");
        assert_eq!(
            cache.get(&k).await.map(CacheRead::into_value),
            Some("post-mutation".to_string())
        );
    }

    #[tokio::test]
    async fn test_evict_during_fill_is_kept() {
        let cache = small_cache(Duration::from_secs(60), 100);
        let k = key("racing");

        let fill = spawn_slow_fill(&cache, &k, "pre-teardown");
        tokio::time::sleep(Duration::from_millis(50)).await;
        cache.evict(&k).await;

        assert_eq!(fill.await.unwrap().unwrap().into_value(), "pre-teardown");
        assert!(cache.get(&k).await.is_none());

        // Once the race is over, fills store again.
        let refilled = cache
            .get_or_compute(&k, || async { Ok::<_, String>("refilled".to_string()) })
            .await
            .unwrap();
        assert!(refilled.was_cache_miss());
        assert_eq!(cache.get(&k).await.unwrap().into_value(), "refilled");
    }

    #[tokio::test]
    async fn test_waiter_after_failed_fill_computes() {
        let cache = small_cache(Duration::from_secs(60), 100);
        let k = key("flaky");

        let failing = {
            let cache = cache.clone();
            let k = k.clone();
            tokio::spawn(async move {
                cache
                    .get_or_compute(&k, || async {
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        Err::<String, _>("upstream 503".to_string())
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let waiter = cache
            .get_or_compute(&k, || async { Ok::<_, String>("second try".to_string()) })
            .await
            .unwrap();

        assert_eq!(failing.await.unwrap().unwrap_err(), "upstream 503");
        assert!(waiter.was_cache_miss());
        assert_eq!(waiter.into_value(), "second try");
        assert_eq!(cache.stats().misses, 1);
    }

    #[tokio::test]
    async fn test_entry_expires_after_ttl() {
        let cache = small_cache(Duration::from_millis(300), 100);
        let k = key("ttl");

        cache.put(k.clone(), "value".to_string()).await;

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(cache.get(&k).await.is_some());

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(cache.get(&k).await.is_none());
    }

    #[tokio::test]
    async fn test_put_overwrites_and_evict_removes() {
        let cache = small_cache(Duration::from_secs(60), 100);
        let k = key("q");

        cache.put(k.clone(), "old".to_string()).await;
        cache.put(k.clone(), "new".to_string()).await;
        assert_eq!(cache.get(&k).await.unwrap().into_value(), "new");

        cache.evict(&k).await;
        assert!(cache.get(&k).await.is_none());

        // Evicting an absent key is a no-op.
        cache.evict(&k).await;
        assert!(!cache.contains(&k));
    }

    #[tokio::test]
    async fn test_size_bound_enforced() {
        let cache = small_cache(Duration::from_secs(60), 3);

        for i in 0..10 {
            cache.put(key(&format!("q{}", i)), format!("v{}", i)).await;
            cache.sync().await;
        }

        assert!(cache.entry_count() <= 3);
        assert!(cache.get(&key("q9")).await.is_some());
        assert!(cache.stats().evictions >= 7);
    }
}
