//! Opening, health-checking and tearing down subscriptions.
//!
//! [`SubscriptionManager`] is the only writer of the registry. Background
//! tasks (stream delivery, timers) hold a [`WeakManager`] so that dropping
//! the last manager releases every stream.

use std::sync::{Arc, Weak};

use tidings_core::{ListenEndpoint, QueryKey};
use tidings_storage::CacheSet;
use tidings_upstream::{ChangeFeed, ContentFetcher};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::dispatcher::EventDispatcher;
use crate::registry::{Subscription, SubscriptionRegistry};
use crate::scheduler::{self, RefreshSchedule};

struct ManagerInner {
    registry: SubscriptionRegistry,
    caches: CacheSet,
    fetcher: Arc<dyn ContentFetcher>,
    feed: Arc<dyn ChangeFeed>,
    schedule: RefreshSchedule,
}

/// Owns the subscription registry and every mutation of it.
///
/// Cloning is cheap; clones share the same registry and caches.
#[derive(Clone)]
pub struct SubscriptionManager {
    inner: Arc<ManagerInner>,
}

/// Non-owning reference held by background tasks.
#[derive(Clone)]
pub struct WeakManager(Weak<ManagerInner>);

impl WeakManager {
    pub fn upgrade(&self) -> Option<SubscriptionManager> {
        self.0.upgrade().map(|inner| SubscriptionManager { inner })
    }
}

impl SubscriptionManager {
    pub fn new(
        fetcher: Arc<dyn ContentFetcher>,
        feed: Arc<dyn ChangeFeed>,
        caches: CacheSet,
        schedule: RefreshSchedule,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                registry: SubscriptionRegistry::new(),
                caches,
                fetcher,
                feed,
                schedule,
            }),
        }
    }

    pub fn downgrade(&self) -> WeakManager {
        WeakManager(Arc::downgrade(&self.inner))
    }

    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.inner.registry
    }

    pub fn caches(&self) -> &CacheSet {
        &self.inner.caches
    }

    pub fn fetcher(&self) -> &Arc<dyn ContentFetcher> {
        &self.inner.fetcher
    }

    pub fn schedule(&self) -> &RefreshSchedule {
        &self.inner.schedule
    }

    /// Open a change feed for `endpoint` unless one is already registered.
    ///
    /// The new subscription starts unestablished; if no welcome arrives
    /// within the health-check timeout it is torn down. Returns true when a
    /// subscription was created by this call.
    pub fn ensure_subscribed(&self, endpoint: &ListenEndpoint, key: &QueryKey) -> bool {
        let inserted = self.inner.registry.insert_if_absent(endpoint, || {
            let (handle, events) = self.inner.feed.open(endpoint).into_parts();
            (Subscription::new(endpoint.clone(), key.clone(), handle), events)
        });

        let Some((subscription, events)) = inserted else {
            debug!(endpoint = %endpoint, "Subscription already active");
            return false;
        };

        info!(
            endpoint = %endpoint,
            subscription_id = %subscription.id(),
            cache_key = %subscription.cache_key(),
            "Subscription opened"
        );

        let dispatcher = EventDispatcher::new(self.downgrade(), &subscription);
        tokio::spawn(dispatcher.run(events));

        self.arm_health_check(&subscription);
        true
    }

    fn arm_health_check(&self, subscription: &Subscription) {
        let weak = self.downgrade();
        let endpoint = subscription.endpoint().clone();
        let id = subscription.id();
        let timeout = self.inner.schedule.health_check_timeout;

        let timer = scheduler::after(timeout, async move {
            if let Some(manager) = weak.upgrade() {
                manager.check_established(&endpoint, id).await;
            }
        });
        subscription.attach_timer(timer);
    }

    /// Arm the weekly forced refresh for the subscription `id`.
    pub fn arm_forced_refresh(&self, subscription: &Subscription) {
        let weak = self.downgrade();
        let endpoint = subscription.endpoint().clone();
        let id = subscription.id();
        let schedule = self.inner.schedule;

        debug!(
            endpoint = %endpoint,
            weekday = ?schedule.forced_refresh_weekday,
            hour = schedule.forced_refresh_hour,
            "Forced refresh armed"
        );
        let timer = scheduler::weekly(schedule, move || {
            let weak = weak.clone();
            let endpoint = endpoint.clone();
            async move {
                if let Some(manager) = weak.upgrade() {
                    info!(endpoint = %endpoint, "Forced refresh");
                    manager.teardown_subscription(&endpoint, id).await;
                }
            }
        });
        subscription.attach_timer(timer);
    }

    async fn check_established(&self, endpoint: &ListenEndpoint, id: Uuid) {
        let Some(subscription) = self.inner.registry.get_current(endpoint, id) else {
            return;
        };
        if subscription.is_established() {
            return;
        }

        warn!(
            endpoint = %endpoint,
            timeout_secs = self.inner.schedule.health_check_timeout.as_secs(),
            "Subscription not established in time, tearing down"
        );
        self.teardown_subscription(endpoint, id).await;
    }

    /// Tear down whatever subscription holds `endpoint`.
    ///
    /// Idempotent: only the first caller has any effect.
    pub async fn teardown(&self, endpoint: &ListenEndpoint) -> bool {
        match self.inner.registry.remove(endpoint) {
            Some(subscription) => {
                self.finish_teardown(&subscription).await;
                true
            }
            None => {
                debug!(endpoint = %endpoint, "Teardown of absent subscription ignored");
                false
            }
        }
    }

    /// Tear down the subscription at `endpoint` only if it is still `id`.
    pub async fn teardown_subscription(&self, endpoint: &ListenEndpoint, id: Uuid) -> bool {
        match self.inner.registry.remove_if_current(endpoint, id) {
            Some(subscription) => {
                self.finish_teardown(&subscription).await;
                true
            }
            None => {
                debug!(endpoint = %endpoint, subscription_id = %id, "Subscription already gone");
                false
            }
        }
    }

    async fn finish_teardown(&self, subscription: &Subscription) {
        subscription.close();
        self.inner.caches.evict(subscription.cache_key()).await;
        info!(
            endpoint = %subscription.endpoint(),
            subscription_id = %subscription.id(),
            cache_key = %subscription.cache_key(),
            "Subscription torn down"
        );
    }

    /// Tear down every subscription. Returns how many were active.
    pub async fn teardown_all(&self) -> usize {
        let mut count = 0;
        for endpoint in self.inner.registry.endpoints() {
            if self.teardown(&endpoint).await {
                count += 1;
            }
        }
        count
    }

    /// Whether `id` still owns `endpoint`.
    pub fn is_current(&self, endpoint: &ListenEndpoint, id: Uuid) -> bool {
        self.inner.registry.get_current(endpoint, id).is_some()
    }
}

impl std::fmt::Debug for SubscriptionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionManager")
            .field("subscriptions", &self.inner.registry.len())
            .field("schedule", &self.inner.schedule)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tidings_storage::CacheConfig;
    use tidings_test_utils::{fixtures, ManualFeed, StubFetcher};

    fn setup() -> (SubscriptionManager, Arc<ManualFeed>) {
        let feed = Arc::new(ManualFeed::new());
        let manager = SubscriptionManager::new(
            Arc::new(StubFetcher::new()),
            feed.clone(),
            CacheSet::new(CacheConfig::default()),
            RefreshSchedule::from_config(&fixtures::test_config()),
        );
        (manager, feed)
    }

    fn endpoint() -> ListenEndpoint {
        ListenEndpoint::new("https://p.api.example.com/v1/data/listen/ds?query=q")
    }

    fn key() -> QueryKey {
        QueryKey::new("q", "ds")
    }

    #[tokio::test]
    async fn test_ensure_subscribed_opens_once() {
        let (manager, feed) = setup();
        assert!(manager.ensure_subscribed(&endpoint(), &key()));
        assert!(!manager.ensure_subscribed(&endpoint(), &key()));
        assert_eq!(feed.open_count(&endpoint()), 1);
        assert_eq!(manager.registry().len(), 1);
    }

    #[tokio::test]
    async fn test_teardown_twice_has_one_effect() {
        let (manager, feed) = setup();
        manager.ensure_subscribed(&endpoint(), &key());

        let (ep1, ep2) = (endpoint(), endpoint());
        let (first, second) = tokio::join!(manager.teardown(&ep1), manager.teardown(&ep2));
        assert!(first ^ second);
        assert!(!manager.teardown(&endpoint()).await);

        assert!(manager.registry().is_empty());
        assert!(feed.is_closed(&endpoint()));
        assert_eq!(feed.closed_count(&endpoint()), 1);
    }

    #[tokio::test]
    async fn test_teardown_evicts_both_caches() {
        let (manager, _feed) = setup();
        let cache_key = key().cache_key();
        manager
            .caches()
            .put_both(&cache_key, fixtures::result_with_titles(&["a"]), fixtures::result_with_titles(&["a"]))
            .await;
        manager.ensure_subscribed(&endpoint(), &key());

        manager.teardown(&endpoint()).await;

        assert!(!manager.caches().embedded().contains(&cache_key));
        assert!(!manager.caches().referenced().contains(&cache_key));
    }

    #[tokio::test]
    async fn test_stale_id_cannot_tear_down_newer_subscription() {
        let (manager, _feed) = setup();
        manager.ensure_subscribed(&endpoint(), &key());
        let old = manager.registry().get(&endpoint()).unwrap().id();
        manager.teardown(&endpoint()).await;
        manager.ensure_subscribed(&endpoint(), &key());

        assert!(!manager.teardown_subscription(&endpoint(), old).await);
        assert_eq!(manager.registry().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_manager_closes_streams() {
        let (manager, feed) = setup();
        manager.ensure_subscribed(&endpoint(), &key());
        drop(manager);

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(feed.is_closed(&endpoint()));
    }
}
