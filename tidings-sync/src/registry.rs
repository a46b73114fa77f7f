//! Active change-feed subscriptions, keyed by listen endpoint.
//!
//! At most one [`Subscription`] exists per endpoint. Insertion is atomic
//! insert-if-absent and removal is remove-and-return, so racing
//! subscribe/teardown paths never act on a subscription twice. Removal can
//! be bound to a subscription id so that a stale trigger (an old timer, the
//! delivery task of a previous stream) cannot remove a newer subscription
//! on the same endpoint.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tidings_core::{CacheKey, ListenEndpoint, QueryKey};
use tidings_upstream::StreamHandle;
use tokio::task::AbortHandle;
use uuid::Uuid;

/// One open change feed and the cache entry it keeps fresh.
#[derive(Debug)]
pub struct Subscription {
    id: Uuid,
    endpoint: ListenEndpoint,
    key: QueryKey,
    cache_key: CacheKey,
    handle: StreamHandle,
    established: AtomicBool,
    /// Armed timers; `None` once the subscription has been closed.
    timers: Mutex<Option<Vec<AbortHandle>>>,
}

impl Subscription {
    pub fn new(endpoint: ListenEndpoint, key: QueryKey, handle: StreamHandle) -> Self {
        Self {
            id: Uuid::now_v7(),
            cache_key: key.cache_key(),
            endpoint,
            key,
            handle,
            established: AtomicBool::new(false),
            timers: Mutex::new(Some(Vec::new())),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn endpoint(&self) -> &ListenEndpoint {
        &self.endpoint
    }

    pub fn key(&self) -> &QueryKey {
        &self.key
    }

    pub fn cache_key(&self) -> &CacheKey {
        &self.cache_key
    }

    /// True once the backend has welcomed this subscription.
    pub fn is_established(&self) -> bool {
        self.established.load(Ordering::Acquire)
    }

    /// Record a welcome. Returns true only for the first one.
    pub fn mark_established(&self) -> bool {
        !self.established.swap(true, Ordering::AcqRel)
    }

    /// Keep `timer` so it is cancelled with the subscription.
    ///
    /// A timer attached after [`Self::close`] is aborted immediately.
    pub fn attach_timer(&self, timer: AbortHandle) {
        let mut timers = self.timers.lock().unwrap_or_else(|e| e.into_inner());
        match timers.as_mut() {
            Some(timers) => timers.push(timer),
            None => timer.abort(),
        }
    }

    /// Close the stream and cancel every timer. Returns false if already closed.
    pub fn close(&self) -> bool {
        let timers = self
            .timers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        for timer in timers.iter().flatten() {
            timer.abort();
        }
        let closed_stream = self.handle.close();
        timers.is_some() || closed_stream
    }

    pub fn is_closed(&self) -> bool {
        self.handle.is_closed()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.close();
    }
}

/// Concurrent map of endpoint to subscription.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    subscriptions: DashMap<ListenEndpoint, Arc<Subscription>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert the subscription built by `make` unless `endpoint` is taken.
    ///
    /// `make` runs under the endpoint's lock, so it is called at most once
    /// per vacancy; its second value is handed back to the caller untouched.
    /// Returns `None` if a subscription already existed.
    pub fn insert_if_absent<T, F>(
        &self,
        endpoint: &ListenEndpoint,
        make: F,
    ) -> Option<(Arc<Subscription>, T)>
    where
        F: FnOnce() -> (Subscription, T),
    {
        match self.subscriptions.entry(endpoint.clone()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(vacant) => {
                let (subscription, extra) = make();
                let subscription = Arc::new(subscription);
                vacant.insert(Arc::clone(&subscription));
                Some((subscription, extra))
            }
        }
    }

    pub fn get(&self, endpoint: &ListenEndpoint) -> Option<Arc<Subscription>> {
        self.subscriptions
            .get(endpoint)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// The subscription at `endpoint`, if it is still the one with `id`.
    pub fn get_current(&self, endpoint: &ListenEndpoint, id: Uuid) -> Option<Arc<Subscription>> {
        self.get(endpoint).filter(|sub| sub.id() == id)
    }

    pub fn contains(&self, endpoint: &ListenEndpoint) -> bool {
        self.subscriptions.contains_key(endpoint)
    }

    /// Remove and return whatever subscription holds `endpoint`.
    pub fn remove(&self, endpoint: &ListenEndpoint) -> Option<Arc<Subscription>> {
        self.subscriptions.remove(endpoint).map(|(_, sub)| sub)
    }

    /// Remove the subscription at `endpoint` only if its id is `id`.
    pub fn remove_if_current(
        &self,
        endpoint: &ListenEndpoint,
        id: Uuid,
    ) -> Option<Arc<Subscription>> {
        self.subscriptions
            .remove_if(endpoint, |_, sub| sub.id() == id)
            .map(|(_, sub)| sub)
    }

    pub fn endpoints(&self) -> Vec<ListenEndpoint> {
        self.subscriptions
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }
}
