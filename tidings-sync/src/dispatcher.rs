//! Per-subscription event handling.
//!
//! Each subscription gets one [`EventDispatcher`], running on its own task
//! and consuming that stream's events strictly in order. The dispatcher
//! never holds the subscription itself: every action re-resolves it in the
//! registry by id, so events that arrive after teardown are inert.
//!
//! ```text
//! Connecting --welcome--> Established --disconnect/closed--> Closed
//!      |                                                    ^
//!      +---------------- disconnect/closed -----------------+
//! ```

use futures_util::future::join;
use tidings_core::{CacheKey, ListenEndpoint, QueryKey};
use tidings_upstream::{fetch_with_media, StreamEvent};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::lifecycle::{SubscriptionManager, WeakManager};
use crate::registry::Subscription;

/// Backend event names on the change feed.
pub mod events {
    pub const WELCOME: &str = "welcome";
    pub const MUTATION: &str = "mutation";
    pub const DISCONNECT: &str = "disconnect";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Established,
    Closed,
}

pub struct EventDispatcher {
    manager: WeakManager,
    id: Uuid,
    endpoint: ListenEndpoint,
    key: QueryKey,
    cache_key: CacheKey,
    state: ConnectionState,
}

impl EventDispatcher {
    pub fn new(manager: WeakManager, subscription: &Subscription) -> Self {
        Self {
            manager,
            id: subscription.id(),
            endpoint: subscription.endpoint().clone(),
            key: subscription.key().clone(),
            cache_key: subscription.cache_key().clone(),
            state: ConnectionState::Connecting,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Consume `events` until the stream ends or the subscription closes.
    pub async fn run(mut self, mut events: mpsc::Receiver<StreamEvent>) {
        while let Some(event) = events.recv().await {
            let Some(manager) = self.manager.upgrade() else {
                break;
            };
            self.handle(&manager, event).await;
            if self.state == ConnectionState::Closed {
                break;
            }
        }
        debug!(endpoint = %self.endpoint, subscription_id = %self.id, "Event delivery stopped");
    }

    /// Apply one event.
    pub async fn handle(&mut self, manager: &SubscriptionManager, event: StreamEvent) {
        match event {
            StreamEvent::Opened => {
                debug!(endpoint = %self.endpoint, "Change feed open");
            }
            StreamEvent::Message { event, data, .. } => match event.as_str() {
                events::WELCOME => self.on_welcome(manager),
                events::MUTATION => self.on_mutation(manager).await,
                events::DISCONNECT => {
                    info!(endpoint = %self.endpoint, reason = %data, "Backend requested disconnect");
                    self.close(manager).await;
                }
                other => {
                    debug!(endpoint = %self.endpoint, event = other, "Ignoring unknown event");
                }
            },
            StreamEvent::Comment(_) => {}
            StreamEvent::Error(err) if err.is_transient() => {
                warn!(endpoint = %self.endpoint, error = %err, "Change feed reset");
            }
            StreamEvent::Error(err) => {
                error!(endpoint = %self.endpoint, error = %err, "Change feed failed");
            }
            StreamEvent::Closed => {
                info!(endpoint = %self.endpoint, "Change feed closed");
                self.close(manager).await;
            }
        }
    }

    fn on_welcome(&mut self, manager: &SubscriptionManager) {
        let Some(subscription) = manager.registry().get_current(&self.endpoint, self.id) else {
            return;
        };
        if subscription.mark_established() {
            info!(endpoint = %self.endpoint, "Subscription established");
            manager.arm_forced_refresh(&subscription);
        }
        self.state = ConnectionState::Established;
    }

    async fn on_mutation(&mut self, manager: &SubscriptionManager) {
        if !manager.is_current(&self.endpoint, self.id) {
            return;
        }
        debug!(endpoint = %self.endpoint, cache_key = %self.cache_key, "Mutation received, refreshing");

        let fetcher = manager.fetcher().as_ref();
        let (embedded, referenced) = join(
            fetch_with_media(fetcher, &self.key),
            fetcher.fetch_query(&self.key),
        )
        .await;

        if !manager.is_current(&self.endpoint, self.id) {
            debug!(endpoint = %self.endpoint, "Refresh finished after teardown, discarded");
            return;
        }

        let caches = manager.caches();
        match (embedded, referenced) {
            (Ok(embedded), Ok(referenced)) => {
                caches.put_both(&self.cache_key, embedded, referenced).await;
                // Teardown may have evicted between the check above and the put.
                if !manager.is_current(&self.endpoint, self.id) {
                    caches.evict(&self.cache_key).await;
                    return;
                }
                info!(cache_key = %self.cache_key, "Cache refreshed after mutation");
            }
            (Err(err), _) | (_, Err(err)) => {
                warn!(
                    cache_key = %self.cache_key,
                    status = err.status,
                    error = %err.message,
                    "Refresh after mutation failed, evicting"
                );
                caches.evict(&self.cache_key).await;
            }
        }
    }

    async fn close(&mut self, manager: &SubscriptionManager) {
        self.state = ConnectionState::Closed;
        manager.teardown_subscription(&self.endpoint, self.id).await;
    }
}

impl std::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("endpoint", &self.endpoint)
            .field("subscription_id", &self.id)
            .field("state", &self.state)
            .finish()
    }
}
