//! Tidings Sync - Change-Feed Driven Query Cache
//!
//! Read-through cache for content backend queries, kept fresh by the
//! backend's change feed instead of polling:
//!
//! - [`ContentRelay`]: `query` / `fetch_image`, the request-path surface
//! - [`SubscriptionManager`]: opens, health-checks and tears down feeds
//! - [`EventDispatcher`]: per-feed state machine driving cache refreshes
//! - [`scheduler`]: health-check and weekly forced-refresh timers
//!
//! # Example
//!
//! ```ignore
//! use tidings_core::TidingsConfig;
//! use tidings_sync::ContentRelay;
//!
//! let config = TidingsConfig::from_env()?;
//! let relay = ContentRelay::from_config(&config)?;
//! let result = relay.query("*[_type == 'changelog']", "production", false).await?;
//! ```

pub mod dispatcher;
pub mod lifecycle;
pub mod registry;
pub mod relay;
pub mod scheduler;
pub mod telemetry;

pub use dispatcher::{ConnectionState, EventDispatcher};
pub use lifecycle::{SubscriptionManager, WeakManager};
pub use registry::{Subscription, SubscriptionRegistry};
pub use relay::ContentRelay;
pub use scheduler::{duration_until_next, RefreshSchedule};
pub use telemetry::{init_tracing, TelemetryConfig};
