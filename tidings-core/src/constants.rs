//! Default values for tidings configuration.
//!
//! Centralised so the config loader, the builders and the tests agree.

// ============================================================================
// UPSTREAM
// ============================================================================

/// Default content API version segment.
pub const DEFAULT_API_VERSION: &str = "v2021-10-21";

/// Default content API host; the project id is prepended as a subdomain.
pub const DEFAULT_API_HOST: &str = "api.sanity.io";

/// Default CDN base for media binaries.
pub const DEFAULT_CDN_BASE: &str = "https://cdn.sanity.io";

// ============================================================================
// QUERY CACHE
// ============================================================================

/// Default time-to-live for cached query results, measured from insertion (1 hour).
pub const DEFAULT_CACHE_TTL_SECS: u64 = 3600;

/// Default maximum number of entries per cache instance.
pub const DEFAULT_CACHE_MAX_ENTRIES: u64 = 1000;

// ============================================================================
// SUBSCRIPTIONS
// ============================================================================

/// Time a new subscription has to receive its "welcome" before it is torn down.
pub const DEFAULT_HEALTH_CHECK_SECS: u64 = 20;

/// Weekday of the forced refresh (UTC).
pub const DEFAULT_FORCED_REFRESH_WEEKDAY: chrono::Weekday = chrono::Weekday::Mon;

/// Hour of the forced refresh (UTC, 0-23).
pub const DEFAULT_FORCED_REFRESH_HOUR: u32 = 3;

// ============================================================================
// STREAM TRANSPORT
// ============================================================================

/// Delay before reconnecting after a transient stream error.
pub const DEFAULT_STREAM_RETRY_MS: u64 = 3000;

/// Consecutive failed reconnects before the stream is declared closed.
pub const DEFAULT_STREAM_MAX_RETRIES: u32 = 5;
