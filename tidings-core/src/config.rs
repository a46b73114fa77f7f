//! Configuration Module
//!
//! Runtime settings for the upstream client, the query caches, the
//! subscription timers and the stream transport. Loaded from `TIDINGS_*`
//! environment variables with defaults from [`crate::constants`].

use std::time::Duration;

use chrono::Weekday;

use crate::constants::*;
use crate::error::ConfigError;

/// Log output format for the tracing subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Plain,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "plain" | "text" | "" => Ok(Self::Plain),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::InvalidValue {
                field: "TIDINGS_LOG_FORMAT".to_string(),
                value: other.to_string(),
                reason: "expected 'plain' or 'json'".to_string(),
            }),
        }
    }
}

/// Full runtime configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct TidingsConfig {
    // ========================================================================
    // Upstream
    // ========================================================================
    /// Backend project identifier, used as API subdomain and in media paths.
    pub project_id: String,
    /// API version path segment.
    pub api_version: String,
    /// API host without scheme; the project id is prepended.
    pub api_host: String,
    /// Base URL of the media CDN.
    pub cdn_base: String,

    // ========================================================================
    // Query cache
    // ========================================================================
    pub cache_ttl: Duration,
    pub cache_max_entries: u64,

    // ========================================================================
    // Subscriptions
    // ========================================================================
    /// Time allowed for a subscription to become established.
    pub health_check_timeout: Duration,
    pub forced_refresh_weekday: Weekday,
    /// UTC hour of the forced refresh, 0-23.
    pub forced_refresh_hour: u32,

    // ========================================================================
    // Stream transport
    // ========================================================================
    pub stream_retry_delay: Duration,
    pub stream_max_retries: u32,

    pub log_format: LogFormat,
}

impl TidingsConfig {
    /// Create a config for the given project with every other field defaulted.
    pub fn new(project_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            api_version: DEFAULT_API_VERSION.to_string(),
            api_host: DEFAULT_API_HOST.to_string(),
            cdn_base: DEFAULT_CDN_BASE.to_string(),
            cache_ttl: Duration::from_secs(DEFAULT_CACHE_TTL_SECS),
            cache_max_entries: DEFAULT_CACHE_MAX_ENTRIES,
            health_check_timeout: Duration::from_secs(DEFAULT_HEALTH_CHECK_SECS),
            forced_refresh_weekday: DEFAULT_FORCED_REFRESH_WEEKDAY,
            forced_refresh_hour: DEFAULT_FORCED_REFRESH_HOUR,
            stream_retry_delay: Duration::from_millis(DEFAULT_STREAM_RETRY_MS),
            stream_max_retries: DEFAULT_STREAM_MAX_RETRIES,
            log_format: LogFormat::Plain,
        }
    }

    /// Create TidingsConfig from environment variables.
    ///
    /// Environment variables:
    /// - `TIDINGS_PROJECT_ID`: Backend project id (required)
    /// - `TIDINGS_API_VERSION`: API version segment (default: v2021-10-21)
    /// - `TIDINGS_API_HOST`: API host (default: api.sanity.io)
    /// - `TIDINGS_CDN_BASE`: Media CDN base URL (default: https://cdn.sanity.io)
    /// - `TIDINGS_CACHE_TTL_SECS`: Query cache TTL (default: 3600)
    /// - `TIDINGS_CACHE_MAX_ENTRIES`: Entries per cache (default: 1000)
    /// - `TIDINGS_HEALTH_CHECK_SECS`: Subscription health-check timeout (default: 20)
    /// - `TIDINGS_FORCED_REFRESH_WEEKDAY`: Weekday of forced refresh (default: Mon)
    /// - `TIDINGS_FORCED_REFRESH_HOUR`: UTC hour of forced refresh (default: 3)
    /// - `TIDINGS_STREAM_RETRY_MS`: Reconnect delay (default: 3000)
    /// - `TIDINGS_STREAM_MAX_RETRIES`: Reconnect attempts before giving up (default: 5)
    /// - `TIDINGS_LOG_FORMAT`: "plain" or "json" (default: plain)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build a config from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let project_id = lookup("TIDINGS_PROJECT_ID")
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ConfigError::MissingRequired {
                field: "TIDINGS_PROJECT_ID".to_string(),
            })?;

        let mut config = Self::new(project_id);

        if let Some(version) = lookup("TIDINGS_API_VERSION") {
            config.api_version = version;
        }
        if let Some(host) = lookup("TIDINGS_API_HOST") {
            config.api_host = host;
        }
        if let Some(cdn) = lookup("TIDINGS_CDN_BASE") {
            config.cdn_base = cdn.trim_end_matches('/').to_string();
        }

        config.cache_ttl = Duration::from_secs(parse_or(
            &lookup,
            "TIDINGS_CACHE_TTL_SECS",
            DEFAULT_CACHE_TTL_SECS,
        )?);
        config.cache_max_entries =
            parse_or(&lookup, "TIDINGS_CACHE_MAX_ENTRIES", DEFAULT_CACHE_MAX_ENTRIES)?;
        config.health_check_timeout = Duration::from_secs(parse_or(
            &lookup,
            "TIDINGS_HEALTH_CHECK_SECS",
            DEFAULT_HEALTH_CHECK_SECS,
        )?);

        if let Some(raw) = lookup("TIDINGS_FORCED_REFRESH_WEEKDAY") {
            config.forced_refresh_weekday =
                raw.trim().parse::<Weekday>().map_err(|_| ConfigError::InvalidValue {
                    field: "TIDINGS_FORCED_REFRESH_WEEKDAY".to_string(),
                    value: raw.clone(),
                    reason: "expected a weekday name such as 'Mon'".to_string(),
                })?;
        }

        let hour = parse_or(
            &lookup,
            "TIDINGS_FORCED_REFRESH_HOUR",
            DEFAULT_FORCED_REFRESH_HOUR,
        )?;
        if hour > 23 {
            return Err(ConfigError::InvalidValue {
                field: "TIDINGS_FORCED_REFRESH_HOUR".to_string(),
                value: hour.to_string(),
                reason: "must be between 0 and 23".to_string(),
            });
        }
        config.forced_refresh_hour = hour;

        config.stream_retry_delay = Duration::from_millis(parse_or(
            &lookup,
            "TIDINGS_STREAM_RETRY_MS",
            DEFAULT_STREAM_RETRY_MS,
        )?);
        config.stream_max_retries =
            parse_or(&lookup, "TIDINGS_STREAM_MAX_RETRIES", DEFAULT_STREAM_MAX_RETRIES)?;

        if let Some(raw) = lookup("TIDINGS_LOG_FORMAT") {
            config.log_format = raw.parse()?;
        }

        Ok(config)
    }

    /// Base URL of the content API, e.g. `https://abc123.api.sanity.io/v2021-10-21`.
    pub fn api_base_url(&self) -> String {
        format!(
            "https://{}.{}/{}",
            self.project_id, self.api_host, self.api_version
        )
    }

    pub fn with_api_base(mut self, host: impl Into<String>, version: impl Into<String>) -> Self {
        self.api_host = host.into();
        self.api_version = version.into();
        self
    }

    pub fn with_cdn_base(mut self, cdn_base: impl Into<String>) -> Self {
        self.cdn_base = cdn_base.into();
        self
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    pub fn with_cache_max_entries(mut self, max: u64) -> Self {
        self.cache_max_entries = max;
        self
    }

    pub fn with_health_check_timeout(mut self, timeout: Duration) -> Self {
        self.health_check_timeout = timeout;
        self
    }

    pub fn with_forced_refresh(mut self, weekday: Weekday, hour: u32) -> Self {
        self.forced_refresh_weekday = weekday;
        self.forced_refresh_hour = hour.min(23);
        self
    }

    pub fn with_stream_retry(mut self, delay: Duration, max_retries: u32) -> Self {
        self.stream_retry_delay = delay;
        self.stream_max_retries = max_retries;
        self
    }
}

fn parse_or<F, T>(lookup: &F, field: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(field) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
            field: field.to_string(),
            value: raw.clone(),
            reason: "not a valid number".to_string(),
        }),
    }
}
