//! Tracing subscriber setup.

use tidings_core::{ConfigError, LogFormat, TidingsConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_FILTER: &str = "tidings_sync=info,tidings_upstream=info,tidings_storage=warn,info";

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryConfig {
    pub format: LogFormat,
    /// Filter used when `RUST_LOG` is unset.
    pub default_filter: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Plain,
            default_filter: DEFAULT_FILTER.to_string(),
        }
    }
}

impl TelemetryConfig {
    pub fn from_config(config: &TidingsConfig) -> Self {
        Self {
            format: config.log_format,
            ..Default::default()
        }
    }

    fn env_filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.default_filter))
    }
}

/// Install the global tracing subscriber.
///
/// Call once at startup; a second call fails with [`ConfigError`].
pub fn init_tracing(config: &TelemetryConfig) -> Result<(), ConfigError> {
    let registry = tracing_subscriber::registry().with(config.env_filter());
    let result = match config.format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).try_init(),
        LogFormat::Plain => registry.with(tracing_subscriber::fmt::layer()).try_init(),
    };

    result.map_err(|e| ConfigError::InvalidValue {
        field: "tracing".to_string(),
        value: format!("{:?}", config.format),
        reason: format!("Failed to init subscriber: {}", e),
    })?;

    tracing::info!(format = ?config.format, "Tracing initialized");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_telemetry_config_from_runtime_config() {
        let mut config = TidingsConfig::new("p");
        config.log_format = LogFormat::Json;
        let telemetry = TelemetryConfig::from_config(&config);
        assert_eq!(telemetry.format, LogFormat::Json);
        assert_eq!(telemetry.default_filter, DEFAULT_FILTER);
    }

    #[test]
    fn test_second_init_is_an_error() {
        let config = TelemetryConfig::default();
        // Another test may have installed a subscriber first; either way
        // the call after this one must fail.
        let _ = init_tracing(&config);
        assert!(init_tracing(&config).is_err());
    }
}
