//! Error types for tidings operations

use thiserror::Error;

/// Status reported for failures that never produced an upstream response
/// (connection refused, malformed body, missing asset reference).
pub const BAD_GATEWAY: u16 = 502;

/// Non-success outcome of a request to the content backend.
///
/// Carries the upstream status code and message unchanged so the caller
/// can surface them as-is. Never retried by the cache layer.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Upstream request failed with status {status}: {message}")]
pub struct UpstreamError {
    pub status: u16,
    pub message: String,
}

impl UpstreamError {
    /// Build an error from a non-success response.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    /// The request never completed (DNS, connect, TLS, body read).
    pub fn transport(message: impl Into<String>) -> Self {
        Self::from_status(BAD_GATEWAY, message)
    }

    /// The backend answered but the payload could not be interpreted.
    pub fn decode(message: impl Into<String>) -> Self {
        Self::from_status(BAD_GATEWAY, message)
    }

    /// Returns true for 4xx statuses.
    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.status)
    }
}

/// Errors raised by a change-feed stream.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StreamError {
    /// The connection was reset or dropped; the transport reconnects on its own.
    #[error("Stream reset: {reason}")]
    Reset { reason: String },

    /// The connection cannot continue (rejected, retries exhausted, closed by server).
    #[error("Fatal stream error: {reason}")]
    Fatal { reason: String },
}

impl StreamError {
    pub fn reset(reason: impl Into<String>) -> Self {
        Self::Reset {
            reason: reason.into(),
        }
    }

    pub fn fatal(reason: impl Into<String>) -> Self {
        Self::Fatal {
            reason: reason.into(),
        }
    }

    /// Transient errors are recovered by the transport's reconnect loop.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Reset { .. })
    }
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },
}

/// Master error type for all tidings errors.
#[derive(Debug, Clone, Error)]
pub enum TidingsError {
    #[error("Upstream error: {0}")]
    Upstream(#[from] UpstreamError),

    #[error("Stream error: {0}")]
    Stream(#[from] StreamError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

/// Result type alias for tidings operations.
pub type TidingsResult<T> = Result<T, TidingsError>;
