//! Tidings Upstream - Content Backend Access
//!
//! Everything that talks to the content backend over the network:
//!
//! - [`ContentFetcher`] / [`HttpContentClient`]: query and media requests
//! - [`fetch_with_media`]: the "with embedded media" fetch strategy
//! - [`ChangeFeed`] / [`SseChangeFeed`]: long-lived change-feed streams
//!
//! Nothing in this crate caches or retries requests; the change feed's
//! reconnect loop is the only retry policy.

pub mod client;
pub mod endpoints;
pub mod media;
pub mod sse;
pub mod stream;

pub use client::{ContentFetcher, HttpContentClient};
pub use endpoints::BackendEndpoints;
pub use media::fetch_with_media;
pub use sse::{SseDecoder, SseFrame};
pub use stream::{
    wait_for_close, ChangeFeed, ChangeStream, SseChangeFeed, StreamEvent, StreamHandle,
};
