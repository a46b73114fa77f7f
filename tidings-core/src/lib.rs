//! Tidings Core - Shared Types
//!
//! Data types, error taxonomy and configuration shared by every tidings
//! crate. No I/O and no async code lives here.

pub mod config;
pub mod constants;
pub mod document;
pub mod error;
pub mod key;
pub mod media;

pub use config::{LogFormat, TidingsConfig};
pub use document::{asset_ref_of, Entry, LinkAttributes, Modal, QueryResult, Slide, SlideImage};
pub use error::{
    ConfigError, StreamError, TidingsError, TidingsResult, UpstreamError, BAD_GATEWAY,
};
pub use key::{CacheKey, ListenEndpoint, MediaMode, QueryKey};
pub use media::MediaRef;
