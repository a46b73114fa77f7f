//! Identity types for cached queries and their change feeds.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A query against one dataset. Identifies one cached result.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueryKey {
    pub query: String,
    pub dataset: String,
}

impl QueryKey {
    pub fn new(query: impl Into<String>, dataset: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            dataset: dataset.into(),
        }
    }

    /// Cache key shared by both cache instances: `"{query}.{dataset}"`.
    pub fn cache_key(&self) -> CacheKey {
        CacheKey(format!("{}.{}", self.query, self.dataset))
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} @ {}", self.query, self.dataset)
    }
}

/// Which of the two result variants a caller wants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MediaMode {
    /// Slide images replaced by their raw bytes.
    Embedded,
    /// Slide images left as asset references, fetched separately by id.
    Referenced,
}

impl MediaMode {
    pub fn from_with_media(with_media: bool) -> Self {
        if with_media {
            Self::Embedded
        } else {
            Self::Referenced
        }
    }
}

/// Key under which a query result is stored in the query caches.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<CacheKey> for String {
    fn from(key: CacheKey) -> Self {
        key.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Change-feed address the backend notifies on for one query+dataset.
///
/// This is the identity of a subscription: at most one subscription
/// exists per endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ListenEndpoint(String);

impl ListenEndpoint {
    pub fn new(url: impl Into<String>) -> Self {
        Self(url.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ListenEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
