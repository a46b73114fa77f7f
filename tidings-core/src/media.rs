//! Media references.
//!
//! Backend asset ids look like `image-<id>-<w>x<h>-<ext>`. The media CDN
//! serves the same asset at `<id>-<w>x<h>.<ext>`.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

static EXTENSION_SUFFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"-([A-Za-z]+)$").expect("Invalid extension regex"));

const ASSET_PREFIX: &str = "image-";

/// CDN path of one media binary, relative to `images/{project}/{dataset}/`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MediaRef(String);

impl MediaRef {
    /// Normalise a backend asset id into a CDN path.
    ///
    /// Inputs that are already paths (no `image-` prefix, extension already
    /// dotted) pass through unchanged.
    pub fn from_asset_ref(asset_ref: &str) -> Self {
        let trimmed = asset_ref.trim().trim_matches('"');
        let dotted = EXTENSION_SUFFIX.replace(trimmed, ".$1");
        let path = dotted
            .strip_prefix(ASSET_PREFIX)
            .unwrap_or(dotted.as_ref())
            .to_string();
        Self(path)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MediaRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_asset_ref_normalised() {
        let media = MediaRef::from_asset_ref("image-abc123def-1200x800-png");
        assert_eq!(media.as_str(), "abc123def-1200x800.png");
    }

    #[test]
    fn test_quoted_ref_accepted() {
        let media = MediaRef::from_asset_ref("\"image-abc-10x10-jpg\"");
        assert_eq!(media.as_str(), "abc-10x10.jpg");
    }

    #[test]
    fn test_normalised_path_passes_through() {
        let media = MediaRef::from_asset_ref("abc-10x10.jpg");
        assert_eq!(media.as_str(), "abc-10x10.jpg");
    }
}
