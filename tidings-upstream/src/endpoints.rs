//! Backend URL construction.
//!
//! - query: `{api}/data/query/{dataset}?query=...`
//! - change feed: `{api}/data/listen/{dataset}?query=...&includeResult=false&visibility=query`
//! - media: `{cdn}/images/{project}/{dataset}/{ref}`

use reqwest::Url;
use tidings_core::{ConfigError, ListenEndpoint, MediaRef, QueryKey, TidingsConfig};

/// Resolved base URLs for one backend project.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendEndpoints {
    project_id: String,
    api_base: Url,
    cdn_base: Url,
}

impl BackendEndpoints {
    /// Parse and validate the base URLs from the runtime config.
    pub fn from_config(config: &TidingsConfig) -> Result<Self, ConfigError> {
        Self::new(
            config.project_id.clone(),
            &config.api_base_url(),
            &config.cdn_base,
        )
    }

    /// Build from explicit base URLs (used to point tests at a local server).
    pub fn new(
        project_id: impl Into<String>,
        api_base: &str,
        cdn_base: &str,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            project_id: project_id.into(),
            api_base: parse_base("api_base", api_base)?,
            cdn_base: parse_base("cdn_base", cdn_base)?,
        })
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn query_url(&self, key: &QueryKey) -> Url {
        let mut url = extend(&self.api_base, &["data", "query", &key.dataset]);
        url.query_pairs_mut().append_pair("query", &key.query);
        url
    }

    /// Change-feed URL for `key`; also the subscription identity.
    pub fn listen_endpoint(&self, key: &QueryKey) -> ListenEndpoint {
        let mut url = extend(&self.api_base, &["data", "listen", &key.dataset]);
        url.query_pairs_mut()
            .append_pair("query", &key.query)
            .append_pair("includeResult", "false")
            .append_pair("visibility", "query");
        ListenEndpoint::new(String::from(url))
    }

    pub fn media_url(&self, media: &MediaRef, dataset: &str) -> Url {
        extend(
            &self.cdn_base,
            &["images", &self.project_id, dataset, media.as_str()],
        )
    }
}

fn parse_base(field: &str, raw: &str) -> Result<Url, ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidValue {
        field: field.to_string(),
        value: raw.to_string(),
        reason,
    };

    let url = Url::parse(raw).map_err(|e| invalid(e.to_string()))?;
    if url.cannot_be_a_base() || !matches!(url.scheme(), "http" | "https") {
        return Err(invalid("expected an http(s) base URL".to_string()));
    }
    Ok(url)
}

/// Append path segments to a validated base URL.
fn extend(base: &Url, segments: &[&str]) -> Url {
    let mut url = base.clone();
    if let Ok(mut path) = url.path_segments_mut() {
        path.pop_if_empty().extend(segments);
    }
    url
}
