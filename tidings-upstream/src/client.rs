//! Content backend HTTP client.

use async_trait::async_trait;
use reqwest::{Client, Response, Url};
use serde::Deserialize;
use tidings_core::{MediaRef, QueryKey, QueryResult, UpstreamError};
use tracing::{debug, info};

use crate::endpoints::BackendEndpoints;

/// Performs requests against the content backend.
///
/// Implementations are stateless with respect to caching and never retry:
/// any non-success response becomes an [`UpstreamError`] for the caller.
#[async_trait]
pub trait ContentFetcher: Send + Sync {
    /// Run a query and return its documents with media left as references.
    async fn fetch_query(&self, key: &QueryKey) -> Result<QueryResult, UpstreamError>;

    /// Fetch the raw bytes of one media binary.
    async fn fetch_media(&self, media: &MediaRef, dataset: &str) -> Result<Vec<u8>, UpstreamError>;
}

/// Error body returned by the backend on failed requests.
#[derive(Debug, Deserialize)]
struct BackendErrorBody {
    #[serde(default)]
    error: Option<BackendErrorDetail>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum BackendErrorDetail {
    Text(String),
    Object {
        #[serde(default)]
        description: Option<String>,
        #[serde(default)]
        message: Option<String>,
    },
}

/// Pull a human-readable message out of an error body, falling back to the raw text.
fn error_message(body: &str) -> String {
    let parsed = serde_json::from_str::<BackendErrorBody>(body).ok();
    let message = parsed.and_then(|b| match b.error {
        Some(BackendErrorDetail::Text(text)) => Some(text),
        Some(BackendErrorDetail::Object {
            description,
            message,
        }) => description.or(message),
        None => b.message,
    });

    match message {
        Some(message) => message,
        None if body.trim().is_empty() => "Unknown error".to_string(),
        None => body.trim().to_string(),
    }
}

/// reqwest-backed [`ContentFetcher`].
#[derive(Clone)]
pub struct HttpContentClient {
    client: Client,
    endpoints: BackendEndpoints,
}

impl HttpContentClient {
    pub fn new(endpoints: BackendEndpoints) -> Self {
        Self::with_client(Client::new(), endpoints)
    }

    /// Reuse an existing connection pool.
    pub fn with_client(client: Client, endpoints: BackendEndpoints) -> Self {
        Self { client, endpoints }
    }

    async fn get(&self, url: Url) -> Result<Response, UpstreamError> {
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| UpstreamError::transport(format!("HTTP request failed: {}", e)))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());
        let message = error_message(&body);
        debug!(%url, status = status.as_u16(), %message, "Upstream request rejected");
        Err(UpstreamError::from_status(status.as_u16(), message))
    }
}

#[async_trait]
impl ContentFetcher for HttpContentClient {
    async fn fetch_query(&self, key: &QueryKey) -> Result<QueryResult, UpstreamError> {
        info!(query = %key.query, dataset = %key.dataset, "Fetching query from upstream");
        let response = self.get(self.endpoints.query_url(key)).await?;
        response
            .json::<QueryResult>()
            .await
            .map_err(|e| UpstreamError::decode(format!("Failed to parse query result: {}", e)))
    }

    async fn fetch_media(&self, media: &MediaRef, dataset: &str) -> Result<Vec<u8>, UpstreamError> {
        debug!(media = %media, dataset, "Fetching media binary");
        let response = self.get(self.endpoints.media_url(media, dataset)).await?;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| UpstreamError::transport(format!("Failed to read media body: {}", e)))?;
        Ok(bytes.to_vec())
    }
}

impl std::fmt::Debug for HttpContentClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpContentClient")
            .field("project_id", &self.endpoints.project_id())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_message_from_object_description() {
        let body = r#"{"error":{"description":"param $appId referenced, but not provided","type":"queryParseError"}}"#;
        assert_eq!(
            error_message(body),
            "param $appId referenced, but not provided"
        );
    }

    #[test]
    fn test_error_message_from_string_error() {
        assert_eq!(error_message(r#"{"error":"Not Found"}"#), "Not Found");
    }

    #[test]
    fn test_error_message_from_top_level_message() {
        assert_eq!(
            error_message(r#"{"message":"Dataset not found"}"#),
            "Dataset not found"
        );
    }

    #[test]
    fn test_error_message_falls_back_to_body() {
        assert_eq!(error_message("Bad Gateway\n"), "Bad Gateway");
        assert_eq!(error_message(""), "Unknown error");
    }
}
