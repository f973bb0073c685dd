//! HTTP client for the NVD CVE 2.0 API.

use std::time::Duration;

use async_trait::async_trait;
use melaka_core::PageResult;
use reqwest::header::{HeaderMap, HeaderValue};
use tracing::debug;

use super::{FeedClient, FetchError};
use crate::error::{Error, Result};

/// Public NVD CVE endpoint.
pub const DEFAULT_NVD_URL: &str = "https://services.nvd.nist.gov/rest/json/cves/2.0";

/// Header carrying the API key (`apiKey`; names are case-insensitive).
const API_KEY_HEADER: &str = "apikey";

/// Header the NVD uses to explain a rejected request.
const MESSAGE_HEADER: &str = "message";

/// Configuration for [`NvdClient`].
#[derive(Debug, Clone)]
pub struct NvdClientConfig {
    /// Endpoint URL.
    pub base_url: String,

    /// Optional API key; raises the feed's rate limit.
    pub api_key: Option<String>,

    /// Timeout for a whole request, body included.
    pub request_timeout: Duration,
}

impl Default for NvdClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_NVD_URL.to_string(),
            api_key: None,
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// [`FeedClient`] backed by the NVD REST API.
pub struct NvdClient {
    http: reqwest::Client,
    base_url: String,
}

impl NvdClient {
    /// Build a client. The API key, if any, is sent with every request.
    pub fn new(config: NvdClientConfig) -> Result<Self> {
        let mut headers = HeaderMap::new();
        if let Some(key) = config.api_key.as_deref().filter(|k| !k.is_empty()) {
            let value = HeaderValue::from_str(key)
                .map_err(|e| Error::Config(format!("invalid NVD API key: {}", e)))?;
            headers.insert(API_KEY_HEADER, value);
        }

        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .default_headers(headers)
            .user_agent(concat!("melaka/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base_url: config.base_url,
        })
    }

    async fn get(&self, query: &[(&str, String)]) -> std::result::Result<PageResult, FetchError> {
        debug!(url = %self.base_url, ?query, "Requesting feed page");

        let response = self
            .http
            .get(&self.base_url)
            .query(query)
            .send()
            .await
            .map_err(|e| FetchError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = response
                .headers()
                .get(MESSAGE_HEADER)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
                .unwrap_or_else(|| status.canonical_reason().unwrap_or_default().to_string());
            return Err(FetchError::Status {
                status: status.as_u16(),
                message,
            });
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| FetchError::Transport(e.to_string()))?;

        serde_json::from_slice(&body).map_err(|e| FetchError::Body(e.to_string()))
    }
}

#[async_trait]
impl FeedClient for NvdClient {
    async fn fetch_page(
        &self,
        start_index: u64,
        results_per_page: u64,
    ) -> std::result::Result<PageResult, FetchError> {
        if results_per_page == 0 {
            return Err(FetchError::InvalidRequest(
                "resultsPerPage must be positive".to_string(),
            ));
        }

        self.get(&[
            ("startIndex", start_index.to_string()),
            ("resultsPerPage", results_per_page.to_string()),
        ])
        .await
    }

    async fn fetch_record(&self, cve_id: &str) -> std::result::Result<PageResult, FetchError> {
        let cve_id = cve_id.trim();
        if cve_id.is_empty() {
            return Err(FetchError::InvalidRequest(
                "CVE identifier must not be empty".to_string(),
            ));
        }

        self.get(&[("cveId", cve_id.to_string())]).await
    }
}
