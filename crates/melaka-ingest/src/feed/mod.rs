//! Feed access: the HTTP client and the paginating scraper on top of it.
//!
//! # Architecture
//!
//! ```text
//! [FeedClient] ──pages──▶ [Scraper] ──normalized batches──▶ [Publisher]
//!  one request per call     retry, offsets, rate limit        (pipeline)
//! ```
//!
//! The client never retries on its own. Retry policy and offset bookkeeping
//! live in the [`Scraper`], which is generic over [`FeedClient`] so tests can
//! script page sequences and failures.

mod nvd;
mod scraper;

pub use nvd::{DEFAULT_NVD_URL, NvdClient, NvdClientConfig};
pub use scraper::{ScrapeStats, Scraper, ScraperConfig};

use std::sync::Arc;

use async_trait::async_trait;
use melaka_core::PageResult;
use thiserror::Error;

/// Failure of a single feed request.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// Connection, TLS or timeout failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// The feed answered with a non-success status.
    #[error("unexpected response status {status}: {message}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// The feed's `message` header, or the status reason.
        message: String,
    },

    /// The body was not a valid page.
    #[error("malformed response body: {0}")]
    Body(String),

    /// The request itself was invalid; retrying cannot help.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl FetchError {
    /// Whether the scraper should retry after this error.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::InvalidRequest(_))
    }
}

/// A paginated source of vulnerability records.
#[async_trait]
pub trait FeedClient: Send + Sync {
    /// Fetch the page starting at `start_index` holding up to `results_per_page` records.
    ///
    /// Issues exactly one request. `results_per_page` must be positive.
    async fn fetch_page(
        &self,
        start_index: u64,
        results_per_page: u64,
    ) -> Result<PageResult, FetchError>;

    /// Fetch a single record by identifier.
    ///
    /// The result is a page holding zero or one records.
    async fn fetch_record(&self, cve_id: &str) -> Result<PageResult, FetchError>;
}

#[async_trait]
impl<T: FeedClient + ?Sized> FeedClient for Arc<T> {
    async fn fetch_page(
        &self,
        start_index: u64,
        results_per_page: u64,
    ) -> Result<PageResult, FetchError> {
        (**self).fetch_page(start_index, results_per_page).await
    }

    async fn fetch_record(&self, cve_id: &str) -> Result<PageResult, FetchError> {
        (**self).fetch_record(cve_id).await
    }
}
