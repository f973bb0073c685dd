//! Error types for the ingestion pipeline.

use thiserror::Error;

use crate::feed::FetchError;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during ingestion.
#[derive(Error, Debug)]
pub enum Error {
    /// Record, serialization or store error from the core crate.
    #[error(transparent)]
    Core(#[from] melaka_core::Error),

    /// A single feed request failed in a way that retrying cannot fix.
    #[error("feed request failed: {0}")]
    Fetch(#[from] FetchError),

    /// Every attempt to fetch a page failed.
    #[error("giving up on page at offset {offset} after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        /// Offset of the page that could not be fetched.
        offset: u64,
        /// Number of attempts made.
        attempts: u32,
        /// The error from the final attempt.
        last_error: FetchError,
    },

    /// The feed reported more records but a page size of zero.
    #[error("feed stalled at offset {offset}: resultsPerPage is 0 but totalResults is {total}")]
    StalledPagination {
        /// Offset of the stalled page.
        offset: u64,
        /// Total results reported by that page.
        total: u64,
    },

    /// A queue message that can never be processed.
    #[error("poison message: {0}")]
    Poison(String),

    /// Queue transport error.
    #[error("queue error: {0}")]
    Queue(String),

    /// Kafka client error.
    #[cfg(feature = "kafka")]
    #[error("Kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    /// A spawned task panicked or was cancelled.
    #[error("task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Whether this error marks a message as unprocessable regardless of retries.
    pub fn is_poison(&self) -> bool {
        matches!(self, Self::Poison(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retries_exhausted_display() {
        let err = Error::RetriesExhausted {
            offset: 2000,
            attempts: 10,
            last_error: FetchError::Status {
                status: 503,
                message: "Service Unavailable".to_string(),
            },
        };
        let msg = err.to_string();
        assert!(msg.contains("offset 2000"));
        assert!(msg.contains("10 attempts"));
        assert!(msg.contains("503"));
    }

    #[test]
    fn test_stalled_pagination_display() {
        let err = Error::StalledPagination {
            offset: 4,
            total: 10,
        };
        assert!(err.to_string().contains("resultsPerPage is 0"));
    }

    #[test]
    fn test_is_poison() {
        assert!(Error::Poison("empty id".to_string()).is_poison());
        assert!(!Error::Queue("broker down".to_string()).is_poison());
    }

    #[test]
    fn test_from_core_error() {
        let core = melaka_core::Error::InvalidRecord {
            field: "id",
            reason: "missing".to_string(),
        };
        let err: Error = core.into();
        assert!(matches!(err, Error::Core(_)));
        assert!(err.to_string().contains("invalid record field"));
    }
}
