//! Error types shared across the Melaka pipeline.

use thiserror::Error;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while handling records or talking to the store.
#[derive(Error, Debug)]
pub enum Error {
    /// A record is missing a required field or has the wrong shape.
    #[error("invalid record field '{field}': {reason}")]
    InvalidRecord {
        /// The name of the offending field.
        field: &'static str,
        /// Description of what's wrong.
        reason: String,
    },

    /// JSON parsing or serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// SQLite error from the document store.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A stored document could not be decoded.
    #[error("corrupt document for '{id}': {reason}")]
    CorruptDocument {
        /// Record identifier of the document.
        id: String,
        /// Why decoding failed.
        reason: String,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
