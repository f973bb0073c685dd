//! Core types and shared infrastructure for the Melaka CVE pipeline.
//!
//! This crate provides:
//! - Feed record types and their queue encoding ([`RawRecord`], [`NormalizedMessage`], [`QueueMessage`])
//! - The [`DocumentStore`] trait and its SQLite implementation
//! - Prometheus metrics helpers
//! - Shared error types

mod error;
pub mod metrics;
pub mod record;
pub mod store;

pub use error::{Error, Result};
pub use record::{
    NormalizedMessage, PageResult, QueueMessage, RawRecord, Vulnerability, parse_feed_timestamp,
};
pub use store::{DocumentStore, InitializationMarker, SqliteStore, StoreConfig, UpsertOutcome};
