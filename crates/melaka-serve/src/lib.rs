//! Melaka Serve - HTTP read API for stored CVE records
//!
//! This crate exposes the documents the writer maintains in the Melaka
//! store. It never writes; the ingestion pipeline is the only writer.
//!
//! # Architecture
//!
//! - **AppState**: Shared application state (the document store)
//! - **Config**: Bind address and store path from the environment
//! - **Routes**: Endpoint handlers grouped by domain
//! - **ApiError**: Structured JSON error responses

mod error;
mod routes;
mod state;

pub use self::error::ApiError;
pub use self::routes::router;
pub use self::state::{AppState, Config};
