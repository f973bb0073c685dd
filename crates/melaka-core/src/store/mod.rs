//! Durable document store for normalized records.
//!
//! The store holds one JSON document per record identifier plus a singleton
//! initialization marker. Writes go exclusively through [`DocumentStore::upsert`],
//! which merges top-level fields into any existing document (`$set` semantics)
//! so redelivered messages converge on the same state.
//!
//! # Backends
//!
//! - [`SqliteStore`] - SQLite file (WAL mode), shared by the writer and the read API
//!
//! # Versioning
//!
//! Each document carries the record's `lastModified` timestamp. An update
//! whose version is strictly older than the stored one is rejected as
//! [`UpsertOutcome::Stale`], so out-of-order redelivery cannot roll a record
//! back. Updates without a version are always applied.

mod schema;
mod sqlite;

pub use schema::SCHEMA_VERSION;
pub use sqlite::{SqliteStore, StoreConfig};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::Result;

/// What an upsert did to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertOutcome {
    /// No document existed; a new one was inserted.
    Inserted,
    /// An existing document was changed.
    Modified,
    /// An existing document already held exactly these fields.
    Unchanged,
    /// The stored document has a newer version; nothing was written.
    Stale,
}

impl UpsertOutcome {
    /// Label used for logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inserted => "inserted",
            Self::Modified => "modified",
            Self::Unchanged => "unchanged",
            Self::Stale => "stale",
        }
    }
}

/// Singleton record describing the state of the dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InitializationMarker {
    /// When the marker was first created.
    pub created_at: DateTime<Utc>,

    /// When a full backfill last finished, if ever.
    pub backfill_completed_at: Option<DateTime<Utc>>,
}

impl InitializationMarker {
    /// Whether a full backfill has completed.
    pub fn is_backfill_complete(&self) -> bool {
        self.backfill_completed_at.is_some()
    }
}

/// A keyed JSON document store with filter+upsert semantics.
///
/// Implementations must be safe to share across worker tasks.
pub trait DocumentStore: Send + Sync {
    /// Merge `fields` into the document for `id`, inserting it if absent.
    fn upsert(
        &self,
        id: &str,
        fields: &Map<String, Value>,
        version: Option<DateTime<Utc>>,
    ) -> Result<UpsertOutcome>;

    /// Look up the document for `id`.
    fn find(&self, id: &str) -> Result<Option<Value>>;

    /// Number of stored documents.
    fn count(&self) -> Result<u64>;

    /// Create the initialization marker if it does not exist.
    ///
    /// Returns `true` if this call created it. Safe under concurrent callers:
    /// at most one marker ever exists.
    fn ensure_marker(&self) -> Result<bool>;

    /// Read the initialization marker.
    fn marker(&self) -> Result<Option<InitializationMarker>>;

    /// Record that a full backfill has completed (creating the marker if needed).
    fn mark_backfill_complete(&self) -> Result<()>;
}
