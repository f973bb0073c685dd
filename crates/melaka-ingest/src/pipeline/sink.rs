//! Applies queue messages to the document store.

use std::sync::Arc;

use melaka_core::{DocumentStore, NormalizedMessage, QueueMessage, UpsertOutcome};
use metrics::counter;
use tracing::{debug, info};

use crate::error::{Error, Result};

/// What applying one message did.
pub type ApplyOutcome = UpsertOutcome;

/// Idempotent upsert of normalized records into a [`DocumentStore`].
///
/// Applying the same message any number of times leaves the store as if it
/// had been applied once.
pub struct UpsertSink {
    store: Arc<dyn DocumentStore>,
}

impl UpsertSink {
    /// Create a sink writing to `store`.
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    /// Decode a message and upsert it, keyed by record identifier.
    ///
    /// Undecodable messages fail with [`Error::Poison`]; store failures are
    /// returned as-is.
    pub async fn apply(&self, message: &QueueMessage) -> Result<ApplyOutcome> {
        let normalized = Self::decode(message)?;
        let fields = normalized.to_fields()?;
        let version = normalized.last_modified();

        let store = Arc::clone(&self.store);
        let cve_id = normalized.id;
        let id = cve_id.clone();
        let outcome = tokio::task::spawn_blocking(move || store.upsert(&id, &fields, version))
            .await??;

        match outcome {
            UpsertOutcome::Inserted => info!(cve_id = %cve_id, "Inserted record"),
            UpsertOutcome::Modified => info!(cve_id = %cve_id, "Updated record"),
            UpsertOutcome::Unchanged => debug!(cve_id = %cve_id, "Record already up to date"),
            UpsertOutcome::Stale => {
                info!(cve_id = %cve_id, "Ignoring update older than stored record")
            }
        }
        counter!("sink_upserts_total", "outcome" => outcome.as_str()).increment(1);

        Ok(outcome)
    }

    /// Decode and validate a queue message.
    pub fn decode(message: &QueueMessage) -> Result<NormalizedMessage> {
        let normalized = message
            .decode()
            .map_err(|e| Error::Poison(format!("undecodable payload: {}", e)))?;

        if normalized.id.trim().is_empty() {
            return Err(Error::Poison("empty record identifier".to_string()));
        }

        if !message.key.is_empty() && message.key != normalized.id.as_bytes() {
            return Err(Error::Poison(format!(
                "key '{}' does not match record '{}'",
                message.key_str(),
                normalized.id
            )));
        }

        Ok(normalized)
    }
}
