//! Feed records and their transport representations.
//!
//! A record moves through three shapes on its way into the store:
//!
//! ```text
//! [RawRecord] ──normalize──▶ [NormalizedMessage] ──encode──▶ [QueueMessage]
//!  (feed JSON)                 (id, payload, fetchedAt)       (key, value bytes)
//! ```
//!
//! The raw record is kept as opaque JSON. Only the identifier and the
//! `lastModified` timestamp are ever interpreted.

use std::borrow::Cow;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// Timestamp layouts used by the NVD API (no offset, implicitly UTC).
const FEED_TIMESTAMP_FORMATS: &[&str] = &["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S"];

/// One vulnerability as the feed delivers it (the `cve` object).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawRecord(pub Value);

impl RawRecord {
    /// The record's identifier, if present and a string.
    pub fn id(&self) -> Option<&str> {
        self.0.get("id").and_then(Value::as_str)
    }

    /// The record's `lastModified` timestamp, if present and parseable.
    pub fn last_modified(&self) -> Option<DateTime<Utc>> {
        last_modified_of(&self.0)
    }
}

/// Wrapper object around each record in a page (`{ "cve": { ... } }`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vulnerability {
    pub cve: RawRecord,
}

/// One page of the feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageResult {
    /// Total number of records the feed holds for this query.
    pub total_results: u64,

    /// Page size the feed applied to this request. The last page may hold
    /// fewer records.
    pub results_per_page: u64,

    /// Offset of the first record on this page.
    #[serde(default)]
    pub start_index: u64,

    /// Feed-side generation time of the page.
    #[serde(default)]
    pub timestamp: String,

    /// Records on this page, in feed order.
    #[serde(default)]
    pub vulnerabilities: Vec<Vulnerability>,
}

impl PageResult {
    /// Parsed page timestamp, falling back to the current time.
    pub fn fetched_at(&self) -> DateTime<Utc> {
        parse_feed_timestamp(&self.timestamp).unwrap_or_else(Utc::now)
    }

    /// Iterate over the raw records on this page.
    pub fn records(&self) -> impl Iterator<Item = &RawRecord> {
        self.vulnerabilities.iter().map(|v| &v.cve)
    }
}

/// A record normalized for transport through the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedMessage {
    /// Globally unique record identifier (e.g. `CVE-2024-12345`).
    pub id: String,

    /// The full raw record.
    pub payload: Value,

    /// When the page carrying this record was produced.
    pub fetched_at: DateTime<Utc>,
}

impl NormalizedMessage {
    /// Build a message from a raw feed record.
    ///
    /// Fails if the record has no non-empty string `id` or is not a JSON object.
    pub fn from_raw(raw: &RawRecord, fetched_at: DateTime<Utc>) -> Result<Self> {
        if !raw.0.is_object() {
            return Err(Error::InvalidRecord {
                field: "cve",
                reason: "record is not a JSON object".to_string(),
            });
        }

        let id = match raw.id() {
            Some(id) if !id.trim().is_empty() => id.trim().to_string(),
            Some(_) => {
                return Err(Error::InvalidRecord {
                    field: "id",
                    reason: "must not be empty".to_string(),
                });
            }
            None => {
                return Err(Error::InvalidRecord {
                    field: "id",
                    reason: "missing or not a string".to_string(),
                });
            }
        };

        Ok(Self {
            id,
            payload: raw.0.clone(),
            fetched_at,
        })
    }

    /// The payload's `lastModified` timestamp, used as the record version.
    pub fn last_modified(&self) -> Option<DateTime<Utc>> {
        last_modified_of(&self.payload)
    }

    /// Top-level fields to merge into the stored document.
    pub fn to_fields(&self) -> Result<Map<String, Value>> {
        match serde_json::to_value(self)? {
            Value::Object(fields) => Ok(fields),
            _ => Err(Error::InvalidRecord {
                field: "payload",
                reason: "message did not serialize to an object".to_string(),
            }),
        }
    }
}

/// A message as it travels through the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMessage {
    /// Partition key: the record identifier.
    pub key: Vec<u8>,

    /// UTF-8 JSON of a [`NormalizedMessage`].
    pub value: Vec<u8>,
}

impl QueueMessage {
    /// Encode a normalized message, keyed by its identifier.
    pub fn encode(message: &NormalizedMessage) -> Result<Self> {
        Ok(Self {
            key: message.id.as_bytes().to_vec(),
            value: serde_json::to_vec(message)?,
        })
    }

    /// Decode the value back into a normalized message.
    pub fn decode(&self) -> Result<NormalizedMessage> {
        Ok(serde_json::from_slice(&self.value)?)
    }

    /// The key as text, for logging.
    pub fn key_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.key)
    }
}

/// Parse a feed timestamp.
///
/// Accepts RFC 3339 as well as the offset-less layout the NVD API uses
/// (`2024-01-05T12:34:56.789`), which is interpreted as UTC.
pub fn parse_feed_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }

    FEED_TIMESTAMP_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
}

fn last_modified_of(value: &Value) -> Option<DateTime<Utc>> {
    value
        .get("lastModified")
        .and_then(Value::as_str)
        .and_then(parse_feed_timestamp)
}
