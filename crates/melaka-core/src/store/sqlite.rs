//! SQLite-backed [`DocumentStore`].

use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, OpenFlags, OptionalExtension, TransactionBehavior};
use serde_json::{Map, Value};

use super::schema;
use super::{DocumentStore, InitializationMarker, UpsertOutcome};
use crate::{Error, Result};

/// Configuration for the SQLite store.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Path to the SQLite database file.
    pub path: PathBuf,

    /// How long a writer waits on a locked database before failing (milliseconds).
    pub busy_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./data/melaka.db"),
            busy_timeout_ms: 5_000,
        }
    }
}

/// Document store on a single SQLite connection.
///
/// Thread-safe: the connection is guarded by a mutex, and every upsert runs
/// inside its own transaction.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create the store described by `config`.
    pub fn open(config: &StoreConfig) -> Result<Self> {
        if let Some(parent) = config.path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        tracing::info!("Opening document store at {}", config.path.display());

        let conn = Connection::open(&config.path)?;
        conn.busy_timeout(std::time::Duration::from_millis(config.busy_timeout_ms))?;

        // WAL lets the read API query while the writer is busy
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        schema::init_schema(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an existing store without write access.
    ///
    /// Fails if the database file does not exist.
    pub fn open_read_only<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        tracing::info!("Opening document store read-only at {}", path.display());

        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory store (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        schema::init_schema(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn format_ts(ts: DateTime<Utc>) -> String {
        ts.to_rfc3339_opts(SecondsFormat::Micros, true)
    }

    fn parse_ts(raw: &str) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(raw)
            .ok()
            .map(|ts| ts.with_timezone(&Utc))
    }

    fn decode_document(id: &str, raw: &str) -> Result<Map<String, Value>> {
        match serde_json::from_str(raw) {
            Ok(Value::Object(fields)) => Ok(fields),
            Ok(_) => Err(Error::CorruptDocument {
                id: id.to_string(),
                reason: "stored document is not an object".to_string(),
            }),
            Err(e) => Err(Error::CorruptDocument {
                id: id.to_string(),
                reason: e.to_string(),
            }),
        }
    }
}

impl DocumentStore for SqliteStore {
    fn upsert(
        &self,
        id: &str,
        fields: &Map<String, Value>,
        version: Option<DateTime<Utc>>,
    ) -> Result<UpsertOutcome> {
        let now = Utc::now().timestamp();
        let version_str = version.map(Self::format_ts);

        let mut conn = self.conn.lock();
        // Write lock up front: the read below must see the row this write replaces
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let existing: Option<(String, Option<String>)> = tx
            .query_row(
                "SELECT document, last_modified FROM cves WHERE cve_id = ?",
                [id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let outcome = match existing {
            None => {
                let document = serde_json::to_string(fields)?;
                tx.execute(
                    "INSERT INTO cves (cve_id, document, last_modified, created_at, updated_at)
                     VALUES (?, ?, ?, ?, ?)",
                    rusqlite::params![id, document, version_str, now, now],
                )?;
                UpsertOutcome::Inserted
            }
            Some((stored, stored_version)) => {
                let stored_version = stored_version.as_deref().and_then(Self::parse_ts);
                let is_stale = matches!(
                    (version, stored_version),
                    (Some(incoming), Some(current)) if incoming < current
                );

                if is_stale {
                    UpsertOutcome::Stale
                } else {
                    let current = Self::decode_document(id, &stored)?;
                    let mut merged = current.clone();
                    for (key, value) in fields {
                        merged.insert(key.clone(), value.clone());
                    }

                    if merged == current {
                        UpsertOutcome::Unchanged
                    } else {
                        let document = serde_json::to_string(&merged)?;
                        tx.execute(
                            "UPDATE cves
                             SET document = ?, last_modified = COALESCE(?, last_modified), updated_at = ?
                             WHERE cve_id = ?",
                            rusqlite::params![document, version_str, now, id],
                        )?;
                        UpsertOutcome::Modified
                    }
                }
            }
        };

        tx.commit()?;
        Ok(outcome)
    }

    fn find(&self, id: &str) -> Result<Option<Value>> {
        let conn = self.conn.lock();
        let stored: Option<String> = conn
            .query_row("SELECT document FROM cves WHERE cve_id = ?", [id], |row| {
                row.get(0)
            })
            .optional()?;

        match stored {
            Some(raw) => Ok(Some(Value::Object(Self::decode_document(id, &raw)?))),
            None => Ok(None),
        }
    }

    fn count(&self) -> Result<u64> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM cves", [], |row| row.get(0))?;
        Ok(count.max(0) as u64)
    }

    fn ensure_marker(&self) -> Result<bool> {
        let conn = self.conn.lock();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO metadata (singleton, created_at) VALUES (1, ?)",
            [Self::format_ts(Utc::now())],
        )?;
        Ok(inserted == 1)
    }

    fn marker(&self) -> Result<Option<InitializationMarker>> {
        let conn = self.conn.lock();
        let row: Option<(String, Option<String>)> = conn
            .query_row(
                "SELECT created_at, backfill_completed_at FROM metadata WHERE singleton = 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let Some((created_at, completed_at)) = row else {
            return Ok(None);
        };

        let created_at = Self::parse_ts(&created_at).ok_or_else(|| Error::CorruptDocument {
            id: "metadata".to_string(),
            reason: format!("invalid created_at '{}'", created_at),
        })?;

        Ok(Some(InitializationMarker {
            created_at,
            backfill_completed_at: completed_at.as_deref().and_then(Self::parse_ts),
        }))
    }

    fn mark_backfill_complete(&self) -> Result<()> {
        let now = Self::format_ts(Utc::now());
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO metadata (singleton, created_at, backfill_completed_at)
             VALUES (1, ?1, ?1)
             ON CONFLICT(singleton) DO UPDATE SET backfill_completed_at = excluded.backfill_completed_at",
            [now],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn fields(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    fn ts(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, day, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_open_and_reopen() {
        let tmp = TempDir::new().unwrap();
        let config = StoreConfig {
            path: tmp.path().join("nested/melaka.db"),
            ..Default::default()
        };

        {
            let store = SqliteStore::open(&config).unwrap();
            store
                .upsert("CVE-1", &fields(json!({"id": "CVE-1"})), None)
                .unwrap();
        }

        let store = SqliteStore::open(&config).unwrap();
        assert_eq!(store.count().unwrap(), 1);
    }

    #[test]
    fn test_insert_then_find() {
        let store = SqliteStore::open_in_memory().unwrap();
        let doc = fields(json!({"id": "CVE-1", "payload": {"id": "CVE-1"}}));

        assert_eq!(
            store.upsert("CVE-1", &doc, None).unwrap(),
            UpsertOutcome::Inserted
        );
        assert_eq!(store.find("CVE-1").unwrap(), Some(Value::Object(doc)));
        assert_eq!(store.find("CVE-2").unwrap(), None);
    }

    #[test]
    fn test_same_fields_twice_is_unchanged() {
        let store = SqliteStore::open_in_memory().unwrap();
        let doc = fields(json!({"id": "CVE-1", "payload": {"score": 7.5}}));

        store.upsert("CVE-1", &doc, Some(ts(1))).unwrap();
        let first = store.find("CVE-1").unwrap();

        assert_eq!(
            store.upsert("CVE-1", &doc, Some(ts(1))).unwrap(),
            UpsertOutcome::Unchanged
        );
        assert_eq!(store.find("CVE-1").unwrap(), first);
        assert_eq!(store.count().unwrap(), 1);
    }

    #[test]
    fn test_merge_preserves_absent_fields() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .upsert(
                "CVE-1",
                &fields(json!({"id": "CVE-1", "note": "kept", "payload": {"v": 1}})),
                None,
            )
            .unwrap();

        let outcome = store
            .upsert("CVE-1", &fields(json!({"payload": {"v": 2}})), None)
            .unwrap();
        assert_eq!(outcome, UpsertOutcome::Modified);

        let doc = store.find("CVE-1").unwrap().unwrap();
        assert_eq!(doc["note"], "kept");
        assert_eq!(doc["payload"]["v"], 2);
    }

    #[test]
    fn test_older_version_is_stale() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .upsert("CVE-1", &fields(json!({"payload": {"v": 2}})), Some(ts(2)))
            .unwrap();

        let outcome = store
            .upsert("CVE-1", &fields(json!({"payload": {"v": 1}})), Some(ts(1)))
            .unwrap();
        assert_eq!(outcome, UpsertOutcome::Stale);

        let doc = store.find("CVE-1").unwrap().unwrap();
        assert_eq!(doc["payload"]["v"], 2);
    }

    #[test]
    fn test_newer_version_applies() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .upsert("CVE-1", &fields(json!({"payload": {"v": 1}})), Some(ts(1)))
            .unwrap();

        let outcome = store
            .upsert("CVE-1", &fields(json!({"payload": {"v": 2}})), Some(ts(2)))
            .unwrap();
        assert_eq!(outcome, UpsertOutcome::Modified);
    }

    #[test]
    fn test_unversioned_update_applies() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .upsert("CVE-1", &fields(json!({"payload": {"v": 2}})), Some(ts(2)))
            .unwrap();

        let outcome = store
            .upsert("CVE-1", &fields(json!({"payload": {"v": 3}})), None)
            .unwrap();
        assert_eq!(outcome, UpsertOutcome::Modified);
    }

    #[test]
    fn test_ensure_marker_once() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert!(store.marker().unwrap().is_none());

        assert!(store.ensure_marker().unwrap());
        assert!(!store.ensure_marker().unwrap());

        let marker = store.marker().unwrap().unwrap();
        assert!(!marker.is_backfill_complete());
    }

    #[test]
    fn test_ensure_marker_concurrent() {
        let tmp = TempDir::new().unwrap();
        let config = StoreConfig {
            path: tmp.path().join("melaka.db"),
            ..Default::default()
        };
        // Initialize schema before racing
        drop(SqliteStore::open(&config).unwrap());

        let created: Vec<bool> = (0..8)
            .map(|_| {
                let config = config.clone();
                std::thread::spawn(move || {
                    let store = SqliteStore::open(&config).unwrap();
                    store.ensure_marker().unwrap()
                })
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .collect();

        assert_eq!(created.iter().filter(|c| **c).count(), 1);
    }

    #[test]
    fn test_mark_backfill_complete() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.mark_backfill_complete().unwrap();

        let marker = store.marker().unwrap().unwrap();
        assert!(marker.is_backfill_complete());
        assert!(!store.ensure_marker().unwrap());
    }

    #[test]
    fn test_shared_across_threads() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());

        let handles: Vec<_> = (0..4)
            .map(|n| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    let id = format!("CVE-{}", n);
                    store
                        .upsert(&id, &fields(json!({"id": id.clone()})), None)
                        .unwrap()
                })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.join().unwrap(), UpsertOutcome::Inserted);
        }
        assert_eq!(store.count().unwrap(), 4);
    }

    #[test]
    fn test_open_read_only_missing_file() {
        let tmp = TempDir::new().unwrap();
        assert!(SqliteStore::open_read_only(tmp.path().join("absent.db")).is_err());
    }
}
