//! One-time dataset initialization.
//!
//! The marker is a singleton row: creating it is a conditional insert, so
//! any number of processes may race on startup and exactly one reports that
//! it created the marker.
//!
//! A backfill is recorded as complete only when every record it found was
//! accepted by the queue; otherwise the next run scrapes the feed again.

use std::sync::Arc;

use melaka_core::DocumentStore;
use tracing::{info, warn};

use crate::error::Result;
use crate::feed::ScrapeStats;

/// Guards the store's initialization marker.
pub struct InitGuard {
    store: Arc<dyn DocumentStore>,
}

impl InitGuard {
    /// Create a guard over `store`.
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    /// Make sure the marker exists. Returns `true` if this call created it.
    pub fn ensure_initialized(&self) -> Result<bool> {
        let created = self.store.ensure_marker()?;
        if created {
            info!("Initialized dataset marker");
        } else {
            info!("Dataset already initialized");
        }
        Ok(created)
    }

    /// Whether a full backfill has completed before.
    pub fn backfill_completed(&self) -> Result<bool> {
        Ok(self
            .store
            .marker()?
            .is_some_and(|marker| marker.is_backfill_complete()))
    }

    /// Record the outcome of a backfill that walked the whole feed.
    ///
    /// Returns `true` if the backfill was marked complete. A run with failed
    /// publishes is left unmarked so the next start repeats it.
    pub fn record_backfill(&self, stats: &ScrapeStats) -> Result<bool> {
        if stats.publish_failures > 0 {
            warn!(
                published = stats.messages_published,
                failed = stats.publish_failures,
                "Backfill incomplete, will retry on next run"
            );
            return Ok(false);
        }

        self.store.mark_backfill_complete()?;
        info!(
            published = stats.messages_published,
            "Recorded backfill completion"
        );
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::feed::{FeedClient, FetchError, Scraper, ScraperConfig};
    use crate::pipeline::{Publisher, PublisherConfig};
    use crate::queue::MessageQueue;
    use async_trait::async_trait;
    use melaka_core::{PageResult, QueueMessage, RawRecord, SqliteStore, StoreConfig, Vulnerability};
    use serde_json::json;
    use std::time::Duration;
    use tempfile::TempDir;

    struct RejectingQueue;

    #[async_trait]
    impl MessageQueue for RejectingQueue {
        async fn publish(&self, _message: QueueMessage) -> Result<()> {
            Err(Error::Queue("broker unavailable".to_string()))
        }
    }

    /// A feed holding two records on a single page.
    struct SmallFeed;

    #[async_trait]
    impl FeedClient for SmallFeed {
        async fn fetch_page(
            &self,
            start_index: u64,
            results_per_page: u64,
        ) -> std::result::Result<PageResult, FetchError> {
            let vulnerabilities = ["CVE-2024-0001", "CVE-2024-0002"]
                .iter()
                .map(|id| Vulnerability {
                    cve: RawRecord(json!({"id": id, "lastModified": "2024-02-01T00:00:00.000"})),
                })
                .collect();
            Ok(PageResult {
                total_results: 2,
                results_per_page,
                start_index,
                timestamp: "2024-03-01T10:15:30.123".to_string(),
                vulnerabilities,
            })
        }

        async fn fetch_record(&self, _cve_id: &str) -> std::result::Result<PageResult, FetchError> {
            self.fetch_page(0, 1).await
        }
    }

    #[test]
    fn test_first_call_creates_marker() {
        let guard = InitGuard::new(Arc::new(SqliteStore::open_in_memory().unwrap()));
        assert!(guard.ensure_initialized().unwrap());
        assert!(!guard.ensure_initialized().unwrap());
        assert!(!guard.backfill_completed().unwrap());
    }

    #[test]
    fn test_clean_backfill_is_recorded() {
        let guard = InitGuard::new(Arc::new(SqliteStore::open_in_memory().unwrap()));
        guard.ensure_initialized().unwrap();
        let stats = ScrapeStats {
            pages_fetched: 3,
            messages_published: 5,
            ..Default::default()
        };

        assert!(guard.record_backfill(&stats).unwrap());
        assert!(guard.backfill_completed().unwrap());
        assert!(!guard.ensure_initialized().unwrap());
    }

    #[test]
    fn test_backfill_with_publish_failures_not_recorded() {
        let guard = InitGuard::new(Arc::new(SqliteStore::open_in_memory().unwrap()));
        guard.ensure_initialized().unwrap();
        let stats = ScrapeStats {
            pages_fetched: 3,
            records_normalized: 5,
            publish_failures: 5,
            ..Default::default()
        };

        assert!(!guard.record_backfill(&stats).unwrap());
        assert!(!guard.backfill_completed().unwrap());
    }

    #[test]
    fn test_partial_publish_failure_not_recorded() {
        let guard = InitGuard::new(Arc::new(SqliteStore::open_in_memory().unwrap()));
        guard.ensure_initialized().unwrap();
        let stats = ScrapeStats {
            messages_published: 4,
            publish_failures: 1,
            ..Default::default()
        };

        assert!(!guard.record_backfill(&stats).unwrap());
        assert!(!guard.backfill_completed().unwrap());
    }

    #[test]
    fn test_racing_processes_create_one_marker() {
        let dir = TempDir::new().unwrap();
        let config = StoreConfig {
            path: dir.path().join("melaka.db"),
            ..Default::default()
        };
        // Create the schema once so the racers only contend on the marker.
        drop(SqliteStore::open(&config).unwrap());

        let handles: Vec<_> = (0..6)
            .map(|_| {
                let config = config.clone();
                std::thread::spawn(move || {
                    let store = SqliteStore::open(&config).unwrap();
                    InitGuard::new(Arc::new(store)).ensure_initialized().unwrap()
                })
            })
            .collect();

        let created = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|created| *created)
            .count();
        assert_eq!(created, 1);
    }

    #[tokio::test]
    async fn test_rejected_backfill_runs_again() {
        let guard = InitGuard::new(Arc::new(SqliteStore::open_in_memory().unwrap()));
        guard.ensure_initialized().unwrap();
        let publisher = Publisher::new(Arc::new(RejectingQueue), PublisherConfig::default());
        let scraper = Scraper::new(
            SmallFeed,
            publisher,
            ScraperConfig {
                page_size: 10,
                max_attempts: 1,
                retry_delay: Duration::ZERO,
                page_delay: Duration::ZERO,
            },
        );

        let stats = scraper.fetch_all().await.unwrap();

        assert_eq!(stats.publish_failures, 2);
        assert!(!guard.record_backfill(&stats).unwrap());
        assert!(!guard.backfill_completed().unwrap());
    }
}
