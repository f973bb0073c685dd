//! Paginated backfill over a [`FeedClient`].
//!
//! The scraper walks the feed from offset 0, one page at a time:
//!
//! 1. Fetch the page, retrying up to `max_attempts` times.
//! 2. Normalize its records, skipping malformed ones.
//! 3. Hand the batch to the [`Publisher`] and wait for every publish to settle.
//! 4. Sleep `page_delay`, then continue at `offset + resultsPerPage`.
//!
//! The loop ends once the next offset exceeds `totalResults` as reported by
//! the most recent page, so a feed whose size is an exact multiple of the
//! page size ends with one empty page. A page that reports zero results per
//! page while records remain is a fatal error rather than an infinite loop.
//! An empty feed ends after its first page.

use std::collections::HashSet;
use std::future::Future;
use std::time::Duration;

use melaka_core::{NormalizedMessage, PageResult};
use metrics::{counter, gauge};
use tracing::{debug, info, warn};

use super::{FeedClient, FetchError};
use crate::error::{Error, Result};
use crate::pipeline::{BatchResult, Publisher};

/// Configuration for the scraper.
#[derive(Debug, Clone)]
pub struct ScraperConfig {
    /// Records requested per page.
    pub page_size: u64,

    /// Attempts per page before giving up (at least 1).
    pub max_attempts: u32,

    /// Pause between failed attempts.
    pub retry_delay: Duration,

    /// Pause between pages, to respect the feed's rate limit.
    pub page_delay: Duration,
}

impl Default for ScraperConfig {
    fn default() -> Self {
        Self {
            page_size: 1000,
            max_attempts: 10,
            retry_delay: Duration::from_secs(5),
            page_delay: Duration::from_secs(10),
        }
    }
}

/// Counters accumulated over one scrape.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScrapeStats {
    /// Pages fetched successfully.
    pub pages_fetched: u64,
    /// Fetch attempts made, including failed ones.
    pub fetch_attempts: u64,
    /// Records seen on fetched pages.
    pub records_seen: u64,
    /// Records normalized and handed to the publisher.
    pub records_normalized: u64,
    /// Records skipped (malformed or repeated within a page).
    pub records_skipped: u64,
    /// Messages the queue accepted.
    pub messages_published: u64,
    /// Messages that failed to publish.
    pub publish_failures: u64,
}

impl ScrapeStats {
    fn absorb(&mut self, batch: &BatchResult) {
        self.messages_published += batch.published;
        self.publish_failures += batch.failed;
    }
}

/// Walks a feed and publishes every record it finds.
pub struct Scraper<C> {
    client: C,
    publisher: Publisher,
    config: ScraperConfig,
}

impl<C: FeedClient> Scraper<C> {
    /// Create a scraper.
    pub fn new(client: C, publisher: Publisher, config: ScraperConfig) -> Self {
        Self {
            client,
            publisher,
            config,
        }
    }

    /// Fetch every page of the feed and publish its records.
    ///
    /// Returns an error if a page exhausts its retries or the feed stalls;
    /// pages already published stay published.
    pub async fn fetch_all(&self) -> Result<ScrapeStats> {
        let mut stats = ScrapeStats::default();
        gauge!("scraper_running").set(1.0);
        let result = self.run_pages(&mut stats).await;
        gauge!("scraper_running").set(0.0);
        result.map(|()| stats)
    }

    /// Fetch a single record by identifier and publish it.
    ///
    /// An unknown identifier is not an error: the returned stats show no records.
    pub async fn fetch_one(&self, cve_id: &str) -> Result<ScrapeStats> {
        let mut stats = ScrapeStats::default();
        let page = self
            .with_retry(0, &mut stats, || self.client.fetch_record(cve_id))
            .await?;
        stats.pages_fetched += 1;

        let messages = self.normalize(&page, &mut stats);
        let batch = self.publisher.publish_batch(messages).await;
        stats.absorb(&batch);

        Ok(stats)
    }

    async fn run_pages(&self, stats: &mut ScrapeStats) -> Result<()> {
        let page_size = self.config.page_size.max(1);
        let mut offset = 0u64;

        loop {
            let page = self
                .with_retry(offset, stats, || self.client.fetch_page(offset, page_size))
                .await?;
            stats.pages_fetched += 1;
            counter!("scraper_pages_total").increment(1);

            info!(
                offset,
                total = page.total_results,
                records = page.vulnerabilities.len(),
                "Fetched page"
            );

            let messages = self.normalize(&page, stats);
            let batch = self.publisher.publish_batch(messages).await;
            stats.absorb(&batch);
            info!(
                offset,
                published = batch.published,
                failed = batch.failed,
                "Batch complete"
            );

            if page.results_per_page == 0 && offset < page.total_results {
                return Err(Error::StalledPagination {
                    offset,
                    total: page.total_results,
                });
            }

            let next = offset + page.results_per_page;
            if page.results_per_page == 0 || next > page.total_results {
                info!(
                    pages = stats.pages_fetched,
                    total = page.total_results,
                    "Reached end of feed"
                );
                return Ok(());
            }

            offset = next;
            if !self.config.page_delay.is_zero() {
                debug!(delay = ?self.config.page_delay, "Waiting before next page");
                tokio::time::sleep(self.config.page_delay).await;
            }
        }
    }

    /// Run `fetch` until it succeeds, at most `max_attempts` times.
    async fn with_retry<F, Fut>(
        &self,
        offset: u64,
        stats: &mut ScrapeStats,
        mut fetch: F,
    ) -> Result<PageResult>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<PageResult, FetchError>>,
    {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            stats.fetch_attempts += 1;

            let err = match fetch().await {
                Ok(page) => return Ok(page),
                Err(e) => e,
            };
            counter!("scraper_fetch_failures_total").increment(1);

            if !err.is_retryable() {
                return Err(err.into());
            }

            warn!(
                offset,
                attempt,
                max_attempts,
                error = %err,
                "Feed request failed"
            );

            if attempt >= max_attempts {
                return Err(Error::RetriesExhausted {
                    offset,
                    attempts: attempt,
                    last_error: err,
                });
            }

            tokio::time::sleep(self.config.retry_delay).await;
        }
    }

    /// Normalize a page's records, dropping malformed ones and repeats.
    fn normalize(&self, page: &PageResult, stats: &mut ScrapeStats) -> Vec<NormalizedMessage> {
        let fetched_at = page.fetched_at();
        let mut seen = HashSet::with_capacity(page.vulnerabilities.len());
        let mut messages = Vec::with_capacity(page.vulnerabilities.len());

        for (position, raw) in page.records().enumerate() {
            stats.records_seen += 1;

            let message = match NormalizedMessage::from_raw(raw, fetched_at) {
                Ok(message) => message,
                Err(e) => {
                    warn!(
                        offset = page.start_index,
                        position,
                        error = %e,
                        "Skipping malformed record"
                    );
                    stats.records_skipped += 1;
                    continue;
                }
            };

            if !seen.insert(message.id.clone()) {
                warn!(cve_id = %message.id, "Skipping duplicate record within page");
                stats.records_skipped += 1;
                continue;
            }

            messages.push(message);
        }

        let normalized = messages.len() as u64;
        stats.records_normalized += normalized;
        counter!("scraper_records_total").increment(page.vulnerabilities.len() as u64);
        counter!("scraper_records_skipped_total")
            .increment(page.vulnerabilities.len() as u64 - normalized);

        messages
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::PublisherConfig;
    use crate::queue::{ChannelSubscriber, QueueSubscriber, channel_queue};
    use async_trait::async_trait;
    use melaka_core::{RawRecord, Vulnerability};
    use metrics_exporter_prometheus::PrometheusBuilder;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Arc;

    fn fast_config(page_size: u64, max_attempts: u32) -> ScraperConfig {
        ScraperConfig {
            page_size,
            max_attempts,
            retry_delay: Duration::ZERO,
            page_delay: Duration::ZERO,
        }
    }

    fn record(id: &str) -> Vulnerability {
        Vulnerability {
            cve: RawRecord(json!({"id": id, "lastModified": "2024-02-01T00:00:00.000"})),
        }
    }

    fn page(start: u64, total: u64, per_page: u64, records: Vec<Vulnerability>) -> PageResult {
        PageResult {
            total_results: total,
            results_per_page: per_page,
            start_index: start,
            timestamp: "2024-03-01T10:15:30.123".to_string(),
            vulnerabilities: records,
        }
    }

    /// Serves `total` synthetic records, `page_size` at a time. Like the live
    /// feed, every page reports the requested page size, including the last.
    struct PagedFeed {
        total: u64,
        calls: Mutex<Vec<u64>>,
    }

    impl PagedFeed {
        fn new(total: u64) -> Self {
            Self {
                total,
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl FeedClient for PagedFeed {
        async fn fetch_page(
            &self,
            start_index: u64,
            results_per_page: u64,
        ) -> std::result::Result<PageResult, FetchError> {
            self.calls.lock().push(start_index);
            let end = (start_index + results_per_page).min(self.total);
            let records = (start_index..end)
                .map(|i| record(&format!("CVE-2024-{:04}", i)))
                .collect();
            Ok(page(start_index, self.total, results_per_page, records))
        }

        async fn fetch_record(&self, cve_id: &str) -> std::result::Result<PageResult, FetchError> {
            Ok(page(0, 1, 1, vec![record(cve_id)]))
        }
    }

    /// Replays a fixed script of responses, then fails.
    struct ScriptedFeed {
        script: Mutex<VecDeque<std::result::Result<PageResult, FetchError>>>,
        calls: Mutex<u32>,
    }

    impl ScriptedFeed {
        fn new(script: Vec<std::result::Result<PageResult, FetchError>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                calls: Mutex::new(0),
            }
        }

        fn calls(&self) -> u32 {
            *self.calls.lock()
        }
    }

    #[async_trait]
    impl FeedClient for ScriptedFeed {
        async fn fetch_page(
            &self,
            _start_index: u64,
            _results_per_page: u64,
        ) -> std::result::Result<PageResult, FetchError> {
            *self.calls.lock() += 1;
            self.script
                .lock()
                .pop_front()
                .unwrap_or_else(|| Err(FetchError::Transport("connection refused".to_string())))
        }

        async fn fetch_record(&self, _cve_id: &str) -> std::result::Result<PageResult, FetchError> {
            self.fetch_page(0, 1).await
        }
    }

    fn scraper<C: FeedClient>(client: C, config: ScraperConfig) -> (Scraper<C>, ChannelSubscriber) {
        let (queue, subscriber) = channel_queue(1024);
        let publisher = Publisher::new(Arc::new(queue), PublisherConfig::default());
        (Scraper::new(client, publisher, config), subscriber)
    }

    async fn drain_ids(mut subscriber: ChannelSubscriber) -> Vec<String> {
        let mut ids = Vec::new();
        while let Some(Ok(delivery)) = subscriber.recv().await {
            ids.push(delivery.message.decode().unwrap().id);
        }
        ids.sort();
        ids
    }

    #[tokio::test]
    async fn test_offsets_cover_feed_exactly_once() {
        let feed = Arc::new(PagedFeed::new(5));
        let (scraper, subscriber) = scraper(Arc::clone(&feed), fast_config(2, 3));

        let stats = scraper.fetch_all().await.unwrap();
        drop(scraper);

        assert_eq!(*feed.calls.lock(), vec![0, 2, 4]);
        assert_eq!(stats.pages_fetched, 3);
        assert_eq!(stats.records_normalized, 5);
        assert_eq!(stats.messages_published, 5);

        let ids = drain_ids(subscriber).await;
        let expected: Vec<String> = (0..5).map(|i| format!("CVE-2024-{:04}", i)).collect();
        assert_eq!(ids, expected);
    }

    #[tokio::test]
    async fn test_exact_multiple_of_page_size() {
        let feed = Arc::new(PagedFeed::new(4));
        let (scraper, _subscriber) = scraper(Arc::clone(&feed), fast_config(2, 3));

        let stats = scraper.fetch_all().await.unwrap();
        assert_eq!(*feed.calls.lock(), vec![0, 2, 4]);
        assert_eq!(stats.records_seen, 4);
    }

    #[tokio::test]
    async fn test_empty_feed_reporting_zero_per_page() {
        let feed = Arc::new(ScriptedFeed::new(vec![Ok(page(0, 0, 0, Vec::new()))]));
        let (scraper, _subscriber) = scraper(Arc::clone(&feed), fast_config(10, 3));

        let stats = scraper.fetch_all().await.unwrap();
        assert_eq!(feed.calls(), 1);
        assert_eq!(stats.pages_fetched, 1);
    }

    #[tokio::test]
    async fn test_empty_feed_single_request() {
        let feed = Arc::new(PagedFeed::new(0));
        let (scraper, _subscriber) = scraper(Arc::clone(&feed), fast_config(1000, 3));

        let stats = scraper.fetch_all().await.unwrap();
        assert_eq!(*feed.calls.lock(), vec![0]);
        assert_eq!(stats.records_seen, 0);
        assert_eq!(stats.messages_published, 0);
    }

    #[tokio::test]
    async fn test_gives_up_after_exactly_max_attempts() {
        let feed = Arc::new(ScriptedFeed::new(Vec::new()));
        let (scraper, _subscriber) = scraper(Arc::clone(&feed), fast_config(10, 4));

        let err = scraper.fetch_all().await.unwrap_err();
        assert_eq!(feed.calls(), 4);
        assert!(matches!(
            err,
            Error::RetriesExhausted {
                offset: 0,
                attempts: 4,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_recovers_after_transient_failures() {
        let feed = Arc::new(ScriptedFeed::new(vec![
            Err(FetchError::Status {
                status: 503,
                message: "busy".to_string(),
            }),
            Err(FetchError::Transport("timeout".to_string())),
            Ok(page(0, 1, 10, vec![record("CVE-2024-0001")])),
        ]));
        let (scraper, subscriber) = scraper(Arc::clone(&feed), fast_config(10, 3));

        let stats = scraper.fetch_all().await.unwrap();
        drop(scraper);

        assert_eq!(feed.calls(), 3);
        assert_eq!(stats.fetch_attempts, 3);
        assert_eq!(drain_ids(subscriber).await, vec!["CVE-2024-0001"]);
    }

    #[tokio::test]
    async fn test_non_retryable_error_fails_immediately() {
        let feed = Arc::new(ScriptedFeed::new(vec![Err(FetchError::InvalidRequest(
            "bad".to_string(),
        ))]));
        let (scraper, _subscriber) = scraper(Arc::clone(&feed), fast_config(10, 5));

        let err = scraper.fetch_all().await.unwrap_err();
        assert_eq!(feed.calls(), 1);
        assert!(matches!(err, Error::Fetch(FetchError::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn test_zero_results_per_page_is_stalled() {
        let stalled = PageResult {
            total_results: 10,
            results_per_page: 0,
            start_index: 0,
            timestamp: String::new(),
            vulnerabilities: Vec::new(),
        };
        let feed = Arc::new(ScriptedFeed::new(vec![Ok(stalled)]));
        let (scraper, _subscriber) = scraper(Arc::clone(&feed), fast_config(10, 3));

        let err = scraper.fetch_all().await.unwrap_err();
        assert!(matches!(
            err,
            Error::StalledPagination {
                offset: 0,
                total: 10
            }
        ));
        assert_eq!(feed.calls(), 1);
    }

    #[tokio::test]
    async fn test_malformed_and_duplicate_records_skipped() {
        let records = vec![
            record("CVE-2024-0001"),
            Vulnerability {
                cve: RawRecord(json!({"descriptions": []})),
            },
            record("CVE-2024-0002"),
            record("CVE-2024-0001"),
        ];
        let feed = Arc::new(ScriptedFeed::new(vec![Ok(page(0, 4, 10, records))]));
        let (scraper, subscriber) = scraper(Arc::clone(&feed), fast_config(10, 3));

        let stats = scraper.fetch_all().await.unwrap();
        drop(scraper);

        assert_eq!(stats.records_seen, 4);
        assert_eq!(stats.records_skipped, 2);
        assert_eq!(stats.records_normalized, 2);
        assert_eq!(
            drain_ids(subscriber).await,
            vec!["CVE-2024-0001", "CVE-2024-0002"]
        );
    }

    #[tokio::test]
    async fn test_fetch_one_publishes_record() {
        let feed = Arc::new(PagedFeed::new(0));
        let (scraper, subscriber) = scraper(Arc::clone(&feed), fast_config(10, 3));

        let stats = scraper.fetch_one("CVE-2021-44228").await.unwrap();
        drop(scraper);

        assert_eq!(stats.messages_published, 1);
        assert_eq!(drain_ids(subscriber).await, vec!["CVE-2021-44228"]);
    }

    #[test]
    fn test_record_counters_reach_recorder() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        let (scraper, _subscriber) = scraper(PagedFeed::new(0), fast_config(10, 1));
        let records = vec![
            record("CVE-2024-0001"),
            Vulnerability {
                cve: RawRecord(json!({})),
            },
            record("CVE-2024-0001"),
        ];
        let mut stats = ScrapeStats::default();

        let messages = metrics::with_local_recorder(&recorder, || {
            scraper.normalize(&page(0, 3, 10, records), &mut stats)
        });

        assert_eq!(messages.len(), 1);
        let rendered = handle.render();
        assert!(rendered.contains("scraper_records_total 3"));
        assert!(rendered.contains("scraper_records_skipped_total 2"));
    }
}
