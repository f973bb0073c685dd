//! Melaka NVD scraper.
//!
//! Walks the NVD CVE feed and publishes every record to Kafka, where the
//! `melaka-writer` process picks them up.
//!
//! # Usage
//!
//! ```bash
//! # Full backfill (skipped if one already completed)
//! melaka-ingest
//!
//! # Backfill again even though one completed
//! melaka-ingest backfill --force
//!
//! # Refresh a single record
//! melaka-ingest fetch CVE-2021-44228
//!
//! # Custom feed and broker settings
//! NVD_API_KEY=... melaka-ingest \
//!     --kafka-broker kafka1:9092,kafka2:9092 \
//!     --page-delay-secs 6
//! ```
//!
//! A page that keeps failing after `--max-retries` attempts aborts the run
//! with a non-zero exit code. Records published before that point stay
//! published; a rerun republishes them and the writer's upsert absorbs it.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use melaka_core::{SqliteStore, StoreConfig};
use melaka_core::metrics::{init_metrics, start_metrics_server};
use melaka_ingest::cli::{KafkaArgs, StoreArgs, init_tracing, load_dotenv};
use melaka_ingest::feed::DEFAULT_NVD_URL;
use melaka_ingest::{
    InitGuard, KafkaPublisher, NvdClient, NvdClientConfig, Publisher, PublisherConfig,
    ScrapeStats, Scraper, ScraperConfig,
};

/// Melaka NVD scraper.
#[derive(Parser, Debug)]
#[command(name = "melaka-ingest")]
#[command(about = "Scrape the NVD CVE feed into the Melaka queue")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// NVD CVE API endpoint
    #[arg(long, env = "NVD_API_URL", default_value = DEFAULT_NVD_URL)]
    nvd_url: String,

    /// NVD API key (raises the rate limit)
    #[arg(long, env = "NVD_API_KEY", hide_env_values = true)]
    nvd_api_key: Option<String>,

    /// Records requested per page
    #[arg(long, env = "NVD_PAGE_SIZE", default_value = "1000")]
    page_size: u64,

    /// Attempts per page before giving up
    #[arg(long, env = "NVD_MAX_RETRIES", default_value = "10")]
    max_retries: u32,

    /// Seconds to wait between failed attempts
    #[arg(long, env = "NVD_RETRY_DELAY_SECS", default_value = "5")]
    retry_delay_secs: u64,

    /// Seconds to wait between pages
    #[arg(long, env = "NVD_PAGE_DELAY_SECS", default_value = "10")]
    page_delay_secs: u64,

    /// HTTP request timeout in seconds
    #[arg(long, env = "NVD_REQUEST_TIMEOUT_SECS", default_value = "30")]
    request_timeout_secs: u64,

    /// Maximum publishes in flight
    #[arg(long, env = "PUBLISH_WORKERS", default_value = "10")]
    publish_workers: usize,

    #[command(flatten)]
    kafka: KafkaArgs,

    #[command(flatten)]
    store: StoreArgs,

    /// Metrics HTTP server port (0 to disable)
    #[arg(long, env = "METRICS_PORT", default_value = "9090")]
    metrics_port: u16,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Fetch the whole feed (default)
    Backfill {
        /// Run even if a previous backfill completed
        #[arg(long)]
        force: bool,
    },

    /// Fetch and publish a single record
    Fetch {
        /// Record identifier, e.g. CVE-2021-44228
        cve_id: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let dotenv = load_dotenv().context("Failed to load .env")?;
    let args = Args::parse();

    init_tracing("info,melaka_ingest=debug");

    tracing::info!("Melaka scraper starting...");
    if let Some(path) = dotenv {
        tracing::debug!("Loaded environment from {}", path.display());
    }

    if args.metrics_port > 0 {
        let metrics_handle = init_metrics();
        start_metrics_server(args.metrics_port, metrics_handle).await?;
    }

    let store = SqliteStore::open(&StoreConfig {
        path: args.store.store_path.clone(),
        ..Default::default()
    })
    .with_context(|| format!("Failed to open store at {}", args.store.store_path.display()))?;
    let guard = InitGuard::new(Arc::new(store));
    guard.ensure_initialized()?;

    let command = args
        .command
        .as_ref()
        .map_or(CommandKind::Backfill { force: false }, CommandKind::from);

    if let CommandKind::Backfill { force: false } = command
        && guard.backfill_completed()?
    {
        tracing::info!("Backfill already completed; pass `backfill --force` to run it again");
        return Ok(());
    }

    let kafka_config = args.kafka.to_config();
    tracing::info!("Configuration:");
    tracing::info!("  Feed: {}", args.nvd_url);
    tracing::info!(
        "  API key: {}",
        if args.nvd_api_key.is_some() { "set" } else { "not set" }
    );
    tracing::info!("  Page size: {}", args.page_size);
    tracing::info!(
        "  Kafka: {} (topic {})",
        kafka_config.brokers,
        kafka_config.topic
    );
    tracing::info!("  Publish workers: {}", args.publish_workers);
    tracing::info!("  Store: {}", args.store.store_path.display());

    let queue =
        Arc::new(KafkaPublisher::new(kafka_config).context("Failed to create Kafka producer")?);
    queue
        .ensure_topic()
        .await
        .context("Failed to provision Kafka topic")?;

    let publisher = Publisher::new(
        queue.clone(),
        PublisherConfig {
            max_in_flight: args.publish_workers,
        },
    );
    let client = NvdClient::new(NvdClientConfig {
        base_url: args.nvd_url.clone(),
        api_key: args.nvd_api_key.clone(),
        request_timeout: Duration::from_secs(args.request_timeout_secs),
    })?;
    let scraper = Scraper::new(
        client,
        publisher,
        ScraperConfig {
            page_size: args.page_size,
            max_attempts: args.max_retries,
            retry_delay: Duration::from_secs(args.retry_delay_secs),
            page_delay: Duration::from_secs(args.page_delay_secs),
        },
    );

    let result = match command {
        CommandKind::Backfill { .. } => {
            let result = scraper.fetch_all().await;
            if let Ok(stats) = &result {
                guard.record_backfill(stats)?;
            }
            result
        }
        CommandKind::Fetch(cve_id) => {
            let result = scraper.fetch_one(cve_id).await;
            if let Ok(stats) = &result
                && stats.records_normalized == 0
            {
                tracing::warn!("No record found for {}", cve_id);
            }
            result
        }
    };

    if let Err(e) = queue.flush(Duration::from_secs(30)) {
        tracing::warn!("Failed to flush Kafka producer: {}", e);
    }

    let stats = result?;
    log_summary(&stats);

    Ok(())
}

/// The command to run, with `backfill` as the default.
#[derive(Debug, Clone, Copy)]
enum CommandKind<'a> {
    Backfill { force: bool },
    Fetch(&'a str),
}

impl<'a> From<&'a Command> for CommandKind<'a> {
    fn from(command: &'a Command) -> Self {
        match command {
            Command::Backfill { force } => Self::Backfill { force: *force },
            Command::Fetch { cve_id } => Self::Fetch(cve_id),
        }
    }
}

fn log_summary(stats: &ScrapeStats) {
    tracing::info!("Scrape complete:");
    tracing::info!("  Pages fetched: {}", stats.pages_fetched);
    tracing::info!("  Fetch attempts: {}", stats.fetch_attempts);
    tracing::info!("  Records seen: {}", stats.records_seen);
    tracing::info!("  Records skipped: {}", stats.records_skipped);
    tracing::info!("  Messages published: {}", stats.messages_published);
    tracing::info!("  Publish failures: {}", stats.publish_failures);
}
