//! Melaka store writer.
//!
//! Consumes normalized records from Kafka and upserts them into the
//! document store. Several writers may share a consumer group; partitions are
//! split between them.
//!
//! # Usage
//!
//! ```bash
//! melaka-writer --store-path /data/melaka.db --write-workers 16
//! ```
//!
//! # Graceful Shutdown
//!
//! On SIGINT (Ctrl+C) the writer:
//! 1. Stops pulling new messages
//! 2. Waits for in-flight upserts to finish
//! 3. Logs a summary and exits

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use melaka_core::metrics::{init_metrics, start_metrics_server};
use melaka_core::{DocumentStore, SqliteStore, StoreConfig};
use melaka_ingest::cli::{KafkaArgs, StoreArgs, init_tracing, load_dotenv};
use melaka_ingest::{
    Consumer, ConsumerConfig, ConsumerStats, InitGuard, KafkaConfig, KafkaSubscriber, UpsertSink,
};
use metrics::gauge;
use tokio::sync::watch;

/// Melaka store writer.
#[derive(Parser, Debug)]
#[command(name = "melaka-writer")]
#[command(about = "Write queued CVE records into the Melaka store")]
#[command(version)]
struct Args {
    /// Kafka consumer group
    #[arg(long, env = "KAFKA_GROUP_ID", default_value = "CVE-Writers")]
    group_id: String,

    /// Maximum messages handled at once
    #[arg(long, env = "WRITE_WORKERS", default_value = "10")]
    write_workers: usize,

    #[command(flatten)]
    kafka: KafkaArgs,

    #[command(flatten)]
    store: StoreArgs,

    /// Metrics HTTP server port (0 to disable)
    #[arg(long, env = "METRICS_PORT", default_value = "9091")]
    metrics_port: u16,
}

#[tokio::main]
async fn main() -> Result<()> {
    load_dotenv().context("Failed to load .env")?;
    let args = Args::parse();

    init_tracing("info,melaka_ingest=debug");

    tracing::info!("Melaka writer starting...");

    if args.metrics_port > 0 {
        let metrics_handle = init_metrics();
        start_metrics_server(args.metrics_port, metrics_handle).await?;
    }

    let store: Arc<dyn DocumentStore> = Arc::new(
        SqliteStore::open(&StoreConfig {
            path: args.store.store_path.clone(),
            ..Default::default()
        })
        .with_context(|| {
            format!("Failed to open store at {}", args.store.store_path.display())
        })?,
    );
    InitGuard::new(Arc::clone(&store)).ensure_initialized()?;

    let kafka_config = KafkaConfig {
        group_id: args.group_id.clone(),
        ..args.kafka.to_config()
    };

    tracing::info!("Configuration:");
    tracing::info!(
        "  Kafka: {} (topic {}, group {})",
        kafka_config.brokers,
        kafka_config.topic,
        kafka_config.group_id
    );
    tracing::info!("  Write workers: {}", args.write_workers);
    tracing::info!("  Store: {}", args.store.store_path.display());

    let mut subscriber =
        KafkaSubscriber::new(&kafka_config).context("Failed to create Kafka consumer")?;
    let consumer = Consumer::new(
        UpsertSink::new(Arc::clone(&store)),
        ConsumerConfig {
            max_in_flight: args.write_workers,
            recv_error_backoff: Duration::from_secs(1),
        },
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("Shutdown signal received, stopping gracefully...");
                let _ = shutdown_tx.send(true);
            }
            Err(e) => {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
                // Dropping the sender would stop the consumer.
                shutdown_tx.closed().await;
            }
        }
    });

    gauge!("writer_running").set(1.0);
    let stats = consumer.run(&mut subscriber, shutdown_rx).await;
    gauge!("writer_running").set(0.0);

    log_summary(&stats, store.count().ok());

    Ok(())
}

fn log_summary(stats: &ConsumerStats, documents: Option<u64>) {
    tracing::info!("Writer stopped:");
    tracing::info!("  Messages received: {}", stats.received);
    tracing::info!("  Inserted: {}", stats.inserted);
    tracing::info!("  Modified: {}", stats.modified);
    tracing::info!("  Unchanged: {}", stats.unchanged);
    tracing::info!("  Stale: {}", stats.stale);
    tracing::info!("  Malformed: {}", stats.poison);
    tracing::info!("  Failed: {}", stats.failed);
    if let Some(documents) = documents {
        tracing::info!("  Documents in store: {}", documents);
    }
}
