//! Prometheus metrics helpers for the Melaka pipeline.
//!
//! # Usage
//!
//! ```rust,ignore
//! use melaka_core::metrics::{init_metrics, start_metrics_server};
//!
//! #[tokio::main]
//! async fn main() {
//!     let handle = init_metrics();
//!     start_metrics_server(9090, handle).await.unwrap();
//!
//!     metrics::counter!("scraper_pages_total").increment(1);
//! }
//! ```
//!
//! # Metric Naming Conventions
//!
//! - Prefix: component name (`scraper_`, `publisher_`, `consumer_`, `sink_`)
//! - Suffix: unit or type (`_total`, `_seconds`)
//! - Labels: only low-cardinality ones such as `outcome`

use axum::{Router, routing::get};
use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;

/// Initialize the Prometheus metrics recorder.
///
/// Must be called once at startup before any metrics are recorded.
///
/// # Panics
///
/// Panics if a recorder is already installed.
pub fn init_metrics() -> PrometheusHandle {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus recorder");

    register_common_metrics();

    handle
}

/// Like [`init_metrics`] but returns `None` if a recorder is already installed.
pub fn try_init_metrics() -> Option<PrometheusHandle> {
    let handle = PrometheusBuilder::new().install_recorder().ok()?;
    register_common_metrics();
    Some(handle)
}

/// Start the Prometheus metrics HTTP server.
///
/// Binds `/metrics` on `port` and serves it from a background task.
pub async fn start_metrics_server(
    port: u16,
    handle: PrometheusHandle,
) -> Result<(), std::io::Error> {
    let app = Router::new().route(
        "/metrics",
        get(move || {
            let handle = handle.clone();
            async move { handle.render() }
        }),
    );

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Metrics server listening on http://{}/metrics", addr);

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!("Metrics server stopped: {}", e);
        }
    });

    Ok(())
}

/// Register descriptions for every metric the pipeline emits.
fn register_common_metrics() {
    // =========================================================================
    // Scraper
    // =========================================================================

    describe_counter!("scraper_pages_total", "Feed pages fetched successfully");
    describe_counter!(
        "scraper_fetch_failures_total",
        "Failed feed fetch attempts (each retry counts)"
    );
    describe_counter!(
        "scraper_records_total",
        "Records seen on fetched pages"
    );
    describe_counter!(
        "scraper_records_skipped_total",
        "Records skipped because they could not be normalized"
    );
    describe_gauge!(
        "scraper_running",
        "Whether a backfill is currently running (1=yes, 0=no)"
    );

    // =========================================================================
    // Publisher
    // =========================================================================

    describe_counter!("publisher_messages_total", "Messages published to the queue");
    describe_counter!("publisher_failures_total", "Messages that failed to publish");
    describe_gauge!("publisher_in_flight", "Publishes currently in flight");
    describe_histogram!(
        "publisher_batch_duration_seconds",
        "Time from batch start until its barrier released"
    );

    // =========================================================================
    // Consumer / sink
    // =========================================================================

    describe_counter!("consumer_messages_total", "Messages pulled from the queue");
    describe_counter!("consumer_poison_total", "Malformed messages dropped");
    describe_counter!(
        "consumer_failures_total",
        "Messages whose handling failed (store errors)"
    );
    describe_gauge!("consumer_in_flight", "Messages currently being handled");
    describe_counter!(
        "sink_upserts_total",
        "Upserts applied to the store (label: outcome)"
    );
    describe_gauge!(
        "writer_running",
        "Whether the writer loop is running (1=yes, 0=no)"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Once;

    static INIT: Once = Once::new();

    fn ensure_metrics_init() {
        INIT.call_once(|| {
            let _ = try_init_metrics();
        });
    }

    #[test]
    fn test_try_init_metrics_idempotent() {
        let handle1 = try_init_metrics();
        let handle2 = try_init_metrics();

        // At most one should succeed
        assert!(handle1.is_none() || handle2.is_none());
    }

    #[test]
    fn test_register_common_metrics_repeatable() {
        ensure_metrics_init();
        register_common_metrics();
        register_common_metrics();
    }
}
