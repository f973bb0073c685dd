//! Melaka ingestion pipeline components.
//!
//! This crate moves vulnerability records from the NVD feed into the Melaka
//! document store, with a message queue in between.
//!
//! # Modules
//!
//! - [`feed`] - Feed client and the paginating scraper
//! - [`queue`] - Queue seams (in-process channel, Kafka)
//! - [`pipeline`] - Publisher, consumer, upsert sink and init guard
//! - [`cli`] - Command-line options shared by the binaries
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │    NVD feed     │  paginated REST API
//! └────────┬────────┘
//!          │  Scraper: retry, rate limit, normalize
//!          ▼
//! ┌─────────────────┐
//! │    Publisher    │  ≤ N concurrent publishes, per-page barrier
//! └────────┬────────┘
//!          │
//!          ▼
//! ┌─────────────────┐
//! │      Queue      │  Kafka topic, keyed by CVE id
//! └────────┬────────┘
//!          │
//!          ▼
//! ┌─────────────────┐
//! │    Consumer     │  ≤ M concurrent handlers
//! └────────┬────────┘
//!          │  UpsertSink: idempotent merge by CVE id
//!          ▼
//! ┌─────────────────┐
//! │ DocumentStore   │  SQLite, one document per CVE
//! └─────────────────┘
//! ```
//!
//! The scraper (`melaka-ingest`) and the writer (`melaka-writer`) run as
//! separate processes and share nothing but the queue and the store.

pub mod cli;
pub mod error;
pub mod feed;
pub mod pipeline;
pub mod queue;

pub use error::{Error, Result};

pub use feed::{
    FeedClient, FetchError, NvdClient, NvdClientConfig, ScrapeStats, Scraper, ScraperConfig,
};

pub use pipeline::{
    ApplyOutcome, BatchResult, Consumer, ConsumerConfig, ConsumerStats, InitGuard, Publisher,
    PublisherConfig, UpsertSink,
};

pub use queue::{
    Acknowledge, ChannelPublisher, ChannelSubscriber, Delivery, MessageQueue, QueueSubscriber,
    channel_queue,
};
#[cfg(feature = "kafka")]
pub use queue::{KafkaConfig, KafkaPublisher, KafkaSubscriber};
