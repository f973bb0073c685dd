//! Pipeline stages on either side of the queue.
//!
//! - [`Publisher`] - Publishes a page's records with bounded concurrency
//! - [`Consumer`] - Pulls messages and dispatches them with bounded concurrency
//! - [`UpsertSink`] - Applies one message to the document store, idempotently
//! - [`InitGuard`] - One-time store initialization and the backfill marker
//!
//! # Architecture
//!
//! ```text
//! [Scraper] → [Publisher] → (queue) → [Consumer] → [UpsertSink]
//!                 ↓                        ↓             ↓
//!           ≤ N publishes            ≤ M handlers   DocumentStore
//! ```
//!
//! The store is the source of truth. Every stage after the queue tolerates
//! redelivery and reordering of messages.

mod consumer;
mod guard;
mod publisher;
mod sink;

pub use consumer::{Consumer, ConsumerConfig, ConsumerStats};
pub use guard::InitGuard;
pub use publisher::{BatchResult, Publisher, PublisherConfig};
pub use sink::{ApplyOutcome, UpsertSink};
