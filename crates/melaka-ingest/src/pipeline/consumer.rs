//! Bounded-concurrency queue consumer.
//!
//! The consumer acquires a permit *before* pulling the next message, so at
//! most `max_in_flight` messages are ever held in memory or being written.
//! A failing message is logged and counted; it never stops the loop.
//!
//! Every delivery is settled after its handler finishes: applied and
//! malformed messages are acknowledged, failed writes are not, so the queue
//! delivers them again.

use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, gauge};
use tokio::sync::{Semaphore, watch};
use tokio::task::{JoinError, JoinSet};
use tracing::{error, info, warn};

use super::sink::{ApplyOutcome, UpsertSink};
use crate::error::Result;
use crate::queue::QueueSubscriber;

/// Resolves once `true` is sent. Never resolves after the sender is gone.
async fn stop_requested(shutdown: &mut watch::Receiver<bool>) {
    let closed = shutdown.wait_for(|stop| *stop).await.is_err();
    if closed {
        std::future::pending::<()>().await;
    }
}

/// Configuration for the consumer.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Maximum messages being handled at once.
    pub max_in_flight: usize,

    /// Pause after a queue receive error.
    pub recv_error_backoff: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 10,
            recv_error_backoff: Duration::from_secs(1),
        }
    }
}

/// Counters accumulated over one consumer run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    /// Messages pulled from the queue.
    pub received: u64,
    /// Messages that created a new document.
    pub inserted: u64,
    /// Messages that changed an existing document.
    pub modified: u64,
    /// Messages that matched the stored document exactly.
    pub unchanged: u64,
    /// Messages older than the stored document.
    pub stale: u64,
    /// Malformed messages dropped.
    pub poison: u64,
    /// Messages whose write failed.
    pub failed: u64,
    /// Queue receive errors.
    pub recv_errors: u64,
}

impl ConsumerStats {
    /// Messages applied to the store, whatever the outcome.
    pub fn applied(&self) -> u64 {
        self.inserted + self.modified + self.unchanged + self.stale
    }

    fn record(&mut self, joined: std::result::Result<(String, Result<ApplyOutcome>), JoinError>) {
        match joined {
            Ok((_, Ok(outcome))) => match outcome {
                ApplyOutcome::Inserted => self.inserted += 1,
                ApplyOutcome::Modified => self.modified += 1,
                ApplyOutcome::Unchanged => self.unchanged += 1,
                ApplyOutcome::Stale => self.stale += 1,
            },
            Ok((key, Err(e))) if e.is_poison() => {
                warn!(key = %key, "Dropping malformed message: {}", e);
                counter!("consumer_poison_total").increment(1);
                self.poison += 1;
            }
            Ok((key, Err(e))) => {
                error!(key = %key, "Failed to apply message: {}", e);
                counter!("consumer_failures_total").increment(1);
                self.failed += 1;
            }
            Err(e) => {
                error!("Message handler failed: {}", e);
                counter!("consumer_failures_total").increment(1);
                self.failed += 1;
            }
        }
    }
}

/// Pulls messages from a queue and applies them through an [`UpsertSink`].
pub struct Consumer {
    sink: Arc<UpsertSink>,
    permits: Arc<Semaphore>,
    config: ConsumerConfig,
}

impl Consumer {
    /// Create a consumer feeding `sink`.
    pub fn new(sink: UpsertSink, config: ConsumerConfig) -> Self {
        Self {
            sink: Arc::new(sink),
            permits: Arc::new(Semaphore::new(config.max_in_flight.max(1))),
            config,
        }
    }

    /// Consume until the queue closes or `true` is sent on `shutdown`.
    ///
    /// On shutdown no further messages are pulled; messages already being
    /// handled are allowed to finish before this returns.
    pub async fn run<S: QueueSubscriber>(
        &self,
        subscriber: &mut S,
        mut shutdown: watch::Receiver<bool>,
    ) -> ConsumerStats {
        let mut stats = ConsumerStats::default();
        let mut tasks = JoinSet::new();

        info!(max_in_flight = self.config.max_in_flight, "Consumer started");

        loop {
            while let Some(joined) = tasks.try_join_next() {
                stats.record(joined);
            }

            let stopping = *shutdown.borrow();
            if stopping {
                break;
            }

            let permit = tokio::select! {
                biased;
                _ = stop_requested(&mut shutdown) => break,
                permit = Arc::clone(&self.permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let next = tokio::select! {
                biased;
                _ = stop_requested(&mut shutdown) => break,
                next = subscriber.recv() => next,
            };

            let delivery = match next {
                Some(Ok(delivery)) => delivery,
                Some(Err(e)) => {
                    stats.recv_errors += 1;
                    warn!("Error reading message: {}", e);
                    drop(permit);
                    tokio::time::sleep(self.config.recv_error_backoff).await;
                    continue;
                }
                None => {
                    info!("Queue closed");
                    break;
                }
            };

            stats.received += 1;
            counter!("consumer_messages_total").increment(1);

            let sink = Arc::clone(&self.sink);
            tasks.spawn(async move {
                let _permit = permit;
                gauge!("consumer_in_flight").increment(1.0);
                let result = sink.apply(&delivery.message).await;
                gauge!("consumer_in_flight").decrement(1.0);
                let key = delivery.message.key_str().into_owned();
                match &result {
                    Ok(_) => delivery.ack(),
                    Err(e) if e.is_poison() => delivery.ack(),
                    Err(_) => delivery.nack(),
                }
                (key, result)
            });
        }

        if !tasks.is_empty() {
            info!(in_flight = tasks.len(), "Waiting for in-flight messages");
        }
        while let Some(joined) = tasks.join_next().await {
            stats.record(joined);
        }

        info!(
            received = stats.received,
            applied = stats.applied(),
            poison = stats.poison,
            failed = stats.failed,
            "Consumer stopped"
        );

        stats
    }
}
