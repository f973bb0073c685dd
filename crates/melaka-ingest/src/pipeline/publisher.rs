//! Bounded-concurrency batch publisher.
//!
//! Each message of a batch is published on its own task, but a task is only
//! spawned after it has acquired one of `max_in_flight` permits. The batch
//! call returns once every task has finished, so the scraper never starts the
//! next page while publishes of the previous one are still running.

use std::sync::Arc;
use std::time::Instant;

use melaka_core::{NormalizedMessage, QueueMessage};
use metrics::{counter, gauge, histogram};
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error};

use crate::queue::MessageQueue;

/// Configuration for the publisher.
#[derive(Debug, Clone)]
pub struct PublisherConfig {
    /// Maximum publishes in flight at once.
    pub max_in_flight: usize,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self { max_in_flight: 10 }
    }
}

/// Outcome counts of one batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchResult {
    /// Messages handed to the publisher.
    pub attempted: u64,
    /// Messages the queue accepted.
    pub published: u64,
    /// Messages that could not be encoded or published.
    pub failed: u64,
}

impl BatchResult {
    fn tally(&mut self, joined: Result<bool, JoinError>) {
        match joined {
            Ok(true) => self.published += 1,
            Ok(false) => self.failed += 1,
            Err(e) => {
                error!("Publish task failed: {}", e);
                self.failed += 1;
            }
        }
    }
}

/// Publishes batches of normalized records to a [`MessageQueue`].
pub struct Publisher {
    queue: Arc<dyn MessageQueue>,
    permits: Arc<Semaphore>,
}

impl Publisher {
    /// Create a publisher over `queue`.
    pub fn new(queue: Arc<dyn MessageQueue>, config: PublisherConfig) -> Self {
        Self {
            queue,
            permits: Arc::new(Semaphore::new(config.max_in_flight.max(1))),
        }
    }

    /// Publish every message and wait for all of them to settle.
    ///
    /// Failures are logged and counted; they never abort the batch.
    pub async fn publish_batch(&self, messages: Vec<NormalizedMessage>) -> BatchResult {
        let started = Instant::now();
        let mut result = BatchResult::default();
        let mut tasks = JoinSet::new();

        for message in messages {
            result.attempted += 1;

            let queued = match QueueMessage::encode(&message) {
                Ok(queued) => queued,
                Err(e) => {
                    error!(cve_id = %message.id, "Failed to encode message: {}", e);
                    counter!("publisher_failures_total").increment(1);
                    result.failed += 1;
                    continue;
                }
            };

            // The semaphore is never closed.
            let Ok(permit) = Arc::clone(&self.permits).acquire_owned().await else {
                result.failed += 1;
                continue;
            };

            let queue = Arc::clone(&self.queue);
            let cve_id = message.id;
            tasks.spawn(async move {
                let _permit = permit;
                gauge!("publisher_in_flight").increment(1.0);
                let published = match queue.publish(queued).await {
                    Ok(()) => {
                        debug!(cve_id = %cve_id, "Published record");
                        counter!("publisher_messages_total").increment(1);
                        true
                    }
                    Err(e) => {
                        error!(cve_id = %cve_id, "Failed to publish record: {}", e);
                        counter!("publisher_failures_total").increment(1);
                        false
                    }
                };
                gauge!("publisher_in_flight").decrement(1.0);
                published
            });

            while let Some(joined) = tasks.try_join_next() {
                result.tally(joined);
            }
        }

        while let Some(joined) = tasks.join_next().await {
            result.tally(joined);
        }

        histogram!("publisher_batch_duration_seconds").record(started.elapsed().as_secs_f64());
        result
    }
}
