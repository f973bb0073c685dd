//! Message queue seams between the scraper and the writer.
//!
//! Two implementations:
//!
//! - [`channel_queue`]: bounded in-process channel, for tests and single-process runs
//! - `KafkaPublisher` / `KafkaSubscriber`: the durable queue used in production
//!   (behind the `kafka` feature)
//!
//! Messages are keyed by record identifier. Delivery is at-least-once and
//! unordered across keys; the store's upsert absorbs redelivery. A subscriber
//! hands out [`Delivery`] values that the consumer settles once the message
//! has been handled; an unsettled or failed delivery is left for the queue to
//! deliver again.

mod channel;
#[cfg(feature = "kafka")]
mod kafka;

pub use channel::{ChannelPublisher, ChannelSubscriber, channel_queue};
#[cfg(feature = "kafka")]
pub use kafka::{KafkaConfig, KafkaPublisher, KafkaSubscriber};

use async_trait::async_trait;
use melaka_core::QueueMessage;

use crate::error::Result;

/// Producer side of a queue.
#[async_trait]
pub trait MessageQueue: Send + Sync {
    /// Publish one message. Returns once the queue has accepted it.
    async fn publish(&self, message: QueueMessage) -> Result<()>;
}

/// Settles one delivered message with the queue it came from.
pub trait Acknowledge: Send {
    /// `processed` is `false` when the message must be delivered again.
    fn settle(self: Box<Self>, processed: bool);
}

/// A message handed out by a [`QueueSubscriber`].
///
/// Dropping a delivery without settling it leaves it unacknowledged.
pub struct Delivery {
    /// The message itself.
    pub message: QueueMessage,
    ack: Option<Box<dyn Acknowledge>>,
}

impl Delivery {
    /// A delivery that needs no acknowledgement.
    pub fn new(message: QueueMessage) -> Self {
        Self { message, ack: None }
    }

    /// A delivery settled through `ack`.
    pub fn with_ack(message: QueueMessage, ack: Box<dyn Acknowledge>) -> Self {
        Self {
            message,
            ack: Some(ack),
        }
    }

    /// The message was handled (applied, or dropped as unprocessable).
    pub fn ack(mut self) {
        if let Some(ack) = self.ack.take() {
            ack.settle(true);
        }
    }

    /// Handling failed; the queue should deliver the message again.
    pub fn nack(mut self) {
        if let Some(ack) = self.ack.take() {
            ack.settle(false);
        }
    }
}

/// Consumer side of a queue.
#[async_trait]
pub trait QueueSubscriber: Send {
    /// Wait for the next message.
    ///
    /// Returns `None` once the queue is closed and drained. A transport error
    /// is returned as `Some(Err(_))`; the caller may keep polling.
    async fn recv(&mut self) -> Option<Result<Delivery>>;
}
