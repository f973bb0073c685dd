//! In-process queue over a bounded tokio channel.

use async_trait::async_trait;
use melaka_core::QueueMessage;
use tokio::sync::mpsc;

use super::{Delivery, MessageQueue, QueueSubscriber};
use crate::error::{Error, Result};

/// Create a bounded in-process queue.
///
/// `publish` waits while `capacity` messages are pending. The subscriber sees
/// the end of the queue once every publisher has been dropped. Messages are
/// not kept after delivery, so acknowledgements are no-ops.
pub fn channel_queue(capacity: usize) -> (ChannelPublisher, ChannelSubscriber) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (ChannelPublisher { tx }, ChannelSubscriber { rx })
}

/// Producer half of [`channel_queue`].
#[derive(Clone)]
pub struct ChannelPublisher {
    tx: mpsc::Sender<QueueMessage>,
}

/// Consumer half of [`channel_queue`].
pub struct ChannelSubscriber {
    rx: mpsc::Receiver<QueueMessage>,
}

#[async_trait]
impl MessageQueue for ChannelPublisher {
    async fn publish(&self, message: QueueMessage) -> Result<()> {
        self.tx
            .send(message)
            .await
            .map_err(|_| Error::Queue("channel closed".to_string()))
    }
}

#[async_trait]
impl QueueSubscriber for ChannelSubscriber {
    async fn recv(&mut self) -> Option<Result<Delivery>> {
        self.rx.recv().await.map(|message| Ok(Delivery::new(message)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(key: &str) -> QueueMessage {
        QueueMessage {
            key: key.as_bytes().to_vec(),
            value: b"{}".to_vec(),
        }
    }

    #[tokio::test]
    async fn test_publish_then_recv() {
        let (publisher, mut subscriber) = channel_queue(4);
        publisher.publish(message("a")).await.unwrap();
        publisher.publish(message("b")).await.unwrap();
        drop(publisher);

        assert_eq!(subscriber.recv().await.unwrap().unwrap().message.key, b"a");
        assert_eq!(subscriber.recv().await.unwrap().unwrap().message.key, b"b");
        assert!(subscriber.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_publish_after_subscriber_dropped() {
        let (publisher, subscriber) = channel_queue(4);
        drop(subscriber);

        let err = publisher.publish(message("a")).await.unwrap_err();
        assert!(matches!(err, Error::Queue(_)));
    }
}
