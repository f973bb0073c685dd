//! Kafka-backed queue.
//!
//! The publisher keys every message by record identifier, so all versions of
//! one record land on the same partition. The subscriber joins a consumer
//! group; running several writers with the same group splits partitions
//! between them.
//!
//! Offsets are stored for commit only after the consumer acknowledges a
//! message, and never past the lowest offset of a partition that is still
//! being handled or whose handling failed. A writer that dies, or a message
//! that could not be written, is therefore read again by the group.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use melaka_core::QueueMessage;
use parking_lot::Mutex;
use rdkafka::Message;
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::error::KafkaResult;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::topic_partition_list::{Offset, TopicPartitionList};
use rdkafka::types::RDKafkaErrorCode;
use tracing::{debug, info, warn};

use super::{Acknowledge, Delivery, MessageQueue, QueueSubscriber};
use crate::error::{Error, Result};

/// Connection and topic settings shared by publisher and subscriber.
#[derive(Debug, Clone)]
pub struct KafkaConfig {
    /// Comma-separated bootstrap brokers (`host:port,host:port`).
    pub brokers: String,

    /// Topic carrying normalized records.
    pub topic: String,

    /// Consumer group of the writers.
    pub group_id: String,

    /// SASL/PLAIN username; SASL is enabled when both credentials are set.
    pub username: Option<String>,

    /// SASL/PLAIN password.
    pub password: Option<String>,

    /// Connect over TLS.
    pub tls: bool,

    /// Partitions for a newly created topic.
    pub partitions: i32,

    /// Replication factor for a newly created topic.
    pub replication: i32,

    /// How long a publish may wait for delivery.
    pub send_timeout: Duration,
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            brokers: "localhost:9092".to_string(),
            topic: "nvd-cves".to_string(),
            group_id: "CVE-Writers".to_string(),
            username: None,
            password: None,
            tls: false,
            partitions: 1,
            replication: 1,
            send_timeout: Duration::from_secs(5),
        }
    }
}

impl KafkaConfig {
    /// Base client configuration: brokers plus security settings.
    fn client_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        config.set("bootstrap.servers", self.brokers.as_str());

        match (&self.username, &self.password) {
            (Some(user), Some(pass)) => {
                let protocol = if self.tls { "SASL_SSL" } else { "SASL_PLAINTEXT" };
                config
                    .set("security.protocol", protocol)
                    .set("sasl.mechanism", "PLAIN")
                    .set("sasl.username", user.as_str())
                    .set("sasl.password", pass.as_str());
            }
            _ if self.tls => {
                config.set("security.protocol", "SSL");
            }
            _ => {}
        }

        config
    }

    /// Consumer group configuration. Offsets are committed in the background,
    /// but only once stored by an acknowledgement.
    fn consumer_config(&self) -> ClientConfig {
        let mut config = self.client_config();
        config
            .set("group.id", self.group_id.as_str())
            .set("enable.partition.eof", "false")
            .set("session.timeout.ms", "6000")
            .set("enable.auto.commit", "true")
            .set("enable.auto.offset.store", "false")
            .set("auto.offset.reset", "earliest");
        config
    }
}

/// Publishes normalized records to a Kafka topic.
pub struct KafkaPublisher {
    producer: FutureProducer,
    admin: AdminClient<DefaultClientContext>,
    config: KafkaConfig,
}

impl KafkaPublisher {
    /// Connect a producer.
    pub fn new(config: KafkaConfig) -> Result<Self> {
        let mut client_config = config.client_config();
        client_config.set(
            "message.timeout.ms",
            config.send_timeout.as_millis().to_string(),
        );

        let producer: FutureProducer = client_config.create()?;
        let admin: AdminClient<DefaultClientContext> = client_config.create()?;

        info!(brokers = %config.brokers, topic = %config.topic, "Kafka producer created");

        Ok(Self {
            producer,
            admin,
            config,
        })
    }

    /// Create the topic if it does not exist yet.
    pub async fn ensure_topic(&self) -> Result<()> {
        let topic = NewTopic::new(
            &self.config.topic,
            self.config.partitions.max(1),
            TopicReplication::Fixed(self.config.replication.max(1)),
        );
        let opts = AdminOptions::new().operation_timeout(Some(Duration::from_secs(30)));

        for result in self.admin.create_topics(&[topic], &opts).await? {
            match result {
                Ok(name) => info!(topic = %name, "Created Kafka topic"),
                Err((name, RDKafkaErrorCode::TopicAlreadyExists)) => {
                    debug!(topic = %name, "Kafka topic already exists");
                }
                Err((name, code)) => {
                    return Err(Error::Queue(format!(
                        "failed to create topic {}: {}",
                        name, code
                    )));
                }
            }
        }

        Ok(())
    }

    /// Wait for queued messages to be delivered.
    pub fn flush(&self, timeout: Duration) -> Result<()> {
        self.producer.flush(timeout)?;
        Ok(())
    }
}

#[async_trait]
impl MessageQueue for KafkaPublisher {
    async fn publish(&self, message: QueueMessage) -> Result<()> {
        let record = FutureRecord::to(&self.config.topic)
            .key(message.key.as_slice())
            .payload(message.value.as_slice());

        match self.producer.send(record, self.config.send_timeout).await {
            Ok(_) => Ok(()),
            Err((e, _)) => Err(Error::Kafka(e)),
        }
    }
}

/// Per-partition bookkeeping of delivered offsets.
#[derive(Debug)]
struct PartitionOffsets {
    /// Delivered, not yet settled.
    pending: BTreeSet<i64>,
    /// Settled as failed; the commit point never moves past these.
    failed: BTreeSet<i64>,
    /// Highest settled offset.
    highest: Option<i64>,
    /// Last offset handed to the client for commit.
    stored: i64,
}

/// Computes how far each partition may be committed.
#[derive(Debug, Default)]
struct OffsetTracker {
    partitions: HashMap<i32, PartitionOffsets>,
}

impl OffsetTracker {
    fn begin(&mut self, partition: i32, offset: i64) {
        self.partitions
            .entry(partition)
            .or_insert_with(|| PartitionOffsets {
                pending: BTreeSet::new(),
                failed: BTreeSet::new(),
                highest: None,
                stored: offset,
            })
            .pending
            .insert(offset);
    }

    /// Settle `offset` and return the next offset to store, if the commit
    /// point moved forward.
    fn finish(&mut self, partition: i32, offset: i64, processed: bool) -> Option<i64> {
        let state = self.partitions.get_mut(&partition)?;
        if !state.pending.remove(&offset) {
            return None;
        }
        if !processed {
            state.failed.insert(offset);
        }
        state.highest = Some(state.highest.map_or(offset, |h| h.max(offset)));

        let blocked = match (state.pending.first(), state.failed.first()) {
            (Some(a), Some(b)) => Some(*a.min(b)),
            (a, b) => a.or(b).copied(),
        };
        let next = match blocked {
            Some(offset) => offset,
            None => state.highest? + 1,
        };

        if next > state.stored {
            state.stored = next;
            Some(next)
        } else {
            None
        }
    }
}

/// Acknowledgement handle for one Kafka message.
struct KafkaAck {
    consumer: Arc<StreamConsumer>,
    tracker: Arc<Mutex<OffsetTracker>>,
    topic: String,
    partition: i32,
    offset: i64,
}

impl KafkaAck {
    fn store(&self, next: i64) -> KafkaResult<()> {
        let mut list = TopicPartitionList::new();
        list.add_partition_offset(&self.topic, self.partition, Offset::Offset(next))?;
        self.consumer.store_offsets(&list)
    }
}

impl Acknowledge for KafkaAck {
    fn settle(self: Box<Self>, processed: bool) {
        if !processed {
            warn!(
                partition = self.partition,
                offset = self.offset,
                "Message left unacknowledged for redelivery"
            );
        }

        let next = self
            .tracker
            .lock()
            .finish(self.partition, self.offset, processed);

        if let Some(next) = next
            && let Err(e) = self.store(next)
        {
            warn!(partition = self.partition, offset = next, error = %e, "Failed to store offset");
        }
    }
}

/// Reads normalized records from a Kafka topic as part of a consumer group.
pub struct KafkaSubscriber {
    consumer: Arc<StreamConsumer>,
    tracker: Arc<Mutex<OffsetTracker>>,
    topic: String,
}

impl KafkaSubscriber {
    /// Join the consumer group and subscribe to the topic.
    ///
    /// A new group starts from the earliest retained message.
    pub fn new(config: &KafkaConfig) -> Result<Self> {
        let consumer: StreamConsumer = config.consumer_config().create()?;
        consumer.subscribe(&[config.topic.as_str()])?;

        info!(
            brokers = %config.brokers,
            topic = %config.topic,
            group = %config.group_id,
            "Kafka consumer subscribed"
        );

        Ok(Self {
            consumer: Arc::new(consumer),
            tracker: Arc::new(Mutex::new(OffsetTracker::default())),
            topic: config.topic.clone(),
        })
    }
}

#[async_trait]
impl QueueSubscriber for KafkaSubscriber {
    async fn recv(&mut self) -> Option<Result<Delivery>> {
        let (message, partition, offset) = match self.consumer.recv().await {
            Ok(message) => (
                QueueMessage {
                    key: message.key().unwrap_or_default().to_vec(),
                    value: message.payload().unwrap_or_default().to_vec(),
                },
                message.partition(),
                message.offset(),
            ),
            Err(e) => {
                warn!(error = %e, "Kafka receive failed");
                return Some(Err(Error::Kafka(e)));
            }
        };

        self.tracker.lock().begin(partition, offset);
        let ack = KafkaAck {
            consumer: Arc::clone(&self.consumer),
            tracker: Arc::clone(&self.tracker),
            topic: self.topic.clone(),
            partition,
            offset,
        };

        Some(Ok(Delivery::with_ack(message, Box::new(ack))))
    }
}
