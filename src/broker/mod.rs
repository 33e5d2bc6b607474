//! Broker connection abstractions
//!
//! The producer and consumer tasks never talk to the network themselves. They
//! drive a connection obtained from a connector:
//!
//! - [`ProducerConnector`] yields a [`ProducerConnection`] that buffers and
//!   publishes messages, plus the [`DeliveryStreams`] on which the broker
//!   client reports acknowledgements and failures.
//! - [`GroupConnector`] joins a consumer group and yields a
//!   [`GroupConnection`] plus the [`GroupStreams`] carrying errors, rebalance
//!   notifications and messages.
//!
//! Two backends are provided: [`kafka`] (behind the `kafka` feature) and the
//! in-process [`memory`] broker.

#[cfg(feature = "kafka")]
pub mod kafka;
pub mod memory;

use crate::config::{ConsumerConfig, ProducerConfig};
use crate::error::{BrokerError, QueueResult};
use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use tokio::sync::mpsc;

/// A message waiting to be published
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    /// Destination topic
    pub topic: String,
    /// Encoded body
    pub payload: Bytes,
}

impl OutboundMessage {
    /// Address an encoded body to a topic
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

/// A message delivered to the consumer group
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    /// Source topic
    pub topic: String,
    /// Source partition
    pub partition: i32,
    /// Offset within the partition
    pub offset: i64,
    /// Message key, if the publisher set one
    pub key: Option<Bytes>,
    /// Raw body
    pub payload: Bytes,
}

/// Broker acknowledgement of a published message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReport {
    /// Topic the message was written to
    pub topic: String,
    /// Partition the message was written to
    pub partition: i32,
    /// Offset assigned by the broker
    pub offset: i64,
    /// Published body
    pub payload: Bytes,
}

/// A message the broker client gave up on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryFailure {
    /// Destination topic
    pub topic: String,
    /// Body that was not published
    pub payload: Bytes,
    /// Reason reported by the broker client
    pub error: BrokerError,
}

/// A topic partition owned by this group member
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TopicPartition {
    /// Topic name
    pub topic: String,
    /// Partition number
    pub partition: i32,
}

impl TopicPartition {
    /// Name a partition of a topic
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.topic, self.partition)
    }
}

/// Consumer group rebalance events
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RebalanceNotification {
    /// Partitions assigned to this member
    Assigned(Vec<TopicPartition>),
    /// Partitions taken away from this member
    Revoked(Vec<TopicPartition>),
    /// The rebalance itself failed
    Failed(String),
}

impl fmt::Display for RebalanceNotification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn join(partitions: &[TopicPartition]) -> String {
            partitions
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ")
        }

        match self {
            RebalanceNotification::Assigned(tpl) => write!(f, "assigned [{}]", join(tpl)),
            RebalanceNotification::Revoked(tpl) => write!(f, "revoked [{}]", join(tpl)),
            RebalanceNotification::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}

/// Acknowledgement and failure streams of a producer connection
#[derive(Debug)]
pub struct DeliveryStreams {
    /// Acknowledged publishes
    pub successes: mpsc::UnboundedReceiver<DeliveryReport>,
    /// Publishes the broker client gave up on
    pub errors: mpsc::UnboundedReceiver<DeliveryFailure>,
}

/// The three independent streams of a group connection
#[derive(Debug)]
pub struct GroupStreams {
    /// Errors reported by the group client
    pub errors: mpsc::UnboundedReceiver<BrokerError>,
    /// Rebalance events
    pub notifications: mpsc::UnboundedReceiver<RebalanceNotification>,
    /// Consumed messages
    pub messages: mpsc::Receiver<InboundMessage>,
}

/// A live asynchronous producer connection
#[async_trait]
pub trait ProducerConnection: Send + Sync + 'static {
    /// Hand a message to the client's internal buffer.
    ///
    /// Waits while that buffer is full. The outcome of the publish arrives
    /// later on the delivery streams.
    async fn dispatch(&self, message: OutboundMessage) -> Result<(), BrokerError>;

    /// Begin closing without waiting; buffered messages may still be flushed
    fn async_close(&self);
}

/// Opens producer connections
#[async_trait]
pub trait ProducerConnector: Send + Sync {
    /// Open a connection for the given producer settings
    async fn connect(&self, config: &ProducerConfig) -> QueueResult<ProducerLink>;
}

/// A joined consumer group membership
pub trait GroupConnection: Send + Sync + 'static {
    /// Leave the group and stop fetching
    fn close(&self);
}

/// Joins consumer groups
#[async_trait]
pub trait GroupConnector: Send + Sync {
    /// Join the configured group and subscribe to its topics
    async fn join(&self, config: &ConsumerConfig) -> QueueResult<GroupLink>;
}

/// Result of a successful producer connect
pub struct ProducerLink {
    /// Input side of the connection
    pub connection: Box<dyn ProducerConnection>,
    /// Delivery outcomes
    pub streams: DeliveryStreams,
}

/// Result of a successful group join
pub struct GroupLink {
    /// Membership handle
    pub connection: Box<dyn GroupConnection>,
    /// Errors, notifications and messages
    pub streams: GroupStreams,
}

/// Connectors used by the client façade to start its tasks
#[derive(Clone)]
pub struct Connectors {
    /// Used to start the producer task
    pub producer: std::sync::Arc<dyn ProducerConnector>,
    /// Used to start the consumer task
    pub consumer: std::sync::Arc<dyn GroupConnector>,
}

impl Connectors {
    /// Pair a producer connector with a group connector
    pub fn new(
        producer: std::sync::Arc<dyn ProducerConnector>,
        consumer: std::sync::Arc<dyn GroupConnector>,
    ) -> Self {
        Self { producer, consumer }
    }

    /// Both connectors backed by the same in-process broker
    pub fn memory(broker: &memory::MemoryBroker) -> Self {
        Self::new(
            std::sync::Arc::new(broker.clone()),
            std::sync::Arc::new(broker.clone()),
        )
    }

    /// Kafka-backed connectors
    #[cfg(feature = "kafka")]
    pub fn kafka() -> Self {
        Self::new(
            std::sync::Arc::new(kafka::KafkaProducerConnector),
            std::sync::Arc::new(kafka::KafkaGroupConnector),
        )
    }
}
