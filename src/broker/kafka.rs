//! Kafka/Redpanda backend built on rdkafka
//!
//! The producer is a `ThreadedProducer` whose delivery callback feeds the
//! success and failure streams. The consumer is a `StreamConsumer` whose
//! context feeds the error and rebalance streams while a pump task forwards
//! messages. Offsets are auto-committed, which gives at-most-once handling.

use super::{
    DeliveryFailure, DeliveryReport, DeliveryStreams, GroupConnection, GroupConnector, GroupLink,
    GroupStreams, InboundMessage, OutboundMessage, ProducerConnection, ProducerConnector,
    ProducerLink, RebalanceNotification, TopicPartition,
};
use crate::config::{ConsumerConfig, ProducerConfig};
use crate::error::{BrokerError, QueueError, QueueResult};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use rdkafka::{
    client::ClientContext,
    consumer::{Consumer, ConsumerContext, Rebalance, StreamConsumer},
    error::{KafkaError, RDKafkaErrorCode},
    message::{BorrowedMessage, DeliveryResult, Message},
    producer::{BaseRecord, Producer, ProducerContext, ThreadedProducer},
    ClientConfig, TopicPartitionList,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Time allowed for the initial metadata round trip
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Pause before retrying when librdkafka's local queue is full
const QUEUE_FULL_BACKOFF: Duration = Duration::from_millis(50);
/// Upper bound for flushing buffered messages on close
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(30);

/// Connects Kafka producers
#[derive(Debug, Clone, Copy, Default)]
pub struct KafkaProducerConnector;

/// Joins Kafka consumer groups
#[derive(Debug, Clone, Copy, Default)]
pub struct KafkaGroupConnector;

struct DeliveryContext {
    successes: mpsc::UnboundedSender<DeliveryReport>,
    errors: mpsc::UnboundedSender<DeliveryFailure>,
}

impl ClientContext for DeliveryContext {}

impl ProducerContext for DeliveryContext {
    type DeliveryOpaque = ();

    fn delivery(&self, delivery_result: &DeliveryResult<'_>, _: Self::DeliveryOpaque) {
        match delivery_result {
            Ok(message) => {
                let _ = self.successes.send(DeliveryReport {
                    topic: message.topic().to_string(),
                    partition: message.partition(),
                    offset: message.offset(),
                    payload: Bytes::copy_from_slice(message.payload().unwrap_or_default()),
                });
            }
            Err((error, message)) => {
                let _ = self.errors.send(DeliveryFailure {
                    topic: message.topic().to_string(),
                    payload: Bytes::copy_from_slice(message.payload().unwrap_or_default()),
                    error: BrokerError::new(error.to_string()),
                });
            }
        }
    }
}

struct KafkaProducerConnection {
    producer: Arc<ThreadedProducer<DeliveryContext>>,
}

#[async_trait]
impl ProducerConnection for KafkaProducerConnection {
    async fn dispatch(&self, message: OutboundMessage) -> Result<(), BrokerError> {
        loop {
            let record = BaseRecord::<(), [u8]>::to(&message.topic).payload(&message.payload[..]);
            match self.producer.send(record) {
                Ok(()) => return Ok(()),
                Err((KafkaError::MessageProduction(RDKafkaErrorCode::QueueFull), _)) => {
                    tokio::time::sleep(QUEUE_FULL_BACKOFF).await;
                }
                Err((e, _)) => return Err(BrokerError::new(e.to_string())),
            }
        }
    }

    fn async_close(&self) {
        let producer = self.producer.clone();
        tokio::task::spawn_blocking(move || {
            if let Err(e) = producer.flush(CLOSE_FLUSH_TIMEOUT) {
                warn!("Producer flush on close failed: {}", e);
            }
        });
    }
}

#[async_trait]
impl ProducerConnector for KafkaProducerConnector {
    async fn connect(&self, config: &ProducerConfig) -> QueueResult<ProducerLink> {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", config.bootstrap_servers())
            .set("acks", config.required_acks.to_string())
            .set("message.send.max.retries", config.retry.to_string())
            .set("retry.backoff.ms", config.retry_backoff_ms.to_string());
        for (key, value) in &config.properties {
            client_config.set(key, value);
        }

        let (success_tx, successes) = mpsc::unbounded_channel();
        let (error_tx, errors) = mpsc::unbounded_channel();
        let context = DeliveryContext {
            successes: success_tx,
            errors: error_tx,
        };

        let producer: ThreadedProducer<DeliveryContext> = client_config
            .create_with_context(context)
            .map_err(|e| QueueError::BrokerConnect(format!("Failed to create producer: {}", e)))?;
        let producer = Arc::new(producer);

        let probe = producer.clone();
        tokio::task::spawn_blocking(move || {
            probe
                .client()
                .fetch_metadata(None, CONNECT_TIMEOUT)
                .map(|_| ())
        })
        .await
        .map_err(|e| QueueError::BrokerConnect(e.to_string()))?
        .map_err(|e| QueueError::BrokerConnect(format!("Broker unreachable: {}", e)))?;

        info!(hosts = %config.bootstrap_servers(), "Connected Kafka producer");

        Ok(ProducerLink {
            connection: Box::new(KafkaProducerConnection { producer }),
            streams: DeliveryStreams { successes, errors },
        })
    }
}

struct GroupContext {
    errors: mpsc::UnboundedSender<BrokerError>,
    notifications: mpsc::UnboundedSender<RebalanceNotification>,
}

impl ClientContext for GroupContext {
    fn error(&self, error: KafkaError, reason: &str) {
        let _ = self
            .errors
            .send(BrokerError::new(format!("{}: {}", error, reason)));
    }
}

impl ConsumerContext for GroupContext {
    fn post_rebalance(&self, rebalance: &Rebalance<'_>) {
        let notification = match rebalance {
            Rebalance::Assign(tpl) => RebalanceNotification::Assigned(partitions(tpl)),
            Rebalance::Revoke(tpl) => RebalanceNotification::Revoked(partitions(tpl)),
            Rebalance::Error(e) => RebalanceNotification::Failed(e.to_string()),
        };
        let _ = self.notifications.send(notification);
    }
}

fn partitions(tpl: &TopicPartitionList) -> Vec<TopicPartition> {
    tpl.elements()
        .iter()
        .map(|elem| TopicPartition::new(elem.topic(), elem.partition()))
        .collect()
}

fn inbound(message: &BorrowedMessage<'_>) -> InboundMessage {
    InboundMessage {
        topic: message.topic().to_string(),
        partition: message.partition(),
        offset: message.offset(),
        key: message.key().map(Bytes::copy_from_slice),
        payload: Bytes::copy_from_slice(message.payload().unwrap_or_default()),
    }
}

type GroupConsumer = StreamConsumer<GroupContext>;

async fn pump_messages(
    consumer: Arc<GroupConsumer>,
    messages: mpsc::Sender<InboundMessage>,
    errors: mpsc::UnboundedSender<BrokerError>,
    token: CancellationToken,
) {
    let mut stream = consumer.stream();

    loop {
        let message = tokio::select! {
            _ = token.cancelled() => break,
            next = stream.next() => match next {
                Some(Ok(message)) => inbound(&message),
                Some(Err(e)) => {
                    let _ = errors.send(BrokerError::new(e.to_string()));
                    continue;
                }
                None => break,
            }
        };

        if messages.send(message).await.is_err() {
            break;
        }
    }

    debug!("Kafka message pump stopped");
}

struct KafkaGroupConnection {
    consumer: Arc<GroupConsumer>,
    pump: CancellationToken,
}

impl GroupConnection for KafkaGroupConnection {
    fn close(&self) {
        if self.pump.is_cancelled() {
            return;
        }
        self.pump.cancel();
        self.consumer.unsubscribe();
    }
}

impl Drop for KafkaGroupConnection {
    fn drop(&mut self) {
        self.close();
    }
}

#[async_trait]
impl GroupConnector for KafkaGroupConnector {
    async fn join(&self, config: &ConsumerConfig) -> QueueResult<GroupLink> {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", config.bootstrap_servers())
            .set("group.id", &config.group)
            .set("enable.auto.commit", "true")
            .set("enable.partition.eof", "false")
            .set("auto.offset.reset", config.offset_reset.as_str())
            .set("session.timeout.ms", config.session_timeout_ms.to_string());
        for (key, value) in &config.properties {
            client_config.set(key, value);
        }

        let (error_tx, errors) = mpsc::unbounded_channel();
        let (notification_tx, notifications) = mpsc::unbounded_channel();
        let (message_tx, messages) = mpsc::channel(config.message_buffer);
        let context = GroupContext {
            errors: error_tx.clone(),
            notifications: notification_tx,
        };

        let consumer: GroupConsumer = client_config
            .create_with_context(context)
            .map_err(|e| QueueError::BrokerConnect(format!("Failed to create consumer: {}", e)))?;

        let topics: Vec<&str> = config.topics.iter().map(String::as_str).collect();
        consumer
            .subscribe(&topics)
            .map_err(|e| QueueError::BrokerConnect(format!("Failed to subscribe: {}", e)))?;
        let consumer = Arc::new(consumer);

        let probe = consumer.clone();
        tokio::task::spawn_blocking(move || probe.fetch_metadata(None, CONNECT_TIMEOUT).map(|_| ()))
            .await
            .map_err(|e| QueueError::BrokerConnect(e.to_string()))?
            .map_err(|e| QueueError::BrokerConnect(format!("Broker unreachable: {}", e)))?;

        info!(group = %config.group, topics = ?config.topics, "Joined Kafka consumer group");

        let pump = CancellationToken::new();
        tokio::spawn(pump_messages(
            consumer.clone(),
            message_tx,
            error_tx,
            pump.clone(),
        ));

        Ok(GroupLink {
            connection: Box::new(KafkaGroupConnection { consumer, pump }),
            streams: GroupStreams {
                errors,
                notifications,
                messages,
            },
        })
    }
}
