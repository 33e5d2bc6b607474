//! Queue client façade
//!
//! [`QueueClient`] owns at most one producer task and one consumer task,
//! started according to the `enable` flags of a [`QueueConfig`]. Both tasks
//! are bound to the caller's [`CancellationToken`]: cancelling it shuts the
//! client down. The client is an ordinary value, so several independent
//! clients can live in one process.

use crate::broker::Connectors;
use crate::config::QueueConfig;
use crate::consumer::{ConsumerTask, MessageHandler};
use crate::error::{QueueError, QueueResult};
use crate::producer::ProducerTask;
use crate::shutdown::ShutdownReport;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Outcome of [`QueueClient::shutdown`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClientShutdownReport {
    /// Producer outcome, if a producer was started
    pub producer: Option<ShutdownReport>,
    /// Consumer outcome, if a consumer was started
    pub consumer: Option<ShutdownReport>,
}

impl ClientShutdownReport {
    /// True when every started task stopped on its own
    pub fn is_clean(&self) -> bool {
        self.producer.map_or(true, |r| r.is_clean()) && self.consumer.map_or(true, |r| r.is_clean())
    }
}

/// Handle owning the producer and consumer tasks
pub struct QueueClient {
    producer: Option<ProducerTask>,
    consumer: Option<ConsumerTask>,
    cancel: CancellationToken,
    closed: AtomicBool,
}

impl QueueClient {
    /// Start the enabled tasks against Kafka
    #[cfg(feature = "kafka")]
    pub async fn init(cancel: CancellationToken, config: &QueueConfig) -> QueueResult<Self> {
        Self::init_with(cancel, config, &Connectors::kafka()).await
    }

    /// Start the enabled tasks using the given connectors.
    ///
    /// The consumer starts first. If either task fails to start, any task
    /// already running is closed and the error is returned.
    pub async fn init_with(
        cancel: CancellationToken,
        config: &QueueConfig,
        connectors: &Connectors,
    ) -> QueueResult<Self> {
        info!(
            producer_enabled = config.producer.enable,
            consumer_enabled = config.consumer.enable,
            "Initializing queue client"
        );

        let consumer = if config.consumer.enable {
            let consumer =
                ConsumerTask::start(&config.consumer, connectors.consumer.as_ref(), &cancel)
                    .await
                    .map_err(|e| {
                        error!("Failed to start consumer: {}", e);
                        e
                    })?;
            Some(consumer)
        } else {
            None
        };

        let producer = if config.producer.enable {
            match ProducerTask::start(&config.producer, connectors.producer.as_ref(), &cancel)
                .await
            {
                Ok(producer) => Some(producer),
                Err(e) => {
                    error!("Failed to start producer: {}", e);
                    if let Some(consumer) = &consumer {
                        consumer.close();
                    }
                    return Err(e);
                }
            }
        } else {
            None
        };

        Ok(Self {
            producer,
            consumer,
            cancel,
            closed: AtomicBool::new(false),
        })
    }

    /// Encode `message` and publish it to the producer's default topic
    pub async fn put<T: Serialize + ?Sized>(&self, message: &T) -> QueueResult<()> {
        let producer = self.producer()?;
        producer.put(producer.default_topic(), message).await
    }

    /// Encode `message` and publish it to `topic`
    pub async fn put_to_topic<T: Serialize + ?Sized>(
        &self,
        topic: &str,
        message: &T,
    ) -> QueueResult<()> {
        self.producer()?.put(topic, message).await
    }

    /// Register the consumer's message handler
    pub fn register_handler(&self, handler: impl MessageHandler) -> QueueResult<()> {
        self.consumer()?.register_handler(handler)
    }

    /// The running producer
    pub fn producer(&self) -> QueueResult<&ProducerTask> {
        self.producer.as_ref().ok_or(QueueError::ProducerNotEnabled)
    }

    /// The running consumer
    pub fn consumer(&self) -> QueueResult<&ConsumerTask> {
        self.consumer.as_ref().ok_or(QueueError::ConsumerNotEnabled)
    }

    /// Signal shutdown to the live tasks. Repeated calls are no-ops.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            debug!("Queue client already closed");
            return;
        }

        info!("Closing queue client");
        if let Some(consumer) = &self.consumer {
            consumer.close();
        }
        if let Some(producer) = &self.producer {
            producer.close();
        }
    }

    /// Whether the client was closed or its cancellation token fired
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.cancel.is_cancelled()
    }

    /// Close, then wait for each task within its grace period
    pub async fn shutdown(&self) -> ClientShutdownReport {
        self.close();

        let consumer = match &self.consumer {
            Some(consumer) => Some(consumer.shutdown().await),
            None => None,
        };
        let producer = match &self.producer {
            Some(producer) => Some(producer.shutdown().await),
            None => None,
        };

        ClientShutdownReport { producer, consumer }
    }
}

impl Drop for QueueClient {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for QueueClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueClient")
            .field("producer", &self.producer)
            .field("consumer", &self.consumer)
            .field("closed", &self.is_closed())
            .finish()
    }
}
