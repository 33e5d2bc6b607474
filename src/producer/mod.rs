//! Asynchronous producer task
//!
//! A [`ProducerTask`] owns a bounded outbound queue. Callers submit encoded
//! messages with [`ProducerTask::put`]; the enqueue loop forwards them to the
//! broker connection and the event loop logs the broker's acknowledgements
//! and failures. The queue capacity (`pool_size`) is the backpressure valve:
//! what `put` does when it is full is chosen by [`EnqueuePolicy`].

mod loops;

use crate::broker::{OutboundMessage, ProducerConnection, ProducerConnector};
use crate::codec;
use crate::config::{EnqueuePolicy, ProducerConfig};
use crate::error::{QueueError, QueueResult};
use crate::shutdown::{ShutdownReport, TaskShutdown};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::SendTimeoutError, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Handle to a running producer
#[derive(Debug)]
pub struct ProducerTask {
    topic: String,
    queue: mpsc::Sender<OutboundMessage>,
    policy: EnqueuePolicy,
    enqueue_timeout: Duration,
    shutdown: TaskShutdown,
}

impl ProducerTask {
    /// Connect to the broker and start the enqueue and event loops.
    ///
    /// The loops stop when `cancel` fires or [`close`](Self::close) is called.
    pub async fn start(
        config: &ProducerConfig,
        connector: &dyn ProducerConnector,
        cancel: &CancellationToken,
    ) -> QueueResult<Self> {
        config.validate().map_err(QueueError::Config)?;

        info!(
            hosts = ?config.hosts,
            topic = %config.topic,
            pool_size = config.pool_size,
            retry = config.retry,
            "Starting message queue producer"
        );

        let link = connector.connect(config).await.map_err(|e| match e {
            QueueError::BrokerConnect(_) => e,
            other => QueueError::BrokerConnect(other.to_string()),
        })?;

        let (queue_tx, queue_rx) = mpsc::channel(config.pool_size);
        let shutdown = TaskShutdown::new("producer", cancel, config.shutdown_grace());
        let connection: Arc<dyn ProducerConnection> = Arc::from(link.connection);

        shutdown.track(tokio::spawn(loops::enqueue_loop(
            queue_rx,
            connection,
            shutdown.token(),
            shutdown.state(),
            shutdown.grace(),
        )));
        shutdown.track(tokio::spawn(loops::event_loop(
            link.streams,
            shutdown.token(),
        )));

        Ok(Self {
            topic: config.topic.clone(),
            queue: queue_tx,
            policy: config.enqueue_policy,
            enqueue_timeout: config.enqueue_timeout(),
            shutdown,
        })
    }

    /// Default topic used by [`QueueClient::put`](crate::QueueClient::put)
    pub fn default_topic(&self) -> &str {
        &self.topic
    }

    /// Encode `message` and submit it to `topic`
    pub async fn put<T: Serialize + ?Sized>(&self, topic: &str, message: &T) -> QueueResult<()> {
        let payload = codec::encode(message)?;
        self.enqueue(OutboundMessage::new(topic, payload)).await
    }

    /// Submit an already encoded message
    pub async fn enqueue(&self, message: OutboundMessage) -> QueueResult<()> {
        if self.shutdown.is_signalled() {
            return Err(QueueError::ProducerClosed);
        }

        match self.policy {
            EnqueuePolicy::Block => self
                .queue
                .send(message)
                .await
                .map_err(|_| QueueError::ProducerClosed),
            EnqueuePolicy::FailFast => self.queue.try_send(message).map_err(|e| match e {
                TrySendError::Full(_) => QueueError::QueueFull,
                TrySendError::Closed(_) => QueueError::ProducerClosed,
            }),
            EnqueuePolicy::Timeout => self
                .queue
                .send_timeout(message, self.enqueue_timeout)
                .await
                .map_err(|e| match e {
                    SendTimeoutError::Timeout(_) => {
                        QueueError::EnqueueTimeout(self.enqueue_timeout)
                    }
                    SendTimeoutError::Closed(_) => QueueError::ProducerClosed,
                }),
        }
    }

    /// Messages waiting in the outbound queue
    pub fn queued(&self) -> usize {
        self.queue.max_capacity() - self.queue.capacity()
    }

    /// Capacity of the outbound queue
    pub fn pool_size(&self) -> usize {
        self.queue.max_capacity()
    }

    /// Signal the loops to stop. Repeated calls are no-ops.
    pub fn close(&self) {
        self.shutdown.signal();
    }

    /// Whether shutdown has been signalled
    pub fn is_closed(&self) -> bool {
        self.shutdown.is_signalled()
    }

    /// Close and wait for the loops, bounded by the grace period
    pub async fn shutdown(&self) -> ShutdownReport {
        self.close();
        self.shutdown.wait().await
    }
}
