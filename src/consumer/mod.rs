//! Consumer group task
//!
//! A [`ConsumerTask`] joins a consumer group and runs a single delivery loop
//! over three streams: broker errors, rebalance notifications and messages.
//! Errors and notifications are logged. Each message is passed to the
//! registered [`MessageHandler`] and awaited before the next one is taken.
//!
//! Delivery is at-most-once: a message taken off the stream counts as
//! consumed whether or not a handler was registered, and the broker client
//! commits its offset on its own schedule.
//!
//! # Example
//!
//! ```no_run
//! use mq_rs::broker::memory::MemoryBroker;
//! use mq_rs::consumer::{handler_fn, ConsumerTask};
//! use mq_rs::config::ConsumerConfig;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> mq_rs::QueueResult<()> {
//! let config = ConsumerConfig::builder()
//!     .hosts(vec!["localhost:9092".to_string()])
//!     .group("billing")
//!     .topics(vec!["orders".to_string()])
//!     .build();
//!
//! let broker = MemoryBroker::new();
//! let cancel = CancellationToken::new();
//! let consumer = ConsumerTask::start(&config, &broker, &cancel).await?;
//! consumer.register_handler(handler_fn(|payload| {
//!     println!("{}", String::from_utf8_lossy(payload));
//! }))?;
//! # Ok(())
//! # }
//! ```

mod delivery;
pub mod handler;

pub use delivery::DeliveryStats;
pub use handler::{handler_fn, json_handler, FnHandler, HandlerSlot, JsonHandler, MessageHandler};

use crate::broker::GroupConnector;
use crate::config::ConsumerConfig;
use crate::error::{QueueError, QueueResult};
use crate::shutdown::{ShutdownReport, TaskShutdown};
use delivery::DeliveryLoop;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Handle to a running consumer
pub struct ConsumerTask {
    group: String,
    topics: Vec<String>,
    handler: Arc<HandlerSlot>,
    stats: Arc<DeliveryStats>,
    shutdown: TaskShutdown,
}

impl ConsumerTask {
    /// Join the group and start the delivery loop without a handler
    pub async fn start(
        config: &ConsumerConfig,
        connector: &dyn GroupConnector,
        cancel: &CancellationToken,
    ) -> QueueResult<Self> {
        Self::start_inner(config, connector, cancel, HandlerSlot::new()).await
    }

    /// Join the group with `handler` in place before the first delivery
    pub async fn start_with_handler(
        config: &ConsumerConfig,
        connector: &dyn GroupConnector,
        cancel: &CancellationToken,
        handler: impl MessageHandler,
    ) -> QueueResult<Self> {
        Self::start_inner(config, connector, cancel, HandlerSlot::with(Arc::new(handler))).await
    }

    async fn start_inner(
        config: &ConsumerConfig,
        connector: &dyn GroupConnector,
        cancel: &CancellationToken,
        handler: HandlerSlot,
    ) -> QueueResult<Self> {
        config.validate().map_err(QueueError::Config)?;

        info!(
            hosts = ?config.hosts,
            group = %config.group,
            topics = ?config.topics,
            "Starting message queue consumer"
        );

        let link = connector.join(config).await.map_err(|e| match e {
            QueueError::BrokerConnect(_) => e,
            other => QueueError::BrokerConnect(other.to_string()),
        })?;

        let handler = Arc::new(handler);
        let stats = Arc::new(DeliveryStats::default());
        let shutdown = TaskShutdown::new("consumer", cancel, config.shutdown_grace());

        let delivery = DeliveryLoop {
            group: config.group.clone(),
            connection: link.connection,
            streams: link.streams,
            handler: handler.clone(),
            stats: stats.clone(),
            token: shutdown.token(),
            state: shutdown.state(),
        };
        shutdown.track(tokio::spawn(delivery.run()));

        Ok(Self {
            group: config.group.clone(),
            topics: config.topics.clone(),
            handler,
            stats,
            shutdown,
        })
    }

    /// Register the message handler. Only one handler may be registered.
    pub fn register_handler(&self, handler: impl MessageHandler) -> QueueResult<()> {
        self.register_shared(Arc::new(handler))
    }

    /// Register a handler that is already shared
    pub fn register_shared(&self, handler: Arc<dyn MessageHandler>) -> QueueResult<()> {
        let name = handler.name().to_string();
        self.handler.set(handler)?;
        info!(group = %self.group, handler = %name, "Registered message handler");
        Ok(())
    }

    /// Whether a handler has been registered
    pub fn has_handler(&self) -> bool {
        self.handler.is_set()
    }

    /// Consumer group ID
    pub fn group(&self) -> &str {
        &self.group
    }

    /// Subscribed topics
    pub fn topics(&self) -> &[String] {
        &self.topics
    }

    /// Delivery counters
    pub fn stats(&self) -> &DeliveryStats {
        &self.stats
    }

    /// Signal the delivery loop to stop. Repeated calls are no-ops.
    pub fn close(&self) {
        self.shutdown.signal();
    }

    /// Whether shutdown has been signalled
    pub fn is_closed(&self) -> bool {
        self.shutdown.is_signalled()
    }

    /// Whether the delivery loop has left the group
    pub fn is_finished(&self) -> bool {
        self.shutdown.is_complete()
    }

    /// Close and wait for the delivery loop, bounded by the grace period
    pub async fn shutdown(&self) -> ShutdownReport {
        self.close();
        self.shutdown.wait().await
    }
}

impl std::fmt::Debug for ConsumerTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerTask")
            .field("group", &self.group)
            .field("topics", &self.topics)
            .field("has_handler", &self.has_handler())
            .field("closed", &self.is_closed())
            .finish()
    }
}
