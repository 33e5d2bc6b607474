//! Embedded Kafka/Redpanda queue client
//!
//! This library gives a service one handle for publishing to and consuming
//! from a log-based broker:
//!
//! - asynchronous publishing through a bounded queue with a configurable
//!   full-queue policy and broker-side retries,
//! - consumer-group membership with rebalance and error logging and a
//!   single registered message handler,
//! - shutdown bound to a caller-owned cancellation token with a grace
//!   period.
//!
//! # Example
//!
//! ```no_run
//! use mq_rs::{QueueClient, QueueConfig, Connectors};
//! use mq_rs::broker::memory::MemoryBroker;
//! use mq_rs::consumer::handler_fn;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = QueueConfig::from_yaml_str(r#"
//! consumer:
//!   enable: true
//!   group: billing
//!   hosts: ["localhost:9092"]
//!   topic: orders
//! producer:
//!   enable: true
//!   hosts: ["localhost:9092"]
//!   topic: orders
//!   pool_size: 300
//!   retry: 3
//! "#)?;
//!
//! let cancel = CancellationToken::new();
//! let broker = MemoryBroker::new();
//! let client = QueueClient::init_with(cancel.clone(), &config, &Connectors::memory(&broker)).await?;
//!
//! client.register_handler(handler_fn(|payload| {
//!     tracing::info!("received {}", String::from_utf8_lossy(payload));
//! }))?;
//! client.put(&serde_json::json!({ "order": 42 })).await?;
//!
//! cancel.cancel();
//! client.shutdown().await;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]
#![allow(clippy::module_inception)]

// Re-export commonly used items
pub use broker::{Connectors, InboundMessage, OutboundMessage};
pub use client::{ClientShutdownReport, QueueClient};
pub use config::{ConsumerConfig, EnqueuePolicy, ProducerConfig, QueueConfig};
pub use consumer::{handler_fn, json_handler, ConsumerTask, MessageHandler};
pub use error::{BrokerError, ErrorSeverity, QueueError, QueueResult};
pub use producer::ProducerTask;

/// Broker connection seam and backends
pub mod broker;

/// Client façade
pub mod client;

/// JSON message codec
pub mod codec;

/// Configuration
pub mod config;

/// Consumer group task
pub mod consumer;

/// Error types
pub mod error;

/// Producer task
pub mod producer;

/// Shutdown coordination
pub mod shutdown;

/// Logging setup
pub mod telemetry;
