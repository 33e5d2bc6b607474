//! Error types for the queue client

use std::io;
use std::time::Duration;
use thiserror::Error;

/// Result type for queue client operations
pub type QueueResult<T> = Result<T, QueueError>;

/// Queue client error types
#[derive(Error, Debug)]
pub enum QueueError {
    /// Missing or invalid configuration for an enabled task
    #[error("Configuration error: {0}")]
    Config(String),

    /// Initial broker connection or group join failed
    #[error("Broker connection error: {0}")]
    BrokerConnect(String),

    /// Message could not be serialized
    #[error("Encode error: {0}")]
    Encode(#[source] serde_json::Error),

    /// Payload could not be deserialized
    #[error("Decode error: {0}")]
    Decode(#[source] serde_json::Error),

    /// No producer task is running
    #[error("Producer is not enabled")]
    ProducerNotEnabled,

    /// No consumer task is running
    #[error("Consumer is not enabled")]
    ConsumerNotEnabled,

    /// The outbound queue has no free slot
    #[error("Producer queue is full")]
    QueueFull,

    /// No slot became free within the configured wait
    #[error("Timed out after {0:?} waiting for a producer queue slot")]
    EnqueueTimeout(Duration),

    /// The enqueue loop has stopped accepting messages
    #[error("Producer has been closed")]
    ProducerClosed,

    /// A handler was already registered on the consumer
    #[error("A message handler is already registered")]
    HandlerAlreadyRegistered,

    /// Transient broker-reported error
    #[error("Broker error: {0}")]
    Broker(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// YAML configuration parse errors
    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Kafka client errors
    #[cfg(feature = "kafka")]
    #[error("Kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),
}

impl QueueError {
    /// Check if the failed operation may succeed when attempted again
    pub fn is_retryable(&self) -> bool {
        match self {
            QueueError::BrokerConnect(_) => true,
            QueueError::QueueFull => true,
            QueueError::EnqueueTimeout(_) => true,
            QueueError::Broker(_) => true,
            QueueError::Io(_) => true,
            #[cfg(feature = "kafka")]
            QueueError::Kafka(_) => true,
            _ => false,
        }
    }

    /// Get error severity
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            QueueError::Config(_) => ErrorSeverity::Fatal,
            QueueError::BrokerConnect(_) => ErrorSeverity::Fatal,
            QueueError::Yaml(_) => ErrorSeverity::Fatal,
            QueueError::QueueFull => ErrorSeverity::Warning,
            QueueError::EnqueueTimeout(_) => ErrorSeverity::Warning,
            QueueError::Broker(_) => ErrorSeverity::Warning,
            _ => ErrorSeverity::Error,
        }
    }
}

/// Error severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    /// Expected under load or broker churn; the caller keeps going
    Warning,
    /// The operation failed but the client stays healthy
    Error,
    /// The task could not start
    Fatal,
}

/// Error reported by a live broker connection on one of its streams
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct BrokerError {
    /// Human readable reason from the broker client
    pub message: String,
}

impl BrokerError {
    /// Create a broker error from any displayable reason
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<BrokerError> for QueueError {
    fn from(err: BrokerError) -> Self {
        QueueError::Broker(err.message)
    }
}
