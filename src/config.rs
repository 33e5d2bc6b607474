//! Producer and consumer configuration

use crate::error::{QueueError, QueueResult};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Broker client properties that may be passed through `properties`
pub const ALLOWED_BROKER_PROPS: &[&str] = &[
    // Compression settings
    "compression.type",
    "compression.level",
    // Fetch settings
    "fetch.min.bytes",
    "fetch.max.wait.ms",
    "fetch.max.bytes",
    "max.partition.fetch.bytes",
    // Request settings
    "request.timeout.ms",
    "metadata.max.age.ms",
    "receive.buffer.bytes",
    "send.buffer.bytes",
    // Producer settings
    "linger.ms",
    "batch.size",
    "queue.buffering.max.messages",
    "message.timeout.ms",
    "message.max.bytes",
    // Connection settings
    "client.id",
    "reconnect.backoff.ms",
    "reconnect.backoff.max.ms",
    "connections.max.idle.ms",
    "socket.keepalive.enable",
    // Security
    "security.protocol",
    "sasl.mechanism",
    "sasl.username",
    "sasl.password",
    // Monitoring
    "statistics.interval.ms",
];

/// Merged queue configuration as loaded from the service config file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Consumer group settings
    #[serde(default)]
    pub consumer: ConsumerConfig,

    /// Producer settings
    #[serde(default)]
    pub producer: ProducerConfig,
}

impl QueueConfig {
    /// Parse a YAML document
    pub fn from_yaml_str(yaml: &str) -> QueueResult<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Load a YAML config file
    pub fn from_file(path: impl AsRef<Path>) -> QueueResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&contents)
    }

    /// Validate the enabled sections
    pub fn validate(&self) -> QueueResult<()> {
        if self.consumer.enable {
            self.consumer.validate().map_err(QueueError::Config)?;
        }
        if self.producer.enable {
            self.producer.validate().map_err(QueueError::Config)?;
        }
        Ok(())
    }
}

/// What `put` does when the outbound queue is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnqueuePolicy {
    /// Wait for a free slot
    #[default]
    Block,
    /// Return `QueueFull` immediately
    FailFast,
    /// Wait up to `enqueue_timeout_ms`, then return `EnqueueTimeout`
    Timeout,
}

/// Where a new consumer group starts reading
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OffsetReset {
    /// Only messages published after the group joined
    #[default]
    Latest,
    /// From the beginning of each partition
    Earliest,
}

impl OffsetReset {
    /// Value understood by the broker client
    pub fn as_str(&self) -> &'static str {
        match self {
            OffsetReset::Latest => "latest",
            OffsetReset::Earliest => "earliest",
        }
    }
}

/// Producer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProducerConfig {
    /// Start a producer task
    pub enable: bool,

    /// Broker addresses
    pub hosts: Vec<String>,

    /// Default topic used by `put`
    pub topic: String,

    /// Capacity of the outbound bounded queue
    #[serde(alias = "poolSize")]
    pub pool_size: usize,

    /// Broker-side publish retries
    pub retry: u32,

    /// Backoff between publish retries
    #[serde(alias = "retryBackoffMs")]
    pub retry_backoff_ms: u64,

    /// Acknowledgements required from the broker
    #[serde(alias = "requiredAcks")]
    pub required_acks: i16,

    /// Behaviour of `put` when the queue is full
    #[serde(alias = "enqueuePolicy")]
    pub enqueue_policy: EnqueuePolicy,

    /// Wait limit for `EnqueuePolicy::Timeout`
    #[serde(alias = "enqueueTimeoutMs")]
    pub enqueue_timeout_ms: u64,

    /// How long shutdown waits for the loops before abandoning them
    #[serde(alias = "shutdownGraceMs")]
    pub shutdown_grace_ms: u64,

    /// Additional broker client properties
    pub properties: HashMap<String, String>,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            enable: false,
            hosts: Vec::new(),
            topic: String::new(),
            pool_size: 300,
            retry: 3,
            retry_backoff_ms: 3000,
            required_acks: 1,
            enqueue_policy: EnqueuePolicy::Block,
            enqueue_timeout_ms: 1000,
            shutdown_grace_ms: 5000,
            properties: HashMap::new(),
        }
    }
}

impl ProducerConfig {
    /// Create a new producer config builder
    pub fn builder() -> ProducerConfigBuilder {
        ProducerConfigBuilder::new()
    }

    /// Backoff between publish retries
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    /// Wait limit for `EnqueuePolicy::Timeout`
    pub fn enqueue_timeout(&self) -> Duration {
        Duration::from_millis(self.enqueue_timeout_ms)
    }

    /// Shutdown grace period
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// Broker addresses in bootstrap form
    pub fn bootstrap_servers(&self) -> String {
        self.hosts.join(",")
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        validate_hosts(&self.hosts)?;

        if self.topic.trim().is_empty() {
            return Err("Producer topic cannot be empty".to_string());
        }

        if self.pool_size == 0 {
            return Err("Pool size must be greater than 0".to_string());
        }

        if !matches!(self.required_acks, -1..=1) {
            return Err(format!(
                "Required acks must be -1, 0 or 1, got {}",
                self.required_acks
            ));
        }

        if self.enqueue_policy == EnqueuePolicy::Timeout && self.enqueue_timeout_ms == 0 {
            return Err("Enqueue timeout must be greater than 0".to_string());
        }

        validate_properties(&self.properties)
    }
}

/// Builder for ProducerConfig
pub struct ProducerConfigBuilder {
    config: ProducerConfig,
}

impl ProducerConfigBuilder {
    /// Create a builder for an enabled producer
    pub fn new() -> Self {
        Self {
            config: ProducerConfig {
                enable: true,
                ..ProducerConfig::default()
            },
        }
    }

    /// Set the broker addresses
    pub fn hosts(mut self, hosts: Vec<String>) -> Self {
        self.config.hosts = hosts;
        self
    }

    /// Set the default topic
    pub fn topic(mut self, topic: impl Into<String>) -> Self {
        self.config.topic = topic.into();
        self
    }

    /// Set the outbound queue capacity
    pub fn pool_size(mut self, size: usize) -> Self {
        self.config.pool_size = size;
        self
    }

    /// Set the broker-side retry count
    /// Set the broker-side publish retries
    pub fn retry(mut self, retry: u32) -> Self {
        self.config.retry = retry;
        self
    }

    /// Set what `put` does when the queue is full
    pub fn enqueue_policy(mut self, policy: EnqueuePolicy) -> Self {
        self.config.enqueue_policy = policy;
        self
    }

    /// Set the wait limit used by `EnqueuePolicy::Timeout`
    pub fn enqueue_timeout(mut self, timeout: Duration) -> Self {
        self.config.enqueue_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set how long shutdown lets the task finish its work
    pub fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.config.shutdown_grace_ms = grace.as_millis() as u64;
        self
    }

    /// Add a custom broker client property
    pub fn property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.properties.insert(key.into(), value.into());
        self
    }

    /// Build the producer configuration
    pub fn build(self) -> ProducerConfig {
        self.config
    }
}

impl Default for ProducerConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Consumer group configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    /// Start a consumer task
    pub enable: bool,

    /// Consumer group ID
    pub group: String,

    /// Broker addresses
    pub hosts: Vec<String>,

    /// Topics to consume from; a single string is accepted
    #[serde(alias = "topic", deserialize_with = "one_or_many")]
    pub topics: Vec<String>,

    /// Offset reset policy for a group without committed offsets
    #[serde(alias = "offsetReset")]
    pub offset_reset: OffsetReset,

    /// Group session timeout
    #[serde(alias = "sessionTimeoutMs")]
    pub session_timeout_ms: u32,

    /// Capacity of the inbound message stream
    #[serde(alias = "messageBuffer")]
    pub message_buffer: usize,

    /// How long shutdown waits for the delivery loop
    #[serde(alias = "shutdownGraceMs")]
    pub shutdown_grace_ms: u64,

    /// Additional broker client properties
    pub properties: HashMap<String, String>,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            enable: false,
            group: String::new(),
            hosts: Vec::new(),
            topics: Vec::new(),
            offset_reset: OffsetReset::Latest,
            session_timeout_ms: 30000,
            message_buffer: 256,
            shutdown_grace_ms: 5000,
            properties: HashMap::new(),
        }
    }
}

impl ConsumerConfig {
    /// Create a new consumer config builder
    pub fn builder() -> ConsumerConfigBuilder {
        ConsumerConfigBuilder::new()
    }

    /// Shutdown grace period
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// Broker addresses in bootstrap form
    pub fn bootstrap_servers(&self) -> String {
        self.hosts.join(",")
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        validate_hosts(&self.hosts)?;

        if self.group.trim().is_empty() {
            return Err("Group ID cannot be empty".to_string());
        }

        if self.topics.is_empty() || self.topics.iter().any(|t| t.trim().is_empty()) {
            return Err("Topics cannot be empty".to_string());
        }

        if self.message_buffer == 0 {
            return Err("Message buffer must be greater than 0".to_string());
        }

        validate_properties(&self.properties)
    }
}

/// Builder for ConsumerConfig
pub struct ConsumerConfigBuilder {
    config: ConsumerConfig,
}

impl ConsumerConfigBuilder {
    /// Create a builder for an enabled consumer
    pub fn new() -> Self {
        Self {
            config: ConsumerConfig {
                enable: true,
                ..ConsumerConfig::default()
            },
        }
    }

    /// Set the broker addresses
    pub fn hosts(mut self, hosts: Vec<String>) -> Self {
        self.config.hosts = hosts;
        self
    }

    /// Set the consumer group ID
    pub fn group(mut self, group: impl Into<String>) -> Self {
        self.config.group = group.into();
        self
    }

    /// Set the topics to consume
    pub fn topics(mut self, topics: Vec<String>) -> Self {
        self.config.topics = topics;
        self
    }

    /// Set where a group without committed offsets starts
    pub fn offset_reset(mut self, reset: OffsetReset) -> Self {
        self.config.offset_reset = reset;
        self
    }

    /// Set the capacity of the inbound message stream
    pub fn message_buffer(mut self, size: usize) -> Self {
        self.config.message_buffer = size;
        self
    }

    /// Set how long shutdown lets the task finish its work
    pub fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.config.shutdown_grace_ms = grace.as_millis() as u64;
        self
    }

    /// Add a custom broker client property
    pub fn property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.properties.insert(key.into(), value.into());
        self
    }

    /// Build the consumer configuration
    pub fn build(self) -> ConsumerConfig {
        self.config
    }
}

impl Default for ConsumerConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn validate_hosts(hosts: &[String]) -> Result<(), String> {
    if hosts.is_empty() {
        return Err("Hosts cannot be empty".to_string());
    }
    if hosts.iter().any(|h| h.trim().is_empty()) {
        return Err("Hosts cannot contain blank entries".to_string());
    }
    Ok(())
}

fn validate_properties(properties: &HashMap<String, String>) -> Result<(), String> {
    for key in properties.keys() {
        if !ALLOWED_BROKER_PROPS.contains(&key.as_str()) {
            return Err(format!("Disallowed broker property '{}'", key));
        }
    }
    Ok(())
}

fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(topic) if topic.is_empty() => Vec::new(),
        OneOrMany::One(topic) => vec![topic],
        OneOrMany::Many(topics) => topics,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_producer_defaults() {
        let config = ProducerConfig::default();
        assert!(!config.enable);
        assert_eq!(config.pool_size, 300);
        assert_eq!(config.retry, 3);
        assert_eq!(config.retry_backoff(), Duration::from_secs(3));
        assert_eq!(config.required_acks, 1);
        assert_eq!(config.enqueue_policy, EnqueuePolicy::Block);
    }

    #[test]
    fn test_consumer_defaults() {
        let config = ConsumerConfig::default();
        assert!(!config.enable);
        assert_eq!(config.offset_reset, OffsetReset::Latest);
        assert_eq!(config.message_buffer, 256);
        assert!(config.topics.is_empty());
    }

    #[test]
    fn test_disabled_sections_skip_validation() {
        let config = QueueConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_single_topic_string() {
        let config: ConsumerConfig =
            serde_yaml::from_str("enable: true\ngroup: g\nhosts: [a:9092]\ntopic: orders\n")
                .unwrap();
        assert_eq!(config.topics, vec!["orders".to_string()]);
    }

    #[test]
    fn test_topic_sequence() {
        let config: ConsumerConfig =
            serde_yaml::from_str("group: g\ntopics: [orders, refunds]\n").unwrap();
        assert_eq!(config.topics, vec!["orders".to_string(), "refunds".to_string()]);
    }

    #[test]
    fn test_disallowed_property() {
        let config = ProducerConfig::builder()
            .hosts(vec!["localhost:9092".into()])
            .topic("events")
            .property("bootstrap.servers", "elsewhere:9092")
            .build();
        let err = config.validate().unwrap_err();
        assert!(err.contains("bootstrap.servers"));
    }
}
