//! In-process broker
//!
//! Keeps an append-only log per topic, acknowledges every publish, and loops
//! published messages back to the consumer groups subscribed to the topic
//! (one member per group receives each message). Dispatch can be paused to
//! hold messages inside the producer, and connection refusals, failing
//! topics, consumer errors and rebalances can be injected.

use super::{
    DeliveryFailure, DeliveryReport, DeliveryStreams, GroupConnection, GroupConnector, GroupLink,
    GroupStreams, InboundMessage, OutboundMessage, ProducerConnection, ProducerConnector,
    ProducerLink, RebalanceNotification, TopicPartition,
};
use crate::config::{ConsumerConfig, ProducerConfig};
use crate::error::{BrokerError, QueueError, QueueResult};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::debug;

/// In-process broker shared by every connection cloned from it
#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

struct Inner {
    state: Mutex<State>,
    paused: watch::Sender<bool>,
    pending_dispatches: AtomicUsize,
    refuse_connections: AtomicBool,
}

impl Default for Inner {
    fn default() -> Self {
        Self {
            state: Mutex::new(State::default()),
            paused: watch::channel(false).0,
            pending_dispatches: AtomicUsize::new(0),
            refuse_connections: AtomicBool::new(false),
        }
    }
}

#[derive(Default)]
struct State {
    discard_payloads: bool,
    next_offsets: HashMap<String, i64>,
    logs: HashMap<String, Vec<Bytes>>,
    publish_order: Vec<OutboundMessage>,
    failing_topics: HashSet<String>,
    members: Vec<Member>,
    next_member_id: u64,
    open_producers: usize,
}

struct Member {
    id: u64,
    group: String,
    topics: Vec<String>,
    errors: mpsc::UnboundedSender<BrokerError>,
    notifications: mpsc::UnboundedSender<RebalanceNotification>,
    messages: mpsc::Sender<InboundMessage>,
}

impl MemoryBroker {
    /// Create an empty broker
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a broker that assigns offsets and loops messages back to
    /// subscribers without keeping the payloads.
    ///
    /// [`published`](Self::published) and [`publish_order`](Self::publish_order)
    /// stay empty, so memory does not grow with the number of publishes.
    pub fn without_recording() -> Self {
        let broker = Self::default();
        broker.inner.state.lock().discard_payloads = true;
        broker
    }

    /// Hold every dispatch until [`resume`](Self::resume) is called
    pub fn pause(&self) {
        self.inner.paused.send_replace(true);
    }

    /// Release held dispatches
    pub fn resume(&self) {
        self.inner.paused.send_replace(false);
    }

    /// Number of dispatches currently held by [`pause`](Self::pause)
    pub fn pending_dispatches(&self) -> usize {
        self.inner.pending_dispatches.load(Ordering::SeqCst)
    }

    /// Make subsequent connects and joins fail
    pub fn refuse_connections(&self, refuse: bool) {
        self.inner.refuse_connections.store(refuse, Ordering::SeqCst);
    }

    /// Report every publish to `topic` as failed
    pub fn fail_topic(&self, topic: impl Into<String>) {
        self.inner.state.lock().failing_topics.insert(topic.into());
    }

    /// Payloads appended to a topic, in offset order
    pub fn published(&self, topic: &str) -> Vec<Bytes> {
        self.inner
            .state
            .lock()
            .logs
            .get(topic)
            .cloned()
            .unwrap_or_default()
    }

    /// Every message accepted by a producer connection, in dispatch order
    pub fn publish_order(&self) -> Vec<OutboundMessage> {
        self.inner.state.lock().publish_order.clone()
    }

    /// Number of producer connections not yet closed
    pub fn open_producers(&self) -> usize {
        self.inner.state.lock().open_producers
    }

    /// Number of joined group members
    pub fn group_members(&self, group: &str) -> usize {
        self.inner
            .state
            .lock()
            .members
            .iter()
            .filter(|m| m.group == group)
            .count()
    }

    /// Append a message as if another client had published it
    pub async fn produce(&self, topic: &str, payload: impl Into<Bytes>) -> i64 {
        self.append(OutboundMessage::new(topic, payload)).await
    }

    /// Push a broker error onto every member of `group`
    pub fn inject_error(&self, group: &str, error: BrokerError) {
        let state = self.inner.state.lock();
        for member in state.members.iter().filter(|m| m.group == group) {
            let _ = member.errors.send(error.clone());
        }
    }

    /// Push a rebalance notification onto every member of `group`
    pub fn rebalance(&self, group: &str, notification: RebalanceNotification) {
        let state = self.inner.state.lock();
        for member in state.members.iter().filter(|m| m.group == group) {
            let _ = member.notifications.send(notification.clone());
        }
    }

    async fn append(&self, message: OutboundMessage) -> i64 {
        let (offset, targets) = {
            let mut state = self.inner.state.lock();
            let next = state.next_offsets.entry(message.topic.clone()).or_default();
            let offset = *next;
            *next += 1;
            if !state.discard_payloads {
                state
                    .logs
                    .entry(message.topic.clone())
                    .or_default()
                    .push(message.payload.clone());
                state.publish_order.push(message.clone());
            }

            let mut seen_groups = HashSet::new();
            let targets: Vec<_> = state
                .members
                .iter()
                .filter(|m| m.topics.contains(&message.topic))
                .filter(|m| seen_groups.insert(m.group.clone()))
                .map(|m| m.messages.clone())
                .collect();
            (offset, targets)
        };

        for target in targets {
            let inbound = InboundMessage {
                topic: message.topic.clone(),
                partition: 0,
                offset,
                key: None,
                payload: message.payload.clone(),
            };
            // A member that already left simply misses the message
            let _ = target.send(inbound).await;
        }

        offset
    }

    fn leave(&self, member_id: u64) {
        let mut state = self.inner.state.lock();
        state.members.retain(|m| m.id != member_id);
    }

    fn check_reachable(&self) -> QueueResult<()> {
        if self.inner.refuse_connections.load(Ordering::SeqCst) {
            return Err(QueueError::BrokerConnect(
                "memory broker refused the connection".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl ProducerConnector for MemoryBroker {
    async fn connect(&self, _config: &ProducerConfig) -> QueueResult<ProducerLink> {
        self.check_reachable()?;

        let (success_tx, successes) = mpsc::unbounded_channel();
        let (error_tx, errors) = mpsc::unbounded_channel();
        self.inner.state.lock().open_producers += 1;

        Ok(ProducerLink {
            connection: Box::new(MemoryProducerConnection {
                broker: self.clone(),
                successes: success_tx,
                errors: error_tx,
                closed: AtomicBool::new(false),
            }),
            streams: DeliveryStreams { successes, errors },
        })
    }
}

#[async_trait]
impl GroupConnector for MemoryBroker {
    async fn join(&self, config: &ConsumerConfig) -> QueueResult<GroupLink> {
        self.check_reachable()?;

        let (error_tx, errors) = mpsc::unbounded_channel();
        let (notification_tx, notifications) = mpsc::unbounded_channel();
        let (message_tx, messages) = mpsc::channel(config.message_buffer.max(1));

        let assigned = config
            .topics
            .iter()
            .map(|t| TopicPartition::new(t.clone(), 0))
            .collect();
        let _ = notification_tx.send(RebalanceNotification::Assigned(assigned));

        let id = {
            let mut state = self.inner.state.lock();
            state.next_member_id += 1;
            let id = state.next_member_id;
            state.members.push(Member {
                id,
                group: config.group.clone(),
                topics: config.topics.clone(),
                errors: error_tx,
                notifications: notification_tx,
                messages: message_tx,
            });
            id
        };
        debug!(group = %config.group, member = id, "Member joined memory broker group");

        Ok(GroupLink {
            connection: Box::new(MemoryGroupConnection {
                broker: self.clone(),
                member_id: id,
            }),
            streams: GroupStreams {
                errors,
                notifications,
                messages,
            },
        })
    }
}

struct MemoryProducerConnection {
    broker: MemoryBroker,
    successes: mpsc::UnboundedSender<DeliveryReport>,
    errors: mpsc::UnboundedSender<DeliveryFailure>,
    closed: AtomicBool,
}

#[async_trait]
impl ProducerConnection for MemoryProducerConnection {
    async fn dispatch(&self, message: OutboundMessage) -> Result<(), BrokerError> {
        let inner = &self.broker.inner;
        {
            let _pending = PendingDispatch::new(&inner.pending_dispatches);
            let mut paused = inner.paused.subscribe();
            let _ = paused.wait_for(|paused| !*paused).await;
        }

        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::new("producer connection is closed"));
        }

        let failing = inner.state.lock().failing_topics.contains(&message.topic);
        if failing {
            let _ = self.errors.send(DeliveryFailure {
                topic: message.topic,
                payload: message.payload,
                error: BrokerError::new("memory broker rejected the topic"),
            });
            return Ok(());
        }

        let offset = self.broker.append(message.clone()).await;
        let _ = self.successes.send(DeliveryReport {
            topic: message.topic,
            partition: 0,
            offset,
            payload: message.payload,
        });
        Ok(())
    }

    fn async_close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.broker.inner.state.lock().open_producers -= 1;
        }
    }
}

/// Counts a dispatch as pending until it resumes or is dropped
struct PendingDispatch<'a>(&'a AtomicUsize);

impl<'a> PendingDispatch<'a> {
    fn new(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for PendingDispatch<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

struct MemoryGroupConnection {
    broker: MemoryBroker,
    member_id: u64,
}

impl GroupConnection for MemoryGroupConnection {
    fn close(&self) {
        self.broker.leave(self.member_id);
    }
}

impl Drop for MemoryGroupConnection {
    fn drop(&mut self) {
        self.broker.leave(self.member_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn consumer_config(group: &str, topic: &str) -> ConsumerConfig {
        ConsumerConfig::builder()
            .hosts(vec!["memory".into()])
            .group(group)
            .topics(vec![topic.to_string()])
            .build()
    }

    #[tokio::test]
    async fn test_publish_is_acknowledged_and_logged() {
        let broker = MemoryBroker::new();
        let mut link = broker.connect(&ProducerConfig::default()).await.unwrap();

        link.connection
            .dispatch(OutboundMessage::new("orders", &b"1"[..]))
            .await
            .unwrap();

        let report = link.streams.successes.recv().await.unwrap();
        assert_eq!(report.topic, "orders");
        assert_eq!(report.offset, 0);
        assert_eq!(broker.published("orders"), vec![Bytes::from_static(b"1")]);
    }

    #[tokio::test]
    async fn test_without_recording_keeps_offsets_and_loop_back() {
        let broker = MemoryBroker::without_recording();
        let mut member = broker.join(&consumer_config("g", "orders")).await.unwrap();

        assert_eq!(broker.produce("orders", &b"1"[..]).await, 0);
        assert_eq!(broker.produce("orders", &b"2"[..]).await, 1);

        assert!(broker.published("orders").is_empty());
        assert!(broker.publish_order().is_empty());
        let first = member.streams.messages.recv().await.unwrap();
        let second = member.streams.messages.recv().await.unwrap();
        assert_eq!(first.offset, 0);
        assert_eq!(second.offset, 1);
        assert_eq!(second.payload, Bytes::from_static(b"2"));
    }

    #[tokio::test]
    async fn test_dropped_dispatch_is_no_longer_pending() {
        let broker = MemoryBroker::new();
        broker.pause();
        let link = broker.connect(&ProducerConfig::default()).await.unwrap();

        let held = link
            .connection
            .dispatch(OutboundMessage::new("orders", &b"1"[..]));
        let result = tokio::time::timeout(std::time::Duration::from_millis(20), held).await;
        assert!(result.is_err());
        assert_eq!(broker.pending_dispatches(), 0);
    }

    #[tokio::test]
    async fn test_failing_topic_reports_error() {
        let broker = MemoryBroker::new();
        broker.fail_topic("broken");
        let mut link = broker.connect(&ProducerConfig::default()).await.unwrap();

        link.connection
            .dispatch(OutboundMessage::new("broken", &b"x"[..]))
            .await
            .unwrap();

        let failure = link.streams.errors.recv().await.unwrap();
        assert_eq!(failure.topic, "broken");
        assert!(broker.published("broken").is_empty());
    }

    #[tokio::test]
    async fn test_one_member_per_group_receives() {
        let broker = MemoryBroker::new();
        let mut first = broker.join(&consumer_config("g1", "orders")).await.unwrap();
        let mut second = broker.join(&consumer_config("g1", "orders")).await.unwrap();
        let mut other = broker.join(&consumer_config("g2", "orders")).await.unwrap();

        broker.produce("orders", &b"hello"[..]).await;

        let hello = Bytes::from_static(b"hello");
        assert_eq!(first.streams.messages.recv().await.unwrap().payload, hello);
        assert_eq!(other.streams.messages.recv().await.unwrap().payload, hello);
        assert!(second.streams.messages.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_join_emits_assignment() {
        let broker = MemoryBroker::new();
        let mut link = broker.join(&consumer_config("g", "orders")).await.unwrap();

        let notification = link.streams.notifications.recv().await.unwrap();
        assert_eq!(
            notification,
            RebalanceNotification::Assigned(vec![TopicPartition::new("orders", 0)])
        );
    }

    #[tokio::test]
    async fn test_refused_connection() {
        let broker = MemoryBroker::new();
        broker.refuse_connections(true);

        let result = broker.connect(&ProducerConfig::default()).await;
        assert!(matches!(result, Err(QueueError::BrokerConnect(_))));
        let result = broker.join(&consumer_config("g", "t")).await;
        assert!(matches!(result, Err(QueueError::BrokerConnect(_))));
    }

    #[tokio::test]
    async fn test_leave_closes_streams() {
        let broker = MemoryBroker::new();
        let mut link = broker.join(&consumer_config("g", "orders")).await.unwrap();
        assert_eq!(broker.group_members("g"), 1);

        link.connection.close();
        assert_eq!(broker.group_members("g"), 0);
        assert!(link.streams.messages.recv().await.is_none());
    }
}
