use mq_rs::broker::memory::MemoryBroker;
use mq_rs::broker::{Connectors, RebalanceNotification, TopicPartition};
use mq_rs::{
    handler_fn, json_handler, BrokerError, ConsumerConfig, EnqueuePolicy, ProducerConfig,
    QueueClient, QueueConfig, QueueError,
};
use bytes::Bytes;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn producer_config(pool_size: usize) -> ProducerConfig {
    ProducerConfig::builder()
        .hosts(vec!["memory:9092".into()])
        .topic("events")
        .pool_size(pool_size)
        .build()
}

fn consumer_config() -> ConsumerConfig {
    ConsumerConfig::builder()
        .hosts(vec!["memory:9092".into()])
        .group("billing")
        .topics(vec!["events".into()])
        .build()
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn test_put_blocks_when_pool_is_full() {
    let broker = MemoryBroker::new();
    broker.pause();
    let config = QueueConfig {
        producer: producer_config(2),
        ..QueueConfig::default()
    };
    let client = Arc::new(
        QueueClient::init_with(CancellationToken::new(), &config, &Connectors::memory(&broker))
            .await
            .unwrap(),
    );

    // Park the enqueue loop on the paused broker with one message in hand
    client.put("held").await.unwrap();
    wait_until(|| broker.pending_dispatches() == 1).await;

    // Exactly pool_size messages fit without blocking
    tokio::time::timeout(Duration::from_millis(200), client.put("a"))
        .await
        .expect("first put must not block")
        .unwrap();
    tokio::time::timeout(Duration::from_millis(200), client.put("b"))
        .await
        .expect("second put must not block")
        .unwrap();

    let blocked = {
        let client = client.clone();
        tokio::spawn(async move { client.put("c").await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!blocked.is_finished(), "third put should wait for a free slot");

    broker.resume();
    tokio::time::timeout(Duration::from_secs(5), blocked)
        .await
        .expect("blocked put should complete once the loop drains")
        .unwrap()
        .unwrap();

    wait_until(|| broker.published("events").len() == 4).await;
    let expected: Vec<Bytes> = ["\"held\"", "\"a\"", "\"b\"", "\"c\""]
        .iter()
        .map(|s| Bytes::from(*s))
        .collect();
    assert_eq!(broker.published("events"), expected);
}

#[tokio::test]
async fn test_put_without_producer() {
    let broker = MemoryBroker::new();
    let config = QueueConfig {
        consumer: consumer_config(),
        ..QueueConfig::default()
    };
    let client =
        QueueClient::init_with(CancellationToken::new(), &config, &Connectors::memory(&broker))
            .await
            .unwrap();

    assert!(matches!(client.put("a").await, Err(QueueError::ProducerNotEnabled)));
    assert!(matches!(
        client.put_to_topic("other", "a").await,
        Err(QueueError::ProducerNotEnabled)
    ));
}

#[tokio::test]
async fn test_register_handler_without_consumer() {
    let broker = MemoryBroker::new();
    let config = QueueConfig {
        producer: producer_config(10),
        ..QueueConfig::default()
    };
    let client =
        QueueClient::init_with(CancellationToken::new(), &config, &Connectors::memory(&broker))
            .await
            .unwrap();

    let result = client.register_handler(handler_fn(|_| {}));
    assert!(matches!(result, Err(QueueError::ConsumerNotEnabled)));
}

#[tokio::test]
async fn test_nothing_enabled_is_valid() {
    let broker = MemoryBroker::new();
    let client = QueueClient::init_with(
        CancellationToken::new(),
        &QueueConfig::default(),
        &Connectors::memory(&broker),
    )
    .await
    .unwrap();

    client.close();
    client.close();
    assert!(client.is_closed());
    assert_eq!(client.shutdown().await, mq_rs::ClientShutdownReport::default());
}

#[tokio::test]
async fn test_put_to_topic_preserves_order() {
    let broker = MemoryBroker::new();
    let config = QueueConfig {
        producer: producer_config(16),
        ..QueueConfig::default()
    };
    let client =
        QueueClient::init_with(CancellationToken::new(), &config, &Connectors::memory(&broker))
            .await
            .unwrap();

    for i in 0..20 {
        let topic = if i % 2 == 0 { "even" } else { "odd" };
        client.put_to_topic(topic, &json!({ "seq": i })).await.unwrap();
    }

    wait_until(|| broker.publish_order().len() == 20).await;
    let order = broker.publish_order();
    for (i, message) in order.iter().enumerate() {
        let expected_topic = if i % 2 == 0 { "even" } else { "odd" };
        assert_eq!(message.topic, expected_topic);
        let value: Value = serde_json::from_slice(&message.payload).unwrap();
        assert_eq!(value, json!({ "seq": i }));
    }
}

#[tokio::test]
async fn test_close_twice_is_idempotent() {
    let broker = MemoryBroker::new();
    let config = QueueConfig {
        consumer: consumer_config(),
        producer: producer_config(10),
    };
    let cancel = CancellationToken::new();
    let client = QueueClient::init_with(cancel.clone(), &config, &Connectors::memory(&broker))
        .await
        .unwrap();

    client.close();
    client.close();
    cancel.cancel();

    let report = client.shutdown().await;
    assert!(report.is_clean());
    assert!(client.producer().unwrap().is_closed());
    assert!(client.consumer().unwrap().is_finished());
    assert_eq!(broker.open_producers(), 0);
    assert_eq!(broker.group_members("billing"), 0);
}

#[tokio::test]
async fn test_cancellation_shuts_down_tasks() {
    let broker = MemoryBroker::new();
    let config = QueueConfig {
        consumer: consumer_config(),
        producer: producer_config(10),
    };
    let cancel = CancellationToken::new();
    let client = QueueClient::init_with(cancel.clone(), &config, &Connectors::memory(&broker))
        .await
        .unwrap();

    cancel.cancel();

    wait_until(|| broker.open_producers() == 0 && broker.group_members("billing") == 0).await;
    assert!(client.is_closed());
    assert!(matches!(client.put("late").await, Err(QueueError::ProducerClosed)));
}

#[tokio::test]
async fn test_concurrent_streams_invoke_handler_once() {
    let broker = MemoryBroker::new();
    let config = QueueConfig {
        consumer: consumer_config(),
        ..QueueConfig::default()
    };
    let client =
        QueueClient::init_with(CancellationToken::new(), &config, &Connectors::memory(&broker))
            .await
            .unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    client
        .register_handler(handler_fn(move |p| sink.lock().push(p.to_vec())))
        .unwrap();

    let error_broker = broker.clone();
    let notify_broker = broker.clone();
    let message_broker = broker.clone();
    tokio::join!(
        async move { error_broker.inject_error("billing", BrokerError::new("transient")) },
        async move {
            notify_broker.rebalance(
                "billing",
                RebalanceNotification::Assigned(vec![TopicPartition::new("events", 1)]),
            )
        },
        async move { message_broker.produce("events", &b"{\"id\":1}"[..]).await },
    );

    let consumer = client.consumer().unwrap();
    wait_until(|| {
        let stats = consumer.stats();
        stats.handled() == 1 && stats.errors() == 1 && stats.rebalances() == 2
    })
    .await;
    assert_eq!(*seen.lock(), vec![b"{\"id\":1}".to_vec()]);
}

#[tokio::test]
async fn test_round_trip_through_broker() {
    let broker = MemoryBroker::new();
    let config = QueueConfig {
        consumer: consumer_config(),
        producer: producer_config(10),
    };
    let client =
        QueueClient::init_with(CancellationToken::new(), &config, &Connectors::memory(&broker))
            .await
            .unwrap();

    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();
    client
        .register_handler(json_handler(move |value: Value| sink.lock().push(value)))
        .unwrap();

    let original = json!({ "name": "a", "n": 1.5, "ok": true, "nested": { "k": [1, 2] } });
    client.put(&original).await.unwrap();

    wait_until(|| received.lock().len() == 1).await;
    assert_eq!(received.lock()[0], original);
}

#[tokio::test]
async fn test_producer_start_failure_closes_consumer() {
    let broker = MemoryBroker::new();
    let mut producer = producer_config(10);
    producer.hosts.clear();
    let config = QueueConfig {
        consumer: consumer_config(),
        producer,
    };

    let result =
        QueueClient::init_with(CancellationToken::new(), &config, &Connectors::memory(&broker))
            .await;
    assert!(matches!(result, Err(QueueError::Config(_))));
    wait_until(|| broker.group_members("billing") == 0).await;
}

#[tokio::test]
async fn test_connect_failure_aborts_init() {
    let broker = MemoryBroker::new();
    broker.refuse_connections(true);
    let config = QueueConfig {
        producer: producer_config(10),
        ..QueueConfig::default()
    };

    let result =
        QueueClient::init_with(CancellationToken::new(), &config, &Connectors::memory(&broker))
            .await;
    assert!(matches!(result, Err(QueueError::BrokerConnect(_))));
}

#[tokio::test]
async fn test_fail_fast_policy_through_client() {
    let broker = MemoryBroker::new();
    broker.pause();
    let mut producer = producer_config(1);
    producer.enqueue_policy = EnqueuePolicy::FailFast;
    let config = QueueConfig {
        producer,
        ..QueueConfig::default()
    };
    let client =
        QueueClient::init_with(CancellationToken::new(), &config, &Connectors::memory(&broker))
            .await
            .unwrap();

    client.put("held").await.unwrap();
    wait_until(|| broker.pending_dispatches() == 1).await;
    client.put("queued").await.unwrap();

    let err = client.put("overflow").await.unwrap_err();
    assert!(matches!(err, QueueError::QueueFull));
    assert!(err.is_retryable());
    broker.resume();
}

#[tokio::test]
async fn test_cancellation_drains_accepted_messages() {
    let broker = MemoryBroker::new();
    broker.pause();
    let config = QueueConfig {
        producer: producer_config(4),
        ..QueueConfig::default()
    };
    let cancel = CancellationToken::new();
    let client = QueueClient::init_with(cancel.clone(), &config, &Connectors::memory(&broker))
        .await
        .unwrap();

    client.put("inflight").await.unwrap();
    wait_until(|| broker.pending_dispatches() == 1).await;
    client.put("queued").await.unwrap();

    cancel.cancel();
    broker.resume();
    let report = client.shutdown().await;

    assert!(report.is_clean());
    assert_eq!(
        broker.published("events"),
        vec![Bytes::from("\"inflight\""), Bytes::from("\"queued\"")]
    );
}
