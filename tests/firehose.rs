//! End-to-end flows through the host-facing stream: plain pass-through,
//! throttled backpressure, and downstream retry/exhaustion.

use std::sync::Arc;
use std::time::Duration;

use sideline::core::config::{
    BrokerConfig, BufferConfig, ConsumerConfig, PersistenceConfig, RetryConfig,
};
use sideline::ops::metrics::InMemoryMetrics;
use sideline::{
    Clock, ComponentRegistry, ManualClock, Message, SidelineConfig, SidelineStream, SystemClock,
    TaskContext,
};
use tempfile::TempDir;

fn test_config(data_dir: &TempDir) -> SidelineConfig {
    SidelineConfig {
        broker: BrokerConfig {
            hosts: vec!["localhost:9092".into()],
            topic: "events".into(),
            client: "in-memory".into(),
        },
        consumer: ConsumerConfig {
            id_prefix: "spout".into(),
            deserializer: "utf8".into(),
        },
        persistence: PersistenceConfig {
            adapter: "filesystem".into(),
            root: data_dir.path().to_path_buf(),
            prefix: "sideline".into(),
        },
        retry: RetryConfig::default(),
        buffer: BufferConfig::default(),
        flush_interval_ms: 20,
        output_stream_id: None,
    }
}

async fn drain<C: Clock>(stream: &SidelineStream<C>, count: usize) -> Vec<Message> {
    let mut messages = Vec::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while messages.len() < count && tokio::time::Instant::now() < deadline {
        match stream.next_message() {
            Some(message) => messages.push(message),
            None => tokio::time::sleep(Duration::from_millis(2)).await,
        }
    }
    messages
}

async fn wait_for<F: Fn() -> bool>(what: &str, predicate: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !predicate() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

fn persisted_offset(data_dir: &TempDir, source_id: &str, partition: i32) -> Option<i64> {
    let path = data_dir
        .path()
        .join("sideline/consumers")
        .join(source_id)
        .join(partition.to_string());
    std::fs::read_to_string(path).ok()?.trim().parse().ok()
}

#[tokio::test]
async fn firehose_passes_records_through_in_order() {
    let data_dir = TempDir::new().unwrap();
    let registry: Arc<ComponentRegistry<SystemClock>> =
        Arc::new(ComponentRegistry::with_defaults());
    let broker = registry.embedded_broker().clone();
    broker.produce("events", 0, Some(b"a"), b"1");
    broker.produce("events", 0, Some(b"b"), b"2");
    broker.produce("events", 0, Some(b"c"), b"3");

    let mut stream = SidelineStream::new(test_config(&data_dir));
    stream.set_registry(registry);
    stream.open(TaskContext::default()).await.unwrap();

    let messages = drain(&stream, 3).await;
    let values: Vec<&str> = messages
        .iter()
        .map(|m| m.values[1].as_str().unwrap())
        .collect();
    assert_eq!(values, vec!["1", "2", "3"]);
    assert!(messages.iter().all(|m| m.id.source_id.as_str() == "spout-0"));

    for message in &messages {
        stream.ack(&message.id);
    }
    wait_for("offset 2 to be persisted", || {
        persisted_offset(&data_dir, "spout-0", 0) == Some(2)
    })
    .await;

    stream.close().await;
}

#[tokio::test]
async fn throttled_firehose_blocks_after_its_small_quota() {
    let data_dir = TempDir::new().unwrap();
    let registry: Arc<ComponentRegistry<SystemClock>> =
        Arc::new(ComponentRegistry::with_defaults());
    let broker = registry.embedded_broker().clone();
    for offset in 0..10 {
        broker.produce("events", 0, None, format!("{offset}").as_bytes());
    }

    let mut config = test_config(&data_dir);
    config.buffer = BufferConfig {
        variant: "throttled".into(),
        max_size: 8,
        throttled_size: 2,
        throttled_regex: Some("^spout-0$".into()),
    };
    let metrics = Arc::new(InMemoryMetrics::new());
    let mut stream = SidelineStream::new(config);
    stream.set_registry(registry);
    stream.set_metrics(metrics.clone());
    stream.open(TaskContext::default()).await.unwrap();

    // With nothing draining the buffer the worker emits two queued messages
    // plus at most one it is blocked trying to enqueue.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let stalled = metrics.counter("spout-0", "emit");
    assert!(
        stalled <= 3,
        "firehose should stall at the throttled capacity, emitted {stalled}"
    );

    // Draining releases the backpressure and everything arrives.
    let messages = drain(&stream, 10).await;
    assert_eq!(messages.len(), 10);
    stream.close().await;
}

#[tokio::test]
async fn failed_messages_replay_with_backoff_then_exhaust() {
    let data_dir = TempDir::new().unwrap();
    let clock = ManualClock::new();
    let registry: Arc<ComponentRegistry<ManualClock>> =
        Arc::new(ComponentRegistry::with_defaults());
    let broker = registry.embedded_broker().clone();
    broker.produce("events", 0, None, b"poison");

    let mut config = test_config(&data_dir);
    config.retry = RetryConfig {
        policy: "exponential-backoff".into(),
        max_attempts: 2,
        initial_delay_ms: 10,
        delay_multiplier: 2.0,
    };
    config.flush_interval_ms = 5;
    let mut stream = SidelineStream::with_clock(config, clock.clone());
    stream.set_registry(registry);
    stream.open(TaskContext::default()).await.unwrap();

    let first = drain(&stream, 1).await.pop().expect("initial emission");
    stream.fail(&first.id);

    // Nothing replays until virtual time passes the backoff.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(stream.next_message().is_none());

    clock.advance(Duration::from_millis(10));
    let second = drain(&stream, 1).await.pop().expect("first retry");
    assert_eq!(second.id, first.id);
    stream.fail(&second.id);

    clock.advance(Duration::from_millis(20));
    let third = drain(&stream, 1).await.pop().expect("second retry");
    assert_eq!(third.id, first.id);

    // Third failure exhausts the policy: silently acked, offset advances.
    stream.fail(&third.id);
    clock.advance(Duration::from_millis(10));
    wait_for("exhausted message to be committed", || {
        persisted_offset(&data_dir, "spout-0", 0) == Some(0)
    })
    .await;
    assert!(stream.next_message().is_none());

    stream.close().await;
}
