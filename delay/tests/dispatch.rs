//! Delivery timing, failure handling and context propagation.

#![allow(clippy::unwrap_used, clippy::panic)]

use async_trait::async_trait;
use seatlock_core::environment::Clock;
use seatlock_core::store::{AtomicScript, ScriptValue, SharedStore};
use seatlock_core::{DelayConfig, InMemoryStore, StoreError};
use seatlock_delay::{
    DelayDispatcher, DelayError, DelayHandler, DelayMessage, DelayProducer, DispatcherHandle,
    TopicRegistry,
};
use seatlock_runtime::{RetryPolicy, TaskContext};
use seatlock_testing::mocks::test_clock;
use seatlock_testing::recorder::Recorder;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

const TOPIC: &str = "order-cancel";

#[derive(Debug, Clone, Copy)]
enum Mode {
    Succeed,
    FailOn(&'static str),
    PanicOnFirstAttempt,
    StallOnFirstAttempt(Duration),
}

#[derive(Debug, Clone)]
struct Seen {
    message: DelayMessage,
    current_trace: Option<String>,
}

struct TestHandler {
    mode: Mode,
    seen: Recorder<Seen>,
}

#[async_trait]
impl DelayHandler for TestHandler {
    fn topic(&self) -> &str {
        TOPIC
    }

    async fn execute(&self, message: DelayMessage) -> seatlock_delay::Result<()> {
        self.seen.record(Seen {
            message: message.clone(),
            current_trace: TaskContext::current().map(|ctx| ctx.trace_id().to_string()),
        });
        match self.mode {
            Mode::FailOn(payload) if message.payload == payload => {
                Err(DelayError::handler(TOPIC, "refund service rejected the request"))
            }
            Mode::PanicOnFirstAttempt if message.attempt == 1 => panic!("handler crashed"),
            Mode::StallOnFirstAttempt(stall) if message.attempt == 1 => {
                tokio::time::sleep(stall).await;
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

struct Fixture {
    producer: DelayProducer,
    dispatcher: DelayDispatcher,
    seen: Recorder<Seen>,
    handle: DispatcherHandle,
}

fn config() -> DelayConfig {
    DelayConfig::default()
        .with_partitions(2)
        .with_poll_interval(Duration::from_millis(20))
        .with_visibility_timeout(Duration::from_millis(300))
        .with_handler_timeout(Duration::from_secs(1))
}

async fn start(
    store: Arc<dyn SharedStore>,
    mode: Mode,
    config: DelayConfig,
    clock: Option<Arc<dyn Clock>>,
) -> Fixture {
    let seen = Recorder::new();
    let registry = TopicRegistry::new()
        .register(Arc::new(TestHandler { mode, seen: seen.clone() }))
        .unwrap();

    let mut producer = DelayProducer::new(Arc::clone(&store), "test", TOPIC, config.partitions).unwrap();
    let mut dispatcher = DelayDispatcher::new(store, "test", Arc::new(registry), config).with_retry_policy(
        RetryPolicy::new()
            .with_initial_delay(Duration::from_millis(10))
            .with_max_delay(Duration::from_millis(50)),
    );
    if let Some(clock) = clock {
        producer = producer.with_clock(Arc::clone(&clock));
        dispatcher = dispatcher.with_clock(clock);
    }

    let (shutdown, _) = broadcast::channel(1);
    let handle = dispatcher.start(&shutdown).await.unwrap();
    Fixture {
        producer,
        dispatcher,
        seen,
        handle,
    }
}

async fn in_memory(mode: Mode) -> Fixture {
    start(Arc::new(InMemoryStore::new()), mode, config(), None).await
}

/// Wait until no partition has pending or in-flight items.
async fn settled(fixture: &Fixture) -> bool {
    let deadline = Instant::now() + Duration::from_secs(3);
    while Instant::now() < deadline {
        let mut outstanding = 0;
        for partition in 0..2 {
            outstanding += fixture.dispatcher.pending(TOPIC, partition).await.unwrap();
            outstanding += fixture.dispatcher.in_flight(TOPIC, partition).await.unwrap();
        }
        if outstanding == 0 {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_zero_delay_delivered_promptly() {
    let fixture = in_memory(Mode::Succeed).await;
    assert_eq!(fixture.handle.listeners(), 2);

    let receipt = fixture.producer.offer("o-1", Duration::ZERO).await.unwrap();
    assert!(fixture.seen.wait_for(1, Duration::from_secs(2)).await);

    let seen = fixture.seen.items().remove(0).message;
    assert_eq!(seen.id, receipt.id);
    assert_eq!(seen.partition, receipt.partition);
    assert_eq!((seen.payload.as_str(), seen.attempt), ("o-1", 1));
    assert!(settled(&fixture).await);
    fixture.handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_two_second_delay_is_not_delivered_early() {
    let fixture = in_memory(Mode::Succeed).await;
    let offered_at = Instant::now();
    fixture.producer.offer("o-2", Duration::from_secs(2)).await.unwrap();

    assert!(!fixture.seen.wait_for(1, Duration::from_millis(1500)).await);
    assert!(fixture.seen.wait_for(1, Duration::from_secs(3)).await);
    assert!(offered_at.elapsed() >= Duration::from_millis(1950));
    fixture.handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_sixty_second_delay_follows_injected_clock() {
    let clock = test_clock();
    let fixture = start(Arc::new(InMemoryStore::new()), Mode::Succeed, config(), Some(clock.shared())).await;
    fixture.producer.offer("o-3", Duration::from_secs(60)).await.unwrap();

    assert!(!fixture.seen.wait_for(1, Duration::from_millis(200)).await);
    clock.advance(Duration::from_secs(59));
    assert!(!fixture.seen.wait_for(1, Duration::from_millis(200)).await);
    clock.advance(Duration::from_secs(1));
    assert!(fixture.seen.wait_for(1, Duration::from_secs(2)).await);
    fixture.handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_handler_error_is_acknowledged_and_listener_continues() {
    let fixture = in_memory(Mode::FailOn("bad")).await;
    fixture.producer.offer("bad", Duration::ZERO).await.unwrap();
    fixture.producer.offer("good", Duration::ZERO).await.unwrap();
    fixture.producer.offer("also-good", Duration::from_millis(50)).await.unwrap();

    assert!(fixture.seen.wait_for(3, Duration::from_secs(2)).await);
    assert!(settled(&fixture).await);
    // Failed items are not retried.
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(fixture.seen.len(), 3);
    fixture.handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_panicking_handler_gets_redelivery() {
    let fixture = in_memory(Mode::PanicOnFirstAttempt).await;
    fixture.producer.offer("o-4", Duration::ZERO).await.unwrap();

    assert!(fixture.seen.wait_for(2, Duration::from_secs(3)).await);
    let attempts: Vec<_> = fixture.seen.items().iter().map(|seen| seen.message.attempt).collect();
    assert_eq!(attempts, vec![1, 2]);
    assert!(fixture.seen.items()[1].message.is_redelivery());
    assert!(settled(&fixture).await);
    fixture.handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_stalled_handler_times_out_and_gets_redelivery() {
    let config = config().with_handler_timeout(Duration::from_millis(100));
    let fixture = start(
        Arc::new(InMemoryStore::new()),
        Mode::StallOnFirstAttempt(Duration::from_secs(5)),
        config,
        None,
    )
    .await;
    fixture.producer.offer("o-5", Duration::ZERO).await.unwrap();

    assert!(fixture.seen.wait_for(2, Duration::from_secs(3)).await);
    assert_eq!(fixture.seen.items()[1].message.attempt, 2);
    assert!(settled(&fixture).await);
    fixture.handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_trace_context_restored_around_handler() {
    let fixture = in_memory(Mode::Succeed).await;
    let producer_ctx = TaskContext::with_trace_id("trace-77").with_attribute("order", "o-6");
    producer_ctx
        .clone()
        .scope(fixture.producer.offer_json(&serde_json::json!({"order": "o-6"}), Duration::ZERO))
        .await
        .unwrap();

    assert!(fixture.seen.wait_for(1, Duration::from_secs(2)).await);
    let seen = fixture.seen.items().remove(0);
    assert_eq!(seen.current_trace.as_deref(), Some("trace-77"));
    assert_eq!(seen.message.context, producer_ctx);
    let payload: serde_json::Value = seen.message.json().unwrap();
    assert_eq!(payload["order"], "o-6");
    fixture.handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_shutdown_stops_delivery() {
    let fixture = in_memory(Mode::Succeed).await;
    let Fixture {
        producer,
        dispatcher,
        seen,
        handle,
    } = fixture;
    handle.shutdown().await;

    let receipt = producer.offer("late", Duration::ZERO).await.unwrap();
    assert!(!seen.wait_for(1, Duration::from_millis(200)).await);
    assert_eq!(dispatcher.pending(TOPIC, receipt.partition).await.unwrap(), 1);
}

/// In-memory store whose poll script fails a set number of times.
#[derive(Debug, Default)]
struct FlakyStore {
    inner: InMemoryStore,
    failing_polls: AtomicUsize,
}

#[async_trait]
impl SharedStore for FlakyStore {
    async fn get(&self, key: &str) -> seatlock_core::Result<Option<String>> {
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> seatlock_core::Result<()> {
        self.inner.set(key, value, ttl).await
    }

    async fn delete(&self, key: &str) -> seatlock_core::Result<bool> {
        self.inner.delete(key).await
    }

    async fn increment(&self, key: &str, delta: i64) -> seatlock_core::Result<i64> {
        self.inner.increment(key, delta).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> seatlock_core::Result<bool> {
        self.inner.expire(key, ttl).await
    }

    async fn eval(
        &self,
        script: &dyn AtomicScript,
        keys: &[String],
        args: &[String],
    ) -> seatlock_core::Result<ScriptValue> {
        let failing = script.name() == "seatlock_delay_poll"
            && self
                .failing_polls
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
                .is_ok();
        if failing {
            return Err(StoreError::Unavailable("connection reset".to_string()));
        }
        self.inner.eval(script, keys, args).await
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_listener_survives_store_outage() {
    let store = Arc::new(FlakyStore::default());
    let fixture = start(Arc::clone(&store) as Arc<dyn SharedStore>, Mode::Succeed, config(), None).await;

    store.failing_polls.store(10, Ordering::SeqCst);
    fixture.producer.offer("o-7", Duration::ZERO).await.unwrap();

    assert!(fixture.seen.wait_for(1, Duration::from_secs(3)).await);
    assert_eq!(store.failing_polls.load(Ordering::SeqCst), 0);
    fixture.handle.shutdown().await;
}

#[tokio::test]
#[ignore] // Requires Redis running
#[allow(clippy::expect_used)]
async fn test_redis_round_trip() {
    let store = seatlock_redis::RedisStore::connect("redis://127.0.0.1:6379")
        .await
        .expect("redis");
    let topic_prefix = format!("test-{}", uuid::Uuid::new_v4());
    let seen = Recorder::new();
    let registry = TopicRegistry::new()
        .register(Arc::new(TestHandler { mode: Mode::Succeed, seen: seen.clone() }))
        .unwrap();
    let store: Arc<dyn SharedStore> = Arc::new(store);
    let producer = DelayProducer::new(Arc::clone(&store), topic_prefix.clone(), TOPIC, 2).unwrap();
    let dispatcher = DelayDispatcher::new(store, topic_prefix, Arc::new(registry), config());

    let (shutdown, _) = broadcast::channel(1);
    let handle = dispatcher.start(&shutdown).await.unwrap();
    producer.offer("redis-item", Duration::from_millis(300)).await.unwrap();

    assert!(seen.wait_for(1, Duration::from_secs(3)).await);
    assert_eq!(seen.items()[0].message.payload, "redis-item");
    handle.shutdown().await;
}

