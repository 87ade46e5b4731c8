//! Cross-module coverage for the broker-backed delay tier, exercised
//! against the in-memory broker double so it needs no live cluster.

use nova_queue::broker::test_double::InMemoryBroker;
use nova_queue::broker::Broker;
use nova_queue::config::{BrokerKind, KafkaBrokerConfig, QueueConfig};
use nova_queue::delay::{delay_slot_name, slot_index};
use nova_queue::{
    Codec, DelayEnvelope, EnqueueOptions, FakeClock, JsonCodec, Priority, Result, Task, TaskEnvelope, TaskHandler,
    TaskQueue,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

struct CountingHandler(Arc<AtomicUsize>);

#[async_trait::async_trait]
impl TaskHandler for CountingHandler {
    async fn handle(&self, _task: TaskEnvelope) -> Result<()> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn test_config() -> QueueConfig {
    QueueConfig::builder(BrokerKind::Kafka(KafkaBrokerConfig::new("localhost:9092", "g1")))
        .topic_prefix("APP")
        .delay_slots(24, std::time::Duration::from_secs(3600))
        .shutdown_timeout(std::time::Duration::from_secs(5))
        .build()
}

/// A delay beyond the wheel horizon lands on slot 5 (5h30m / 1h slots,
/// 24 slots) and, once the delay manager's own subscription redelivers it
/// past its due time, still reaches the original handler on the target
/// queue.
#[tokio::test]
async fn delay_beyond_horizon_is_redelivered_once_overdue() {
    let clock = Arc::new(FakeClock::new(chrono::Utc::now()));
    let broker = Arc::new(InMemoryBroker::new());
    let codec: Arc<dyn Codec> = Arc::new(JsonCodec);
    let queue = TaskQueue::from_broker_with_clock(
        broker.clone() as Arc<dyn Broker>,
        test_config(),
        clock.clone(),
    )
    .unwrap();

    let count = Arc::new(AtomicUsize::new(0));
    queue.start(Arc::new(CountingHandler(count.clone()))).await.unwrap();

    let target_queue = queue.resolve_queue(None, Priority::Normal);
    let envelope = TaskEnvelope::new("APP", Task::new("email", b"hi".to_vec()), target_queue.clone(), Priority::Normal);

    let delay = chrono::Duration::hours(5) + chrono::Duration::minutes(30);
    let slot = slot_index(delay, std::time::Duration::from_secs(3600), 24);
    assert_eq!(slot, 5);
    let slot_topic = delay_slot_name(&target_queue, slot);

    // Simulate a delay envelope that has already sat past its due time in
    // the broker (the in-memory double has no native TTL, so this is
    // constructed directly rather than waited out).
    let now = clock.now();
    let overdue_execute_at = now - chrono::Duration::seconds(1);
    let delay_envelope = DelayEnvelope::from_task_envelope(envelope, slot_topic.clone(), overdue_execute_at, now);
    let bytes = codec.encode_delay(&delay_envelope).unwrap();
    broker
        .send(&slot_topic, Some(&delay_envelope.task_id), bytes, delay_envelope.headers())
        .await
        .unwrap();

    tokio::time::timeout(std::time::Duration::from_secs(1), async {
        while count.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("delay-slot arrival should redeliver to the target queue handler");

    queue.stop().await.unwrap();
}

/// Enqueuing a task whose remaining delay exceeds the wheel horizon
/// publishes a DelayEnvelope to the broker rather than the wheel, and
/// never touches the target queue directly.
#[tokio::test]
async fn enqueue_beyond_wheel_horizon_publishes_to_delay_slot_not_target_queue() {
    let clock = Arc::new(FakeClock::new(chrono::Utc::now()));
    let broker = Arc::new(InMemoryBroker::new());
    let queue = TaskQueue::from_broker_with_clock(
        broker.clone() as Arc<dyn Broker>,
        test_config(),
        clock.clone(),
    )
    .unwrap();

    queue
        .enqueue(
            Task::new("email", b"hi".to_vec()),
            EnqueueOptions::default()
                .with_priority(Priority::Normal)
                .process_in(std::time::Duration::from_secs(5 * 3600 + 30 * 60)),
        )
        .await
        .unwrap();

    let sent = broker.sent_messages();
    assert!(
        sent.iter().any(|(topic, _)| topic == "APP_PRIORITY_NORMAL_DELAY_5"),
        "expected a publish to the slot-5 delay topic, got: {sent:?}"
    );
    assert!(
        !sent.iter().any(|(topic, _)| topic == "APP_PRIORITY_NORMAL"),
        "a delay beyond the wheel horizon must not reach the target queue directly"
    );
}
