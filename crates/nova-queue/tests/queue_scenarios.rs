//! Cross-module, broker-free coverage of the facade's enqueue/consume and
//! batch paths, run against the in-memory broker double.

use nova_queue::broker::test_double::InMemoryBroker;
use nova_queue::broker::Broker;
use nova_queue::config::{BrokerKind, KafkaBrokerConfig, QueueConfig};
use nova_queue::{
    Aggregator, BatchHandler, CountAggregator, EnqueueOptions, FakeClock, Priority, Result, SystemClock, Task,
    TaskEnvelope, TaskHandler, TaskQueue, TimeAggregator,
};
use std::sync::{Arc, Mutex};

fn test_config() -> QueueConfig {
    QueueConfig::builder(BrokerKind::Kafka(KafkaBrokerConfig::new("localhost:9092", "g1")))
        .topic_prefix("APP")
        .shutdown_timeout(std::time::Duration::from_secs(5))
        .build()
}

struct RecordingHandler {
    seen: Arc<Mutex<Vec<TaskEnvelope>>>,
}

#[async_trait::async_trait]
impl TaskHandler for RecordingHandler {
    async fn handle(&self, task: TaskEnvelope) -> Result<()> {
        self.seen.lock().unwrap().push(task);
        Ok(())
    }
}

/// An immediate, undelayed enqueue reaches the priority topic its options
/// name, with the envelope's fields intact, and fires the handler exactly
/// once.
#[tokio::test]
async fn immediate_enqueue_reaches_priority_topic_exactly_once() {
    let broker = Arc::new(InMemoryBroker::new());
    let queue = TaskQueue::from_broker(broker.clone() as Arc<dyn Broker>, test_config()).unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    queue
        .start(Arc::new(RecordingHandler { seen: seen.clone() }))
        .await
        .unwrap();

    queue
        .enqueue(
            Task::new("email", b"hi".to_vec()),
            EnqueueOptions::default().with_priority(Priority::Normal),
        )
        .await
        .unwrap();

    tokio::time::timeout(std::time::Duration::from_secs(1), async {
        while seen.lock().unwrap().is_empty() {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("handler should run");

    queue.stop().await.unwrap();

    let recorded = seen.lock().unwrap();
    assert_eq!(recorded.len(), 1);
    assert_eq!(recorded[0].task.task_type, "email");
    assert_eq!(recorded[0].task.payload, b"hi");
    assert_eq!(recorded[0].priority, Priority::Normal.as_i32());
    assert!(broker
        .sent_messages()
        .iter()
        .any(|(topic, _)| topic == "APP_PRIORITY_NORMAL"));
}

struct CountingBatchHandler {
    batches: Arc<Mutex<Vec<usize>>>,
}

#[async_trait::async_trait]
impl BatchHandler for CountingBatchHandler {
    async fn handle_batch(&self, tasks: Vec<TaskEnvelope>) -> Result<()> {
        self.batches.lock().unwrap().push(tasks.len());
        Ok(())
    }
}

/// A time aggregator flushes on the next message to arrive once its window
/// has elapsed, even though the two enqueues individually stayed under any
/// count threshold.
#[tokio::test]
async fn batch_handler_flushes_once_time_window_elapses() {
    let clock = Arc::new(FakeClock::new(chrono::Utc::now()));
    let broker = Arc::new(InMemoryBroker::new());
    let queue =
        TaskQueue::from_broker_with_clock(broker as Arc<dyn Broker>, test_config(), clock.clone()).unwrap();

    let aggregator = TimeAggregator::new(std::time::Duration::from_secs(5), clock.clone());
    let batches = Arc::new(Mutex::new(Vec::new()));
    let handler = Arc::new(CountingBatchHandler { batches: batches.clone() });
    queue.start_batch(handler, aggregator.clone()).await.unwrap();

    queue
        .enqueue(Task::new("email", b"1".to_vec()), EnqueueOptions::default())
        .await
        .unwrap();

    tokio::time::timeout(std::time::Duration::from_secs(1), async {
        while aggregator.size() == 0 {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("first task should be buffered");

    assert!(batches.lock().unwrap().is_empty(), "should not flush before the window elapses");
    clock.advance(std::time::Duration::from_secs(6));

    queue
        .enqueue(Task::new("email", b"2".to_vec()), EnqueueOptions::default())
        .await
        .unwrap();

    tokio::time::timeout(std::time::Duration::from_secs(1), async {
        while batches.lock().unwrap().is_empty() {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("batch should flush once the window has elapsed");

    assert_eq!(batches.lock().unwrap()[0], 2);
    queue.stop().await.unwrap();
}

/// A count aggregator flushes exactly at its configured size, leaving the
/// remainder buffered for the next trigger rather than flushing early or
/// holding the whole enqueued set.
#[tokio::test]
async fn batch_handler_flushes_exactly_at_count_threshold() {
    let broker = Arc::new(InMemoryBroker::new());
    let queue =
        TaskQueue::from_broker_with_clock(broker as Arc<dyn Broker>, test_config(), Arc::new(SystemClock)).unwrap();

    let batches = Arc::new(Mutex::new(Vec::new()));
    let handler = Arc::new(CountingBatchHandler { batches: batches.clone() });
    let aggregator: Arc<dyn Aggregator> = Arc::new(CountAggregator::new(3));
    queue.start_batch(handler, aggregator.clone()).await.unwrap();

    for i in 0..4 {
        queue
            .enqueue(Task::new("email", format!("{i}").into_bytes()), EnqueueOptions::default())
            .await
            .unwrap();
    }

    tokio::time::timeout(std::time::Duration::from_secs(1), async {
        while batches.lock().unwrap().is_empty() {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("batch should flush at the count threshold");

    tokio::time::timeout(std::time::Duration::from_secs(1), async {
        while aggregator.size() == 0 {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("fourth task should also be consumed and buffered");

    assert_eq!(batches.lock().unwrap()[0], 3);
    assert_eq!(aggregator.size(), 1, "the fourth task stays buffered until the next flush trigger");
    queue.stop().await.unwrap();
}
