use crate::aggregator::Aggregator;
use crate::broker::{Broker, Message, MessageHandler};
use crate::codec::Codec;
use crate::config::{BrokerKind, QueueConfig};
use crate::delay::{DefaultDelayManager, DelayManager};
use crate::error::{QueueError, Result};
use crate::recorder::{TaskRecord, TaskRecorder, TaskStatus};
use crate::task::{EnqueueOptions, EnqueueResult, Priority, Task, TaskEnvelope};
use crate::timer_wheel::TimerWheel;
use async_trait::async_trait;
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// User-supplied single-task handler, installed via `TaskQueue::start`.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, task: TaskEnvelope) -> Result<()>;
}

/// User-supplied batch handler, installed via `TaskQueue::start_batch`
/// together with an `Aggregator`.
#[async_trait]
pub trait BatchHandler: Send + Sync {
    async fn handle_batch(&self, tasks: Vec<TaskEnvelope>) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QueueState {
    Constructed,
    Running,
    Stopped,
}

/// The queue facade: `enqueue`/`enqueue_batch`/`start`/`start_batch`/`stop`,
/// a broker-polymorphic facade over `Broker`, `Codec`, and `DelayManager`.
pub struct TaskQueue {
    broker: Arc<dyn Broker>,
    codec: Arc<dyn Codec>,
    delay_manager: Arc<DefaultDelayManager>,
    recorder: Arc<dyn TaskRecorder>,
    topic_prefix: String,
    state: AsyncMutex<QueueState>,
    shutdown: CancellationToken,
    subscriptions: AsyncMutex<Vec<JoinHandle<()>>>,
    shutdown_timeout: std::time::Duration,
    started: AtomicBool,
}

impl TaskQueue {
    /// Constructs the broker client named by `config.broker`, wires up the
    /// codec, timer wheel, and delay manager, but does not yet subscribe to
    /// anything (that happens in `start`/`start_batch`).
    pub async fn new(config: QueueConfig) -> Result<Arc<Self>> {
        let broker: Arc<dyn Broker> = match &config.broker {
            #[cfg(feature = "kafka")]
            BrokerKind::Kafka(kafka_config) => {
                Arc::new(crate::broker::kafka::KafkaBroker::new(kafka_config)?)
            }
            #[cfg(feature = "rabbitmq")]
            BrokerKind::RabbitMq(rabbitmq_config) => Arc::new(
                crate::broker::rabbitmq::RabbitMqBroker::connect(rabbitmq_config).await?,
            ),
            #[cfg(feature = "rocketmq")]
            BrokerKind::RocketMq(rocketmq_config) => Arc::new(
                crate::broker::rocketmq::RocketMqBroker::connect(rocketmq_config).await?,
            ),
        };

        Self::from_broker(broker, config)
    }

    /// Constructs a `TaskQueue` over an already-connected `Broker`, skipping
    /// `config.broker`'s own connection step. `config.broker` is otherwise
    /// ignored. Lets a caller plug in a `Broker` implementation outside the
    /// three built-in backends (e.g. an in-memory double in tests).
    pub fn from_broker(broker: Arc<dyn Broker>, config: QueueConfig) -> Result<Arc<Self>> {
        Self::from_broker_with_clock(broker, config, Arc::new(crate::clock::SystemClock))
    }

    /// As `from_broker`, but with the clock driving the timer wheel and
    /// delay ladder also injectable. Tests use this with a `FakeClock` to
    /// make delay-tier behavior deterministic.
    pub fn from_broker_with_clock(
        broker: Arc<dyn Broker>,
        config: QueueConfig,
        clock: Arc<dyn crate::clock::Clock>,
    ) -> Result<Arc<Self>> {
        let codec = config.codec();
        let wheel = TimerWheel::new(
            TimerWheel::DEFAULT_SLOT_COUNT,
            TimerWheel::DEFAULT_TICK_MS,
            clock.clone(),
        );

        let send_broker = broker.clone();
        let send_codec = codec.clone();
        let send_path: crate::delay::SendPath = Arc::new(move |envelope: TaskEnvelope| {
            let broker = send_broker.clone();
            let codec = send_codec.clone();
            Box::pin(async move {
                let bytes = codec.encode_task(&envelope)?;
                broker
                    .send(&envelope.queue, Some(&envelope.task_id), bytes, envelope.headers())
                    .await
            })
        });

        let target_queues = vec![
            crate::task::priority_queue_name(&config.topic_prefix, Priority::High),
            crate::task::priority_queue_name(&config.topic_prefix, Priority::Normal),
            crate::task::priority_queue_name(&config.topic_prefix, Priority::Low),
            crate::task::tasks_queue_name(&config.topic_prefix),
        ];
        let delay_manager = DefaultDelayManager::new(
            broker.clone(),
            codec.clone(),
            wheel,
            clock,
            config.delay_slot_count,
            config.delay_slot_duration,
            target_queues,
            send_path,
        );

        Ok(Arc::new(Self {
            broker,
            codec,
            delay_manager,
            recorder: config.recorder.clone(),
            topic_prefix: config.topic_prefix.clone(),
            state: AsyncMutex::new(QueueState::Constructed),
            shutdown: CancellationToken::new(),
            subscriptions: AsyncMutex::new(Vec::new()),
            shutdown_timeout: config.shutdown_timeout,
            started: AtomicBool::new(false),
        }))
    }

    /// Resolves the target queue name for a custom override or, absent
    /// one, the priority's own topic.
    pub fn resolve_queue(&self, custom_name: Option<&str>, priority: Priority) -> String {
        match custom_name {
            Some(name) => format!("{}-{name}", self.topic_prefix),
            None => crate::task::priority_queue_name(&self.topic_prefix, priority),
        }
    }

    fn tasks_topic(&self) -> String {
        crate::task::tasks_queue_name(&self.topic_prefix)
    }

    /// Enqueues a single task, recording it and routing it either straight
    /// to the broker or through the delay manager depending on its eta.
    pub async fn enqueue(&self, task: Task, opts: EnqueueOptions) -> Result<EnqueueResult> {
        self.enqueue_at(task, opts, Utc::now()).await
    }

    /// As `enqueue`, but takes the instant to resolve `opts`' eta against
    /// rather than sampling the clock itself. `enqueue_batch` uses this so
    /// every task in a batch shares one `now` and therefore one `executeAt`,
    /// instead of each iteration drifting by however long the prior
    /// iteration's broker send took.
    async fn enqueue_at(&self, task: Task, opts: EnqueueOptions, now: chrono::DateTime<Utc>) -> Result<EnqueueResult> {
        if self.is_stopped().await {
            return Err(QueueError::Stopped);
        }
        let queue = self.resolve_queue(opts.queue.as_deref(), opts.priority);
        let eta = opts.resolve_eta(now);
        let envelope = TaskEnvelope::new(&self.topic_prefix, task, queue.clone(), opts.priority);
        let task_id = envelope.task_id.clone();

        self.recorder
            .record(TaskRecord {
                task_id: task_id.clone(),
                task_type: envelope.task.task_type.clone(),
                queue: queue.clone(),
                priority: opts.priority.as_i32(),
                status: TaskStatus::Pending,
                created_at: now,
                queued_at: None,
                process_at: Some(eta),
                started_at: None,
                completed_at: None,
                failed_at: None,
                error: None,
                retry_count: 0,
                metadata: serde_json::json!({}),
            })
            .await;

        if eta <= now {
            let bytes = self.codec.encode_task(&envelope)?;
            self.broker
                .send(&queue, Some(&envelope.task_id), bytes, envelope.headers())
                .await?;
            self.recorder
                .update_status(&task_id, TaskStatus::Queued, None)
                .await;
        } else {
            self.delay_manager.enqueue_delay(envelope, eta).await?;
        }

        Ok(EnqueueResult {
            id: task_id,
            queue,
            priority: opts.priority,
            eta,
        })
    }

    /// Enqueues a batch of tasks sharing one options set; delayed batches
    /// schedule each task individually with the same `executeAt`. The eta is
    /// resolved once up front so every task in the batch shares it, rather
    /// than each per-task enqueue re-deriving it from its own call-time
    /// `now` and drifting by however long the prior sends took.
    pub async fn enqueue_batch(
        &self,
        tasks: Vec<Task>,
        opts: EnqueueOptions,
    ) -> Result<Vec<EnqueueResult>> {
        if tasks.is_empty() {
            return Err(QueueError::EmptyBatch);
        }
        let now = Utc::now();
        let eta = opts.resolve_eta(now);
        let shared_opts = EnqueueOptions {
            process_at: Some(eta),
            process_in: None,
            ..opts
        };
        let mut results = Vec::with_capacity(tasks.len());
        for task in tasks {
            results.push(self.enqueue_at(task, shared_opts.clone(), now).await?);
        }
        Ok(results)
    }

    async fn is_stopped(&self) -> bool {
        *self.state.lock().await == QueueState::Stopped
    }

    async fn transition_to_running(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if *state == QueueState::Running {
            return Err(QueueError::AlreadyRunning);
        }
        if *state == QueueState::Stopped {
            return Err(QueueError::Stopped);
        }
        self.delay_manager.start().await?;
        *state = QueueState::Running;
        Ok(())
    }

    fn subscription_topics(&self) -> Vec<String> {
        vec![
            self.resolve_queue(None, Priority::High),
            self.resolve_queue(None, Priority::Normal),
            self.resolve_queue(None, Priority::Low),
            self.tasks_topic(),
        ]
    }

    /// Starts consuming: subscribes to the three priority topics and the
    /// shared tasks topic, dispatching each message to `handler`.
    pub async fn start(self: &Arc<Self>, handler: Arc<dyn TaskHandler>) -> Result<()> {
        self.transition_to_running().await?;

        let queue = self.clone();
        let shutdown = self.shutdown.clone();
        let topics = self.subscription_topics();
        let message_handler: Arc<dyn MessageHandler> = Arc::new(SingleTaskMessageHandler {
            queue: queue.clone(),
            handler,
        });

        let broker = self.broker.clone();
        let join = tokio::spawn(async move {
            if let Err(e) = broker.subscribe(topics, message_handler, shutdown).await {
                warn!(error = %e, "task queue subscribe loop exited with error");
            }
        });
        self.subscriptions.lock().await.push(join);
        self.started.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Starts consuming in batches: buffers incoming tasks in `aggregator`
    /// and dispatches to `handler` once it signals a flush is ready.
    pub async fn start_batch(
        self: &Arc<Self>,
        handler: Arc<dyn BatchHandler>,
        aggregator: Arc<dyn Aggregator>,
    ) -> Result<()> {
        self.transition_to_running().await?;

        let queue = self.clone();
        let shutdown = self.shutdown.clone();
        let topics = self.subscription_topics();
        let message_handler: Arc<dyn MessageHandler> = Arc::new(BatchMessageHandler {
            queue: queue.clone(),
            handler,
            aggregator,
        });

        let broker = self.broker.clone();
        let join = tokio::spawn(async move {
            if let Err(e) = broker.subscribe(topics, message_handler, shutdown).await {
                warn!(error = %e, "task queue batch subscribe loop exited with error");
            }
        });
        self.subscriptions.lock().await.push(join);
        self.started.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Stops the queue. Idempotent: cancels subscriptions, waits for the
    /// queue's own subscription tasks, then stops the delay manager's own
    /// subscribers, then closes the broker, all within `shutdown_timeout`.
    /// This ordering matters: reversing it can orphan in-flight acks, since
    /// the delay manager's slot subscriber and the broker connection it
    /// shares with the facade must outlive the facade's own subscribe loops.
    pub async fn stop(&self) -> Result<()> {
        {
            let mut state = self.state.lock().await;
            if *state == QueueState::Stopped {
                return Ok(());
            }
            *state = QueueState::Stopped;
        }

        self.shutdown.cancel();

        let joins = std::mem::take(&mut *self.subscriptions.lock().await);
        let wait = async {
            for join in joins {
                let _ = join.await;
            }
        };
        if tokio::time::timeout(self.shutdown_timeout, wait).await.is_err() {
            return Err(QueueError::ShutdownTimeout(self.shutdown_timeout));
        }

        self.delay_manager.stop().await;

        self.broker.close().await?;
        info!("task queue stopped");
        Ok(())
    }
}

struct SingleTaskMessageHandler {
    queue: Arc<TaskQueue>,
    handler: Arc<dyn TaskHandler>,
}

#[async_trait]
impl MessageHandler for SingleTaskMessageHandler {
    async fn handle(&self, message: Message) -> Result<()> {
        let envelope = match self
            .queue
            .codec
            .decode_task(&message.payload, message.key.as_deref(), &message.headers)
        {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, "dropping undecodable task message");
                return Ok(());
            }
        };

        self.queue
            .recorder
            .update_status(&envelope.task_id, TaskStatus::Processing, None)
            .await;

        match self.handler.handle(envelope.clone()).await {
            Ok(()) => {
                self.queue
                    .recorder
                    .update_status(&envelope.task_id, TaskStatus::Completed, None)
                    .await;
                Ok(())
            }
            Err(e) => {
                self.queue
                    .recorder
                    .update_status(&envelope.task_id, TaskStatus::Failed, Some(e.to_string()))
                    .await;
                Err(e)
            }
        }
    }
}

struct BatchMessageHandler {
    queue: Arc<TaskQueue>,
    handler: Arc<dyn BatchHandler>,
    aggregator: Arc<dyn Aggregator>,
}

#[async_trait]
impl MessageHandler for BatchMessageHandler {
    async fn handle(&self, message: Message) -> Result<()> {
        let envelope = match self
            .queue
            .codec
            .decode_task(&message.payload, message.key.as_deref(), &message.headers)
        {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, "dropping undecodable task message");
                return Ok(());
            }
        };

        self.aggregator.add(envelope);
        if self.aggregator.should_flush() {
            let batch = self.aggregator.flush();
            debug!(count = batch.len(), "flushing batch to handler");
            self.handler.handle_batch(batch).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::test_double::InMemoryBroker;
    use crate::config::{BrokerKind, KafkaBrokerConfig, QueueConfig};
    use crate::recorder::NoopRecorder;
    use std::sync::atomic::AtomicUsize;

    struct CountingHandler(Arc<AtomicUsize>);

    #[async_trait]
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
            .recorder(Arc::new(NoopRecorder))
            .shutdown_timeout(std::time::Duration::from_secs(5))
            .build()
    }

    async fn test_queue() -> Arc<TaskQueue> {
        let broker: Arc<dyn Broker> = Arc::new(InMemoryBroker::new());
        TaskQueue::from_broker(broker, test_config()).unwrap()
    }

    #[tokio::test]
    async fn resolve_queue_uses_priority_suffix_by_default() {
        let queue = test_queue().await;
        assert_eq!(queue.resolve_queue(None, Priority::High), "APP_PRIORITY_HIGH");
        assert_eq!(
            queue.resolve_queue(Some("custom"), Priority::Normal),
            "APP-custom"
        );
    }

    #[test]
    fn builder_constructs_kafka_broker_kind() {
        let queue_config = QueueConfig::builder(BrokerKind::Kafka(KafkaBrokerConfig::new(
            "localhost:9092",
            "g1",
        )))
        .build();
        assert!(matches!(queue_config.broker, BrokerKind::Kafka(_)));
    }

    #[tokio::test]
    async fn enqueue_immediate_then_start_invokes_handler() {
        let queue = test_queue().await;
        let count = Arc::new(AtomicUsize::new(0));
        queue
            .start(Arc::new(CountingHandler(count.clone())))
            .await
            .unwrap();

        queue
            .enqueue(Task::new("email", b"hi".to_vec()), EnqueueOptions::default())
            .await
            .unwrap();

        tokio::time::timeout(std::time::Duration::from_secs(1), async {
            while count.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("handler should run");

        queue.stop().await.unwrap();
    }

    #[tokio::test]
    async fn double_start_errors_already_running() {
        let queue = test_queue().await;
        let count = Arc::new(AtomicUsize::new(0));
        queue
            .start(Arc::new(CountingHandler(count.clone())))
            .await
            .unwrap();
        let err = queue
            .start(Arc::new(CountingHandler(count.clone())))
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::AlreadyRunning));
        queue.stop().await.unwrap();
    }

    #[tokio::test]
    async fn enqueue_after_stop_errors() {
        let queue = test_queue().await;
        queue
            .start(Arc::new(CountingHandler(Arc::new(AtomicUsize::new(0)))))
            .await
            .unwrap();
        queue.stop().await.unwrap();
        let err = queue
            .enqueue(Task::new("email", b"hi".to_vec()), EnqueueOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::Stopped));
    }

    #[tokio::test]
    async fn empty_batch_errors() {
        let queue = test_queue().await;
        let err = queue
            .enqueue_batch(Vec::new(), EnqueueOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::EmptyBatch));
    }

    #[tokio::test]
    async fn delayed_enqueue_within_wheel_horizon_fires_on_priority_topic() {
        let queue = test_queue().await;
        let count = Arc::new(AtomicUsize::new(0));
        queue
            .start(Arc::new(CountingHandler(count.clone())))
            .await
            .unwrap();

        queue
            .enqueue(
                Task::new("email", b"hi".to_vec()),
                EnqueueOptions::default().process_in(std::time::Duration::from_millis(50)),
            )
            .await
            .unwrap();

        assert_eq!(count.load(Ordering::SeqCst), 0, "should not fire immediately");

        tokio::time::timeout(std::time::Duration::from_secs(2), async {
            while count.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("handler should eventually run");

        queue.stop().await.unwrap();
    }

    struct CountingBatchHandler {
        batches: Arc<std::sync::Mutex<Vec<usize>>>,
    }

    #[async_trait]
    impl BatchHandler for CountingBatchHandler {
        async fn handle_batch(&self, tasks: Vec<TaskEnvelope>) -> Result<()> {
            self.batches.lock().unwrap().push(tasks.len());
            Ok(())
        }
    }

    #[tokio::test]
    async fn start_batch_flushes_by_count() {
        let queue = test_queue().await;
        let batches = Arc::new(std::sync::Mutex::new(Vec::new()));
        let handler = Arc::new(CountingBatchHandler {
            batches: batches.clone(),
        });
        let aggregator: Arc<dyn Aggregator> = Arc::new(crate::aggregator::CountAggregator::new(3));
        queue.start_batch(handler, aggregator).await.unwrap();

        for i in 0..3 {
            queue
                .enqueue(
                    Task::new("email", format!("{i}").into_bytes()),
                    EnqueueOptions::default(),
                )
                .await
                .unwrap();
        }

        tokio::time::timeout(std::time::Duration::from_secs(1), async {
            while batches.lock().unwrap().is_empty() {
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("batch should flush");

        assert_eq!(batches.lock().unwrap()[0], 3);
        queue.stop().await.unwrap();
    }
}
