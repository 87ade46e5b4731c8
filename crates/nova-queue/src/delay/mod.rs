use crate::broker::{Broker, Message, MessageHandler};
use crate::clock::Clock;
use crate::codec::Codec;
use crate::error::Result;
use crate::task::{DelayEnvelope, TaskEnvelope};
use crate::timer_wheel::TimerWheel;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::{Arc, Weak};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, trace};

/// `<target>_DELAY_<i>` for Kafka/RocketMQ, `<target>_DELAY_<i>_QUEUE` for
/// RabbitMQ; the manager is agnostic to which and just asks for the name of
/// slot `i`.
pub fn delay_slot_name(target_queue: &str, slot: u32) -> String {
    format!("{target_queue}_DELAY_{slot}")
}

/// `s = min(⌊delay/D⌋, N−1)`: the slot index for a delay given a fixed
/// slot duration `D` and `N` total slots, saturating at the last slot.
pub fn slot_index(delay: chrono::Duration, slot_duration: std::time::Duration, slot_count: u32) -> u32 {
    if slot_duration.is_zero() || slot_count == 0 {
        return 0;
    }
    let delay_ms = delay.num_milliseconds().max(0) as u64;
    let slot_ms = slot_duration.as_millis().max(1) as u64;
    ((delay_ms / slot_ms) as u32).min(slot_count - 1)
}

/// Re-publishes a task once its `executeAt` arrives. Shared by all three
/// broker-backed delay realisations; re-run at enqueue time and again on
/// every broker-side delay message received: check the ETA, then either
/// send, wheel-schedule, or requeue onto a further-out slot.
///
/// This trait is the queue-facade-facing surface; each broker variant also
/// implements `Broker` + `MessageHandler` internally to move messages
/// through its own slot mechanism (Kafka/RocketMQ use N topics, RabbitMQ
/// uses N TTL+DLX queues).
#[async_trait]
pub trait DelayManager: Send + Sync {
    /// Schedules `envelope` for delivery at `execute_at`, routed to the
    /// queue the envelope already names.
    async fn enqueue_delay(
        &self,
        envelope: TaskEnvelope,
        execute_at: DateTime<Utc>,
    ) -> Result<()>;

    /// Starts the timer wheel and the delay-topic/queue subscriptions.
    async fn start(&self) -> Result<()>;

    /// Stops the timer wheel and cancels delay subscriptions. Idempotent.
    async fn stop(&self);
}

/// Callback the delay manager invokes once a task's `executeAt` has passed,
/// handing the envelope back to the facade's normal send path (the priority
/// topic it was originally destined for). Boxed so the facade can close over
/// itself without the delay manager depending on it directly.
pub type SendPath = Arc<dyn Fn(TaskEnvelope) -> futures::future::BoxFuture<'static, Result<()>> + Send + Sync>;

/// Generic broker-backed delay manager. Parameterised only over `Broker`
/// (and not over a specific Kafka/RocketMQ/RabbitMQ type) because the
/// decision ladder and slot math are identical across all three; what
/// differs is how each `Broker` impl names and provisions its delay
/// channels, which stays inside that impl.
pub struct DefaultDelayManager {
    broker: Arc<dyn Broker>,
    codec: Arc<dyn Codec>,
    wheel: Arc<TimerWheel>,
    clock: Arc<dyn Clock>,
    slot_count: u32,
    slot_duration: std::time::Duration,
    /// Base queue names (the priority topics plus the shared tasks topic)
    /// that a task can be delayed towards. `start` subscribes to every
    /// `<queue>_DELAY_<slot>` combination so an overshot delay message is
    /// always picked back up and re-run through the ladder.
    target_queues: Vec<String>,
    shutdown: CancellationToken,
    send_path: SendPath,
    self_ref: Weak<DefaultDelayManager>,
    slot_subscription: AsyncMutex<Option<JoinHandle<()>>>,
}

impl DefaultDelayManager {
    pub fn new(
        broker: Arc<dyn Broker>,
        codec: Arc<dyn Codec>,
        wheel: Arc<TimerWheel>,
        clock: Arc<dyn Clock>,
        slot_count: u32,
        slot_duration: std::time::Duration,
        target_queues: Vec<String>,
        send_path: SendPath,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            broker,
            codec,
            wheel,
            clock,
            slot_count,
            slot_duration,
            target_queues,
            shutdown: CancellationToken::new(),
            send_path,
            self_ref: self_ref.clone(),
            slot_subscription: AsyncMutex::new(None),
        })
    }

    /// Every `<queue>_DELAY_<slot>` name across all target queues and slots,
    /// the full set of delay channels `start` must listen on.
    fn slot_topics(&self) -> Vec<String> {
        let mut topics = Vec::with_capacity(self.target_queues.len() * self.slot_count as usize);
        for queue in &self.target_queues {
            for slot in 0..self.slot_count {
                topics.push(delay_slot_name(queue, slot));
            }
        }
        topics
    }

    /// The decision ladder, run both from `enqueue_delay` and from the
    /// delay-slot subscriber on arrival.
    async fn apply_ladder(&self, envelope: TaskEnvelope, execute_at: DateTime<Utc>) -> Result<()> {
        let now = self.clock.now();
        if execute_at <= now {
            trace!(task_id = %envelope.task_id, "delay ladder: due now, sending");
            return (self.send_path)(envelope).await;
        }

        let remaining = execute_at - now;
        if remaining < chrono::Duration::from_std(self.wheel.horizon()).unwrap_or_default() {
            trace!(task_id = %envelope.task_id, "delay ladder: within wheel horizon");
            let send_path = self.send_path.clone();
            let envelope_for_timer = envelope.clone();
            self.wheel.add_at(
                execute_at,
                Box::new(move || {
                    let send_path = send_path.clone();
                    let envelope = envelope_for_timer.clone();
                    tokio::spawn(async move {
                        if let Err(e) = send_path(envelope).await {
                            error!(error = %e, "delay wheel send failed");
                        }
                    });
                }),
            );
            return Ok(());
        }

        trace!(task_id = %envelope.task_id, "delay ladder: beyond wheel horizon, using broker slot");
        let slot = slot_index(remaining, self.slot_duration, self.slot_count);
        let target_topic = delay_slot_name(&envelope.queue, slot);
        let delay_envelope = DelayEnvelope::from_task_envelope(envelope, target_topic, execute_at, now);
        let bytes = self.codec.encode_delay(&delay_envelope)?;
        self.broker
            .send(
                &delay_envelope.target_topic,
                Some(&delay_envelope.task_id),
                bytes,
                delay_envelope.headers(),
            )
            .await
    }
}

struct DelaySlotHandler {
    manager: Arc<DefaultDelayManager>,
}

#[async_trait]
impl MessageHandler for DelaySlotHandler {
    async fn handle(&self, message: Message) -> Result<()> {
        let envelope = self
            .manager
            .codec
            .decode_delay(&message.payload, message.key.as_deref(), &message.headers)?;
        let execute_at = envelope.execute_at;
        let task_envelope = envelope.into_task_envelope();
        self.manager.apply_ladder(task_envelope, execute_at).await
    }
}

#[async_trait]
impl DelayManager for DefaultDelayManager {
    async fn enqueue_delay(&self, envelope: TaskEnvelope, execute_at: DateTime<Utc>) -> Result<()> {
        self.apply_ladder(envelope, execute_at).await
    }

    async fn start(&self) -> Result<()> {
        self.wheel.start();

        let manager = self
            .self_ref
            .upgrade()
            .expect("DefaultDelayManager::start called while the manager itself is still alive");
        let handler: Arc<dyn MessageHandler> = Arc::new(DelaySlotHandler { manager });
        let slot_topics = self.slot_topics();
        let broker = self.broker.clone();
        let shutdown = self.shutdown.clone();
        let join = tokio::spawn(async move {
            if let Err(e) = broker.subscribe(slot_topics, handler, shutdown).await {
                error!(error = %e, "delay slot subscribe loop exited with error");
            }
        });
        *self.slot_subscription.lock().await = Some(join);
        Ok(())
    }

    async fn stop(&self) {
        self.shutdown.cancel();
        self.wheel.stop().await;
        if let Some(join) = self.slot_subscription.lock().await.take() {
            let _ = join.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_index_saturates_at_slot_count_minus_one() {
        let idx = slot_index(
            chrono::Duration::hours(100),
            std::time::Duration::from_secs(3600),
            24,
        );
        assert_eq!(idx, 23);
    }

    #[test]
    fn slot_index_computes_floor_division() {
        let idx = slot_index(
            chrono::Duration::minutes(330),
            std::time::Duration::from_secs(3600),
            24,
        );
        assert_eq!(idx, 5);
    }

    #[test]
    fn delay_slot_name_embeds_target_and_index() {
        assert_eq!(delay_slot_name("APP_TASKS", 5), "APP_TASKS_DELAY_5");
    }
}
