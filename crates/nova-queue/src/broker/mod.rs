#[cfg(feature = "kafka")]
pub mod kafka;
#[cfg(feature = "rabbitmq")]
pub mod rabbitmq;
#[cfg(feature = "rocketmq")]
pub mod rocketmq;
pub mod test_double;

use async_trait::async_trait;
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;

use crate::error::Result;

/// A single message as handed to a `Subscribe` handler: raw bytes plus
/// routing metadata. Brokers are responsible for extracting these from
/// their native message type (`rdkafka::message::BorrowedMessage`,
/// `lapin::message::Delivery`, the RocketMQ push-consumer callback
/// argument).
#[derive(Debug, Clone)]
pub struct Message {
    pub topic: String,
    pub key: Option<String>,
    pub payload: Vec<u8>,
    pub headers: HashMap<String, String>,
}

/// A message to be sent, as accepted by `send_batch`.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub key: Option<String>,
    pub value: Vec<u8>,
    pub headers: HashMap<String, String>,
}

/// Handler invoked per received message by `Broker::subscribe`. Returning
/// `Err` is logged and, depending on the broker, triggers a nack/requeue;
/// it never stops the subscribe loop.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: Message) -> Result<()>;
}

/// Polymorphic broker capability set consumed by the core: `send`,
/// `send_batch`, `subscribe`, `close`. One trait, three concrete
/// implementations (Kafka, RocketMQ, RabbitMQ) behind Cargo features.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Synchronous send with delivery acknowledgement.
    async fn send(
        &self,
        topic: &str,
        key: Option<&str>,
        value: Vec<u8>,
        headers: HashMap<String, String>,
    ) -> Result<()>;

    /// Best-effort batch send; returns the first error encountered, with a
    /// success count recorded in the error detail.
    async fn send_batch(&self, topic: &str, messages: Vec<OutboundMessage>) -> Result<()>;

    /// Loops until `shutdown` is cancelled; invokes `handler` per received
    /// message and acknowledges on success. Transient broker errors are
    /// logged and the loop continues; cancellation ends it cleanly.
    async fn subscribe(
        &self,
        topics: Vec<String>,
        handler: std::sync::Arc<dyn MessageHandler>,
        shutdown: CancellationToken,
    ) -> Result<()>;

    /// Flushes pending produces (bounded wait), closes the consumer first,
    /// then the producer/connection.
    async fn close(&self) -> Result<()>;
}
