use super::{Broker, Message, MessageHandler, OutboundMessage};
use crate::config::RabbitMqBrokerConfig;
use crate::error::{QueueError, Result};
use async_trait::async_trait;
use futures::stream::{select_all, StreamExt};
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
    BasicRejectOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// RabbitMQ adapter built on the durable topic-exchange/queue/routing-key
/// pattern (`basic_publish` / `basic_consume` / `ack`/`reject`), wired into
/// Nova's broker-neutral `Broker` trait.
pub struct RabbitMqBroker {
    connection: Connection,
    channel: Channel,
    delay_slot_ttl_ms: i64,
}

impl RabbitMqBroker {
    pub async fn connect(config: &RabbitMqBrokerConfig) -> Result<Self> {
        info!(uri = %config.amqp_uri, "connecting to rabbitmq");
        let connection = Connection::connect(&config.amqp_uri, ConnectionProperties::default())
            .await
            .map_err(|e| QueueError::Config(format!("rabbitmq connect failed: {e}")))?;
        let channel = connection
            .create_channel()
            .await
            .map_err(|e| QueueError::Config(format!("rabbitmq channel creation failed: {e}")))?;
        if config.prefetch_size != 0 {
            // lapin's basic_qos has no prefetch_size argument: RabbitMQ itself
            // never implemented the AMQP 0-9-1 prefetch-size field, so there is
            // nothing to forward it to. Count-based prefetch still applies.
            warn!(
                prefetch_size = config.prefetch_size,
                "rabbitmq does not honor QoS prefetch size; only prefetch_count is applied"
            );
        }
        channel
            .basic_qos(config.prefetch_count, BasicQosOptions::default())
            .await
            .map_err(|e| QueueError::Config(format!("rabbitmq qos failed: {e}")))?;

        Ok(Self {
            connection,
            channel,
            delay_slot_ttl_ms: config.delay_slot_ttl.as_millis() as i64,
        })
    }

    /// Declares `topic` as a durable topic exchange plus its own durable
    /// queue, bound together under `topic`'s own name as the routing key —
    /// each Nova queue gets a matching topic-exchange routing key rather
    /// than a fanout binding, so a future split into several queues behind
    /// one exchange can route on it.
    async fn ensure_topic(&self, topic: &str) -> Result<()> {
        self.channel
            .exchange_declare(
                topic,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| QueueError::BrokerSend(format!("exchange_declare {topic}: {e}")))?;
        self.channel
            .queue_declare(
                topic,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| QueueError::BrokerSend(format!("queue_declare {topic}: {e}")))?;
        self.channel
            .queue_bind(
                topic,
                topic,
                topic,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| QueueError::BrokerSend(format!("queue_bind {topic}: {e}")))?;
        Ok(())
    }

    /// Declares a dead-letter-to-target delay queue whose messages expire
    /// after a fixed TTL, the coarse per-slot expiry approach used on
    /// brokers without a native scheduled-delivery feature.
    pub async fn ensure_delay_queue(&self, delay_queue: &str, target_exchange: &str) -> Result<()> {
        let mut args = FieldTable::default();
        args.insert(
            "x-dead-letter-exchange".into(),
            AMQPValue::LongString(target_exchange.into()),
        );
        args.insert(
            "x-message-ttl".into(),
            AMQPValue::LongLongInt(self.delay_slot_ttl_ms),
        );
        self.channel
            .queue_declare(
                delay_queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                args,
            )
            .await
            .map_err(|e| QueueError::BrokerSend(format!("delay queue_declare {delay_queue}: {e}")))?;
        Ok(())
    }
}

fn headers_to_amqp(headers: &HashMap<String, String>) -> FieldTable {
    let mut table = FieldTable::default();
    for (k, v) in headers {
        table.insert(k.as_str().into(), AMQPValue::LongString(v.as_str().into()));
    }
    table
}

fn amqp_to_headers(table: Option<&FieldTable>) -> HashMap<String, String> {
    let mut headers = HashMap::new();
    if let Some(table) = table {
        for (k, v) in table.inner() {
            if let AMQPValue::LongString(s) = v {
                headers.insert(k.to_string(), s.to_string());
            }
        }
    }
    headers
}

#[async_trait]
impl Broker for RabbitMqBroker {
    async fn send(
        &self,
        topic: &str,
        key: Option<&str>,
        value: Vec<u8>,
        headers: HashMap<String, String>,
    ) -> Result<()> {
        self.ensure_topic(topic).await?;
        let properties = BasicProperties::default()
            .with_headers(headers_to_amqp(&headers))
            .with_delivery_mode(2);
        let properties = match key {
            Some(k) => properties.with_message_id(k.into()),
            None => properties,
        };

        self.channel
            .basic_publish(
                topic,
                topic,
                BasicPublishOptions::default(),
                &value,
                properties,
            )
            .await
            .map_err(|e| QueueError::BrokerSend(format!("rabbitmq publish to {topic}: {e}")))?
            .await
            .map_err(|e| QueueError::BrokerSend(format!("rabbitmq publisher confirm: {e}")))?;
        Ok(())
    }

    async fn send_batch(&self, topic: &str, messages: Vec<OutboundMessage>) -> Result<()> {
        let total = messages.len();
        let mut sent = 0;
        for message in messages {
            match self
                .send(topic, message.key.as_deref(), message.value, message.headers)
                .await
            {
                Ok(()) => sent += 1,
                Err(e) => {
                    return Err(crate::error::BatchSendOutcome { sent, total }.into_error(e))
                }
            }
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        topics: Vec<String>,
        handler: Arc<dyn MessageHandler>,
        shutdown: CancellationToken,
    ) -> Result<()> {
        if topics.is_empty() {
            return Err(QueueError::BrokerSubscribe(
                "subscribe requires at least one topic".into(),
            ));
        }
        for topic in &topics {
            self.ensure_topic(topic).await?;
        }

        let mut consumers = Vec::with_capacity(topics.len());
        for topic in &topics {
            let consumer = self
                .channel
                .basic_consume(
                    topic,
                    "nova-consumer",
                    BasicConsumeOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(|e| QueueError::BrokerSubscribe(format!("basic_consume {topic} failed: {e}")))?;
            consumers.push(consumer.boxed());
        }
        let mut merged = select_all(consumers);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("rabbitmq subscribe loop cancelled");
                    return Ok(());
                }
                next = merged.next() => {
                    match next {
                        Some(Ok(delivery)) => {
                            let message = Message {
                                topic: delivery.exchange.to_string(),
                                key: delivery.properties.message_id().as_ref().map(|s| s.to_string()),
                                payload: delivery.data.clone(),
                                headers: amqp_to_headers(delivery.properties.headers().as_ref()),
                            };

                            match handler.handle(message).await {
                                Ok(()) => {
                                    if let Err(e) = delivery.ack(BasicAckOptions::default()).await {
                                        error!(error = %e, "failed to ack rabbitmq delivery");
                                    }
                                }
                                Err(e) => {
                                    warn!(error = %e, "rabbitmq handler error, rejecting with requeue");
                                    if let Err(e) = delivery
                                        .reject(BasicRejectOptions { requeue: true })
                                        .await
                                    {
                                        error!(error = %e, "failed to reject rabbitmq delivery");
                                    }
                                }
                            }
                        }
                        Some(Err(e)) => {
                            error!(error = %e, "rabbitmq delivery error");
                        }
                        None => {
                            debug!("rabbitmq consumer stream ended");
                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    async fn close(&self) -> Result<()> {
        self.channel
            .close(200, "shutting down")
            .await
            .map_err(|e| QueueError::BrokerClose(format!("channel close failed: {e}")))?;
        self.connection
            .close(200, "shutting down")
            .await
            .map_err(|e| QueueError::BrokerClose(format!("connection close failed: {e}")))?;
        Ok(())
    }
}
