use super::{Broker, Message, MessageHandler, OutboundMessage};
use crate::config::KafkaBrokerConfig;
use crate::error::{QueueError, Result};
use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, ConsumerContext, StreamConsumer};
use rdkafka::message::{Headers, Message as _};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use rdkafka::{ClientContext, TopicPartitionList};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Rebalance/error logging hook for the consumer's `ClientContext`.
#[derive(Debug, Default)]
struct NovaConsumerContext;

impl ClientContext for NovaConsumerContext {}

impl ConsumerContext for NovaConsumerContext {
    fn post_rebalance(&self, rebalance: &rdkafka::consumer::Rebalance<'_>) {
        info!(?rebalance, "kafka consumer rebalance");
    }
}

pub struct KafkaBroker {
    producer: FutureProducer,
    consumer_config: ClientConfig,
    send_timeout: Duration,
    auto_commit: bool,
}

impl KafkaBroker {
    pub fn new(config: &KafkaBrokerConfig) -> Result<Self> {
        info!(bootstrap = %config.bootstrap_servers, "initializing kafka broker");

        let mut producer_config = ClientConfig::new();
        producer_config
            .set("bootstrap.servers", &config.bootstrap_servers)
            .set("acks", "all")
            .set("enable.idempotence", "true")
            .set("retries", "3")
            .set("compression.type", "snappy");

        if let Some(protocol) = &config.security_protocol {
            producer_config.set("security.protocol", protocol);
        }
        if let Some(mechanism) = &config.sasl_mechanism {
            producer_config.set("sasl.mechanism", mechanism);
            if let (Some(user), Some(pass)) = (&config.sasl_username, &config.sasl_password) {
                producer_config
                    .set("sasl.username", user)
                    .set("sasl.password", pass);
            }
        }

        let producer: FutureProducer = producer_config
            .create()
            .map_err(|e| QueueError::Config(format!("failed to create kafka producer: {e}")))?;

        let mut consumer_config = ClientConfig::new();
        consumer_config
            .set("bootstrap.servers", &config.bootstrap_servers)
            .set("group.id", &config.group_id)
            .set("auto.offset.reset", "earliest")
            .set(
                "enable.auto.commit",
                if config.auto_commit { "true" } else { "false" },
            )
            .set(
                "session.timeout.ms",
                config.session_timeout_ms.to_string(),
            )
            .set(
                "max.poll.interval.ms",
                config.max_poll_interval_ms.to_string(),
            );

        Ok(Self {
            producer,
            consumer_config,
            send_timeout: Duration::from_millis(config.send_timeout_ms),
            auto_commit: config.auto_commit,
        })
    }
}

#[async_trait]
impl Broker for KafkaBroker {
    async fn send(
        &self,
        topic: &str,
        key: Option<&str>,
        value: Vec<u8>,
        headers: HashMap<String, String>,
    ) -> Result<()> {
        let mut rd_headers = rdkafka::message::OwnedHeaders::new();
        for (k, v) in &headers {
            rd_headers = rd_headers.insert(rdkafka::message::Header {
                key: k,
                value: Some(v.as_bytes()),
            });
        }

        let mut record = FutureRecord::to(topic).payload(&value).headers(rd_headers);
        if let Some(k) = key {
            record = record.key(k);
        }

        match self.producer.send(record, Timeout::After(self.send_timeout)).await {
            Ok(_) => {
                debug!(topic, "kafka send succeeded");
                Ok(())
            }
            Err((e, _)) => Err(QueueError::BrokerSend(format!("kafka send to {topic}: {e}"))),
        }
    }

    async fn send_batch(&self, topic: &str, messages: Vec<OutboundMessage>) -> Result<()> {
        let total = messages.len();
        let futures: Vec<_> = messages
            .into_iter()
            .map(|m| self.send(topic, m.key.as_deref(), m.value, m.headers))
            .collect();
        let results = futures::future::join_all(futures).await;
        let sent = results.iter().filter(|r| r.is_ok()).count();
        if let Some(Err(e)) = results.into_iter().find(|r| r.is_err()) {
            return Err(crate::error::BatchSendOutcome { sent, total }.into_error(e));
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        topics: Vec<String>,
        handler: Arc<dyn MessageHandler>,
        shutdown: CancellationToken,
    ) -> Result<()> {
        let consumer: StreamConsumer<NovaConsumerContext> = self
            .consumer_config
            .clone()
            .create_with_context(NovaConsumerContext)
            .map_err(|e| QueueError::BrokerSubscribe(format!("failed to create consumer: {e}")))?;

        let topic_refs: Vec<&str> = topics.iter().map(String::as_str).collect();
        consumer
            .subscribe(&topic_refs)
            .map_err(|e| QueueError::BrokerSubscribe(format!("failed to subscribe: {e}")))?;

        let auto_commit = self.auto_commit;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("kafka subscribe loop cancelled");
                    return Ok(());
                }
                recv = consumer.recv() => {
                    match recv {
                        Ok(borrowed) => {
                            let mut headers = HashMap::new();
                            if let Some(h) = borrowed.headers() {
                                for header in h.iter() {
                                    if let Some(v) = header.value {
                                        headers.insert(
                                            header.key.to_string(),
                                            String::from_utf8_lossy(v).to_string(),
                                        );
                                    }
                                }
                            }
                            let message = Message {
                                topic: borrowed.topic().to_string(),
                                key: borrowed.key().map(|k| String::from_utf8_lossy(k).to_string()),
                                payload: borrowed.payload().unwrap_or_default().to_vec(),
                                headers,
                            };

                            if let Err(e) = handler.handle(message).await {
                                warn!(error = %e, "kafka handler returned error; message still committed");
                            }

                            if !auto_commit {
                                if let Err(e) = consumer.commit_message(&borrowed, CommitMode::Async) {
                                    error!(error = %e, "failed to commit kafka offset");
                                }
                            }
                        }
                        Err(e) => {
                            // Transient broker errors are swallowed; the loop continues.
                            error!(error = %e, "kafka receive error");
                            tokio::time::sleep(Duration::from_millis(500)).await;
                        }
                    }
                }
            }
        }
    }

    async fn close(&self) -> Result<()> {
        let producer = self.producer.clone();
        let flushed = tokio::task::spawn_blocking(move || producer.flush(Duration::from_secs(10)))
            .await
            .map_err(|e| QueueError::BrokerClose(format!("flush task join error: {e}")))?;
        flushed.map_err(|e| QueueError::BrokerClose(format!("flush failed: {e}")))?;
        Ok(())
    }
}
