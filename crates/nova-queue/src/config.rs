use crate::codec::{BlobCodec, Codec, JsonCodec, ProtobufCodec, SimdJsonCodec};
use crate::error::{QueueError, Result};
use crate::recorder::{NoopRecorder, TaskRecorder};
use std::sync::Arc;
use std::time::Duration;

/// Kafka-specific connection settings: bootstrap servers, consumer group,
/// commit behavior, and the timeouts governing producer/consumer setup.
#[derive(Debug, Clone)]
pub struct KafkaBrokerConfig {
    pub bootstrap_servers: String,
    pub group_id: String,
    pub auto_commit: bool,
    pub session_timeout_ms: u64,
    pub max_poll_interval_ms: u64,
    pub send_timeout_ms: u64,
    pub security_protocol: Option<String>,
    pub sasl_mechanism: Option<String>,
    pub sasl_username: Option<String>,
    pub sasl_password: Option<String>,
}

impl KafkaBrokerConfig {
    pub fn new(bootstrap_servers: impl Into<String>, group_id: impl Into<String>) -> Self {
        Self {
            bootstrap_servers: bootstrap_servers.into(),
            group_id: group_id.into(),
            auto_commit: false,
            session_timeout_ms: 10_000,
            max_poll_interval_ms: 300_000,
            send_timeout_ms: 5_000,
            security_protocol: None,
            sasl_mechanism: None,
            sasl_username: None,
            sasl_password: None,
        }
    }

    /// Reads `KAFKA_BOOTSTRAP_SERVERS`/`KAFKA_GROUP_ID` from the environment,
    /// falling back to a process-scoped default group id.
    pub fn from_env() -> Result<Self> {
        let bootstrap_servers = std::env::var("KAFKA_BOOTSTRAP_SERVERS")
            .map_err(|_| QueueError::Config("KAFKA_BOOTSTRAP_SERVERS is not set".into()))?;
        let group_id = std::env::var("KAFKA_GROUP_ID")
            .unwrap_or_else(|_| format!("TASK_QUEUE_GROUP_{}", std::process::id()));
        Ok(Self::new(bootstrap_servers, group_id))
    }
}

/// RabbitMQ-specific connection settings.
#[derive(Debug, Clone)]
pub struct RabbitMqBrokerConfig {
    pub amqp_uri: String,
    pub prefetch_count: u16,
    /// QoS prefetch size in bytes; `0` means no byte-size limit (count-only
    /// prefetch), matching `basic_qos`'s own "0 disables the limit" rule.
    pub prefetch_size: u32,
    pub delay_slot_ttl: Duration,
}

impl RabbitMqBrokerConfig {
    pub fn new(amqp_uri: impl Into<String>) -> Self {
        Self {
            amqp_uri: amqp_uri.into(),
            prefetch_count: 50,
            prefetch_size: 0,
            delay_slot_ttl: Duration::from_secs(3600),
        }
    }

    pub fn with_prefetch_size(mut self, prefetch_size: u32) -> Self {
        self.prefetch_size = prefetch_size;
        self
    }

    pub fn from_env() -> Result<Self> {
        let amqp_uri = std::env::var("RABBITMQ_URI")
            .map_err(|_| QueueError::Config("RABBITMQ_URI is not set".into()))?;
        Ok(Self::new(amqp_uri))
    }
}

/// Push-consumer delivery model: `Clustering` load-balances one logical
/// subscription across every consumer in the group, `Broadcasting` delivers
/// every message to every consumer. RocketMQ's own default is `Clustering`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RocketMqConsumeModel {
    Clustering,
    Broadcasting,
}

/// RocketMQ-specific connection settings.
#[derive(Debug, Clone)]
pub struct RocketMqBrokerConfig {
    pub name_server: String,
    pub group_name: String,
    pub consume_model: RocketMqConsumeModel,
    pub consume_timeout_ms: u64,
    pub max_reconsume_times: i32,
    pub acl_access_key: Option<String>,
    pub acl_secret_key: Option<String>,
}

impl RocketMqBrokerConfig {
    pub fn new(name_server: impl Into<String>, group_name: impl Into<String>) -> Self {
        Self {
            name_server: name_server.into(),
            group_name: group_name.into(),
            consume_model: RocketMqConsumeModel::Clustering,
            consume_timeout_ms: 15_000,
            max_reconsume_times: 16,
            acl_access_key: None,
            acl_secret_key: None,
        }
    }

    pub fn with_consume_model(mut self, model: RocketMqConsumeModel) -> Self {
        self.consume_model = model;
        self
    }

    pub fn with_consume_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.consume_timeout_ms = timeout_ms;
        self
    }

    pub fn with_max_reconsume_times(mut self, max_reconsume_times: i32) -> Self {
        self.max_reconsume_times = max_reconsume_times;
        self
    }

    pub fn with_acl(mut self, access_key: impl Into<String>, secret_key: impl Into<String>) -> Self {
        self.acl_access_key = Some(access_key.into());
        self.acl_secret_key = Some(secret_key.into());
        self
    }

    pub fn from_env() -> Result<Self> {
        let name_server = std::env::var("ROCKETMQ_NAME_SERVER")
            .map_err(|_| QueueError::Config("ROCKETMQ_NAME_SERVER is not set".into()))?;
        let group_name = std::env::var("ROCKETMQ_GROUP_NAME")
            .unwrap_or_else(|| format!("TASK_QUEUE_GROUP_{}", std::process::id()));
        let mut config = Self::new(name_server, group_name);

        if std::env::var("ROCKETMQ_BROADCASTING").map(|v| v == "true").unwrap_or(false) {
            config.consume_model = RocketMqConsumeModel::Broadcasting;
        }
        if let Ok(timeout) = std::env::var("ROCKETMQ_CONSUME_TIMEOUT_MS") {
            config.consume_timeout_ms = timeout
                .parse()
                .map_err(|_| QueueError::Config("ROCKETMQ_CONSUME_TIMEOUT_MS is not a valid u64".into()))?;
        }
        if let Ok(max_reconsume) = std::env::var("ROCKETMQ_MAX_RECONSUME_TIMES") {
            config.max_reconsume_times = max_reconsume
                .parse()
                .map_err(|_| QueueError::Config("ROCKETMQ_MAX_RECONSUME_TIMES is not a valid i32".into()))?;
        }
        if let (Ok(access_key), Ok(secret_key)) = (
            std::env::var("ROCKETMQ_ACL_ACCESS_KEY"),
            std::env::var("ROCKETMQ_ACL_SECRET_KEY"),
        ) {
            config = config.with_acl(access_key, secret_key);
        }

        Ok(config)
    }
}

/// Which concrete broker backend a `QueueConfig` targets. Exactly one is
/// selected per queue instance.
#[derive(Debug, Clone)]
pub enum BrokerKind {
    #[cfg(feature = "kafka")]
    Kafka(KafkaBrokerConfig),
    #[cfg(feature = "rabbitmq")]
    RabbitMq(RabbitMqBrokerConfig),
    #[cfg(feature = "rocketmq")]
    RocketMq(RocketMqBrokerConfig),
}

/// Cross-cutting configuration for a `TaskQueue`: which broker to use, how
/// topics are named, delay-slot geometry, the wire codec, and the optional
/// task recorder.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub broker: BrokerKind,
    /// Prefix substituted into topic/queue names and task ids, e.g.
    /// `TASK_QUEUE` -> `TASK_QUEUE_PRIORITY_HIGH`. Defaults to `TASK_QUEUE`.
    pub topic_prefix: String,
    /// Number of broker-backed delay slots. Defaults to 24 one-hour slots,
    /// covering a full day of delayed execution.
    pub delay_slot_count: u32,
    pub delay_slot_duration: Duration,
    pub codec_format: crate::codec::CodecFormat,
    pub recorder: Arc<dyn TaskRecorder>,
    pub shutdown_timeout: Duration,
}

impl QueueConfig {
    pub fn builder(broker: BrokerKind) -> QueueConfigBuilder {
        QueueConfigBuilder::new(broker)
    }

    pub fn codec(&self) -> Arc<dyn Codec> {
        match self.codec_format {
            crate::codec::CodecFormat::Json => Arc::new(JsonCodec),
            crate::codec::CodecFormat::SimdJson => Arc::new(SimdJsonCodec),
            crate::codec::CodecFormat::Blob => Arc::new(BlobCodec),
            crate::codec::CodecFormat::Protobuf => Arc::new(ProtobufCodec),
        }
    }
}

/// Builder for `QueueConfig`, with the default values documented on
/// `QueueConfigBuilder::new`.
pub struct QueueConfigBuilder {
    broker: BrokerKind,
    topic_prefix: String,
    delay_slot_count: u32,
    delay_slot_duration: Duration,
    codec_format: crate::codec::CodecFormat,
    recorder: Arc<dyn TaskRecorder>,
    shutdown_timeout: Duration,
}

impl QueueConfigBuilder {
    pub fn new(broker: BrokerKind) -> Self {
        Self {
            broker,
            topic_prefix: "TASK_QUEUE".to_string(),
            delay_slot_count: 24,
            delay_slot_duration: Duration::from_secs(3600),
            codec_format: crate::codec::CodecFormat::Json,
            recorder: Arc::new(NoopRecorder),
            shutdown_timeout: Duration::from_secs(30),
        }
    }

    pub fn topic_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.topic_prefix = prefix.into();
        self
    }

    pub fn delay_slots(mut self, count: u32, duration: Duration) -> Self {
        self.delay_slot_count = count;
        self.delay_slot_duration = duration;
        self
    }

    pub fn codec(mut self, format: crate::codec::CodecFormat) -> Self {
        self.codec_format = format;
        self
    }

    pub fn recorder(mut self, recorder: Arc<dyn TaskRecorder>) -> Self {
        self.recorder = recorder;
        self
    }

    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn build(self) -> QueueConfig {
        QueueConfig {
            broker: self.broker,
            topic_prefix: self.topic_prefix,
            delay_slot_count: self.delay_slot_count,
            delay_slot_duration: self.delay_slot_duration,
            codec_format: self.codec_format,
            recorder: self.recorder,
            shutdown_timeout: self.shutdown_timeout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_defaults_are_sane() {
        let config = QueueConfig::builder(BrokerKind::Kafka(KafkaBrokerConfig::new(
            "localhost:9092",
            "g1",
        )))
        .build();
        assert_eq!(config.topic_prefix, "TASK_QUEUE");
        assert_eq!(config.delay_slot_count, 24);
        assert_eq!(config.delay_slot_duration, Duration::from_secs(3600));
    }

    #[test]
    fn builder_overrides_topic_prefix() {
        let config = QueueConfig::builder(BrokerKind::Kafka(KafkaBrokerConfig::new(
            "localhost:9092",
            "g1",
        )))
        .topic_prefix("APP")
        .build();
        assert_eq!(config.topic_prefix, "APP");
    }
}
