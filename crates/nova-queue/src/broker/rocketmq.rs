use super::{Broker, Message, MessageHandler, OutboundMessage};
use crate::config::{RocketMqBrokerConfig, RocketMqConsumeModel};
use crate::error::{QueueError, Result};
use async_trait::async_trait;
use rocketmq_client_rust::consumer::{
    consumer::Consumer, default_push_consumer::DefaultPushConsumer, listener::MessageListener,
    MessageModel,
};
use rocketmq_client_rust::message::{message::Message as RmqMessage, message_ext::MessageExt};
use rocketmq_client_rust::producer::{
    default_producer::DefaultProducer, producer::Producer as _,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

impl From<RocketMqConsumeModel> for MessageModel {
    fn from(model: RocketMqConsumeModel) -> Self {
        match model {
            RocketMqConsumeModel::Clustering => MessageModel::Clustering,
            RocketMqConsumeModel::Broadcasting => MessageModel::Broadcasting,
        }
    }
}

/// Built on `rocketmq-client-rust`'s own producer/consumer split, matching
/// the same send/subscribe shape the other two backends expose.
pub struct RocketMqBroker {
    producer: DefaultProducer,
    name_server: String,
    group_name: String,
    consume_model: RocketMqConsumeModel,
    consume_timeout_ms: u64,
    max_reconsume_times: i32,
    acl_access_key: Option<String>,
    acl_secret_key: Option<String>,
}

impl RocketMqBroker {
    pub async fn connect(config: &RocketMqBrokerConfig) -> Result<Self> {
        info!(name_server = %config.name_server, "connecting to rocketmq");
        let mut producer = DefaultProducer::new(&config.group_name)
            .map_err(|e| QueueError::Config(format!("rocketmq producer init failed: {e}")))?;
        producer.set_namesrv_addr(&config.name_server);
        if let (Some(access_key), Some(secret_key)) =
            (&config.acl_access_key, &config.acl_secret_key)
        {
            producer.set_session_credentials(access_key, secret_key);
        }
        producer
            .start()
            .await
            .map_err(|e| QueueError::Config(format!("rocketmq producer start failed: {e}")))?;

        Ok(Self {
            producer,
            name_server: config.name_server.clone(),
            group_name: config.group_name.clone(),
            consume_model: config.consume_model,
            consume_timeout_ms: config.consume_timeout_ms,
            max_reconsume_times: config.max_reconsume_times,
            acl_access_key: config.acl_access_key.clone(),
            acl_secret_key: config.acl_secret_key.clone(),
        })
    }
}

struct ForwardingListener {
    handler: Arc<dyn MessageHandler>,
}

#[async_trait]
impl MessageListener for ForwardingListener {
    async fn consume(&self, msg: &MessageExt) -> rocketmq_client_rust::Result<()> {
        let mut headers = HashMap::new();
        for (k, v) in msg.get_properties() {
            headers.insert(k.clone(), v.clone());
        }
        let message = Message {
            topic: msg.get_topic().to_string(),
            key: msg.get_keys().map(|k| k.to_string()),
            payload: msg.get_body().to_vec(),
            headers,
        };

        match self.handler.handle(message).await {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(error = %e, "rocketmq handler returned error; signaling reconsume");
                // The callback's return value is what RocketMQ's native
                // max-reconsume-times retry keys off; a success status here
                // regardless of the handler's outcome would make
                // redelivery unreachable.
                Err(rocketmq_client_rust::Error::MQClientErr(e.to_string()))
            }
        }
    }
}

#[async_trait]
impl Broker for RocketMqBroker {
    async fn send(
        &self,
        topic: &str,
        key: Option<&str>,
        value: Vec<u8>,
        headers: HashMap<String, String>,
    ) -> Result<()> {
        let mut message = RmqMessage::new(topic, &value);
        if let Some(k) = key {
            message.set_keys(k);
        }
        for (k, v) in &headers {
            message.put_property(k, v);
        }

        self.producer
            .send(message)
            .await
            .map(|_| ())
            .map_err(|e| QueueError::BrokerSend(format!("rocketmq send to {topic}: {e}")))
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
        let consumer = Arc::new(Mutex::new(
            DefaultPushConsumer::new(&self.group_name)
                .map_err(|e| QueueError::BrokerSubscribe(format!("consumer init failed: {e}")))?,
        ));

        {
            let mut guard = consumer.lock().await;
            guard
                .set_namesrv_addr(&self.name_server)
                .set_message_model(self.consume_model.into())
                .set_consume_timeout(Duration::from_millis(self.consume_timeout_ms))
                .set_max_reconsume_times(self.max_reconsume_times)
                .register_message_listener(Arc::new(ForwardingListener { handler }));
            if let (Some(access_key), Some(secret_key)) =
                (&self.acl_access_key, &self.acl_secret_key)
            {
                guard.set_session_credentials(access_key, secret_key);
            }
            for topic in &topics {
                guard
                    .subscribe(topic, "*")
                    .map_err(|e| QueueError::BrokerSubscribe(format!("subscribe {topic}: {e}")))?;
            }
            guard
                .start()
                .await
                .map_err(|e| QueueError::BrokerSubscribe(format!("consumer start failed: {e}")))?;
        }

        shutdown.cancelled().await;
        info!("rocketmq subscribe loop cancelled");
        if let Err(e) = consumer.lock().await.shutdown().await {
            error!(error = %e, "rocketmq consumer shutdown failed");
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.producer
            .shutdown()
            .await
            .map_err(|e| QueueError::BrokerClose(format!("rocketmq producer shutdown failed: {e}")))
    }
}
