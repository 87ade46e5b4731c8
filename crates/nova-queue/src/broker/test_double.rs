use super::{Broker, Message, MessageHandler, OutboundMessage};
use crate::error::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// In-process `Broker` implementation backed by a `tokio::sync::broadcast`
/// channel per topic. Stands in for a real broker in tests, exercising
/// behavior against serialized envelopes rather than a live cluster.
pub struct InMemoryBroker {
    topics: Mutex<HashMap<String, broadcast::Sender<Message>>>,
    sent: Mutex<Vec<(String, Message)>>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
            sent: Mutex::new(Vec::new()),
        }
    }

    fn sender_for(&self, topic: &str) -> broadcast::Sender<Message> {
        let mut topics = self.topics.lock().unwrap();
        topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(1024).0)
            .clone()
    }

    /// All messages ever sent, in send order, for test assertions.
    pub fn sent_messages(&self) -> Vec<(String, Message)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn send(
        &self,
        topic: &str,
        key: Option<&str>,
        value: Vec<u8>,
        headers: HashMap<String, String>,
    ) -> Result<()> {
        let message = Message {
            topic: topic.to_string(),
            key: key.map(str::to_string),
            payload: value,
            headers,
        };
        self.sent
            .lock()
            .unwrap()
            .push((topic.to_string(), message.clone()));
        // No active subscriber is not an error: matches at-least-once
        // delivery semantics where a broker durably holds the message.
        let _ = self.sender_for(topic).send(message);
        Ok(())
    }

    async fn send_batch(&self, topic: &str, messages: Vec<OutboundMessage>) -> Result<()> {
        for m in messages {
            self.send(topic, m.key.as_deref(), m.value, m.headers).await?;
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        topics: Vec<String>,
        handler: Arc<dyn MessageHandler>,
        shutdown: CancellationToken,
    ) -> Result<()> {
        let mut receivers: Vec<(String, broadcast::Receiver<Message>)> = topics
            .iter()
            .map(|t| (t.clone(), self.sender_for(t).subscribe()))
            .collect();

        loop {
            if shutdown.is_cancelled() {
                debug!("in-memory broker subscribe loop cancelled");
                return Ok(());
            }

            let mut received = None;
            for (topic, rx) in receivers.iter_mut() {
                match rx.try_recv() {
                    Ok(message) => {
                        received = Some((topic.clone(), message));
                        break;
                    }
                    Err(broadcast::error::TryRecvError::Empty) => continue,
                    Err(broadcast::error::TryRecvError::Lagged(n)) => {
                        warn!(topic, skipped = n, "in-memory broker consumer lagged");
                        continue;
                    }
                    Err(broadcast::error::TryRecvError::Closed) => continue,
                }
            }

            match received {
                Some((_topic, message)) => {
                    if let Err(e) = handler.handle(message).await {
                        warn!(error = %e, "in-memory broker handler returned error; continuing");
                    }
                }
                None => {
                    tokio::select! {
                        _ = tokio::time::sleep(std::time::Duration::from_millis(5)) => {}
                        _ = shutdown.cancelled() => return Ok(()),
                    }
                }
            }
        }
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
