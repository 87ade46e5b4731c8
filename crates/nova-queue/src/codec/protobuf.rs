use super::{Codec, CodecFormat};
use crate::error::{QueueError, Result};
use crate::task::{DelayEnvelope, Task, TaskEnvelope};
use chrono::{DateTime, Utc};
use prost::Message;
use std::collections::HashMap;

/// Wire message for a task envelope. Hand-written against `prost::Message`
/// (no `.proto` file or `prost-build` step) so it stays a plain struct with
/// field tags instead of adding a codegen step for a handful of stable
/// fields.
#[derive(Clone, PartialEq, Message)]
pub struct ProtoTask {
    #[prost(string, tag = "1")]
    pub task_id: String,
    #[prost(string, tag = "2")]
    pub task_type: String,
    #[prost(bytes = "vec", tag = "3")]
    pub payload: Vec<u8>,
    #[prost(string, tag = "4")]
    pub queue: String,
    #[prost(int32, tag = "5")]
    pub priority: i32,
}

impl From<&TaskEnvelope> for ProtoTask {
    fn from(e: &TaskEnvelope) -> Self {
        Self {
            task_id: e.task_id.clone(),
            task_type: e.task.task_type.clone(),
            payload: e.task.payload.clone(),
            queue: e.queue.clone(),
            priority: e.priority,
        }
    }
}

impl From<ProtoTask> for TaskEnvelope {
    fn from(p: ProtoTask) -> Self {
        TaskEnvelope {
            task_id: p.task_id,
            task: Task::new(p.task_type, p.payload),
            queue: p.queue,
            priority: p.priority,
        }
    }
}

#[derive(Clone, PartialEq, Message)]
pub struct ProtoDelayTask {
    #[prost(string, tag = "1")]
    pub task_id: String,
    #[prost(string, tag = "2")]
    pub task_type: String,
    #[prost(bytes = "vec", tag = "3")]
    pub payload: Vec<u8>,
    #[prost(string, tag = "4")]
    pub target_topic: String,
    #[prost(string, tag = "5")]
    pub target_queue: String,
    #[prost(int32, tag = "6")]
    pub priority: i32,
    #[prost(string, tag = "7")]
    pub execute_at: String,
    #[prost(string, tag = "8")]
    pub created_at: String,
}

impl From<&DelayEnvelope> for ProtoDelayTask {
    fn from(e: &DelayEnvelope) -> Self {
        Self {
            task_id: e.task_id.clone(),
            task_type: e.task.task_type.clone(),
            payload: e.task.payload.clone(),
            target_topic: e.target_topic.clone(),
            target_queue: e.target_queue.clone(),
            priority: e.priority,
            execute_at: e.execute_at.to_rfc3339(),
            created_at: e.created_at.to_rfc3339(),
        }
    }
}

impl TryFrom<ProtoDelayTask> for DelayEnvelope {
    type Error = QueueError;

    fn try_from(p: ProtoDelayTask) -> Result<Self> {
        let execute_at: DateTime<Utc> = p
            .execute_at
            .parse()
            .map_err(|_| QueueError::Decode("protobuf: invalid execute_at".into()))?;
        let created_at: DateTime<Utc> = p
            .created_at
            .parse()
            .map_err(|_| QueueError::Decode("protobuf: invalid created_at".into()))?;
        Ok(DelayEnvelope {
            task_id: p.task_id,
            task: Task::new(p.task_type, p.payload),
            target_topic: p.target_topic,
            target_queue: p.target_queue,
            priority: p.priority,
            execute_at,
            created_at,
        })
    }
}

/// Requires the target to carry a protobuf message descriptor; fails
/// otherwise. Nova's own envelopes always carry one
/// (`ProtoTask`/`ProtoDelayTask`); the generic `encode_value`/`decode_value`
/// capability set has no descriptor to attach to a bare JSON value, so it
/// always errors.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProtobufCodec;

impl Codec for ProtobufCodec {
    fn format(&self) -> CodecFormat {
        CodecFormat::Protobuf
    }

    fn encode_task(&self, envelope: &TaskEnvelope) -> Result<Vec<u8>> {
        Ok(ProtoTask::from(envelope).encode_to_vec())
    }

    fn decode_task(
        &self,
        bytes: &[u8],
        _key: Option<&str>,
        _headers: &HashMap<String, String>,
    ) -> Result<TaskEnvelope> {
        let proto = ProtoTask::decode(bytes).map_err(|e| QueueError::Decode(e.to_string()))?;
        Ok(proto.into())
    }

    fn encode_delay(&self, envelope: &DelayEnvelope) -> Result<Vec<u8>> {
        Ok(ProtoDelayTask::from(envelope).encode_to_vec())
    }

    fn decode_delay(
        &self,
        bytes: &[u8],
        _key: Option<&str>,
        _headers: &HashMap<String, String>,
    ) -> Result<DelayEnvelope> {
        let proto = ProtoDelayTask::decode(bytes).map_err(|e| QueueError::Decode(e.to_string()))?;
        proto.try_into()
    }

    fn encode_value(&self, _value: &serde_json::Value) -> Result<Vec<u8>> {
        Err(QueueError::Encode(
            "protobuf codec requires a message descriptor; bare JSON values have none".into(),
        ))
    }

    fn decode_value(&self, _bytes: &[u8]) -> Result<serde_json::Value> {
        Err(QueueError::Decode(
            "protobuf codec requires a message descriptor; bare JSON values have none".into(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Priority;

    #[test]
    fn task_round_trips() {
        let envelope = TaskEnvelope::new(
            "APP",
            Task::new("email", b"hi".to_vec()),
            "APP_PRIORITY_NORMAL".into(),
            Priority::Normal,
        );
        let codec = ProtobufCodec;
        let bytes = codec.encode_task(&envelope).unwrap();
        let decoded = codec.decode_task(&bytes, None, &HashMap::new()).unwrap();
        assert_eq!(decoded.task_id, envelope.task_id);
        assert_eq!(decoded.task.payload, envelope.task.payload);
    }

    #[test]
    fn delay_round_trips() {
        let now = Utc::now();
        let envelope = DelayEnvelope {
            task_id: "APP_TASKS_x".into(),
            task: Task::new("email", b"hi".to_vec()),
            target_topic: "APP_DELAY_3".into(),
            target_queue: "APP_PRIORITY_NORMAL".into(),
            priority: 2,
            execute_at: now + chrono::Duration::hours(1),
            created_at: now,
        };
        let codec = ProtobufCodec;
        let bytes = codec.encode_delay(&envelope).unwrap();
        let decoded = codec.decode_delay(&bytes, None, &HashMap::new()).unwrap();
        assert_eq!(decoded.target_topic, envelope.target_topic);
        assert_eq!(decoded.execute_at.timestamp_millis(), envelope.execute_at.timestamp_millis());
    }
}
