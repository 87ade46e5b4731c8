use super::{Codec, CodecFormat};
use crate::error::{QueueError, Result};
use crate::task::{DelayEnvelope, Task, TaskEnvelope};
use chrono::{DateTime, Utc};
use std::collections::HashMap;

/// Byte-slice pass-through codec. The wire payload is exactly
/// `task.payload` — no envelope wrapper — so routing metadata travels
/// entirely through broker headers and the message key. Encoding fails for
/// any generic value that is not itself a byte sequence.
///
/// Decoding therefore needs the headers Nova itself attaches at send time
/// (`queue`, `priority`, `task_type`) plus the message key (the task id);
/// a message missing any of them cannot be reconstructed.
#[derive(Debug, Clone, Copy, Default)]
pub struct BlobCodec;

fn required_header<'a>(headers: &'a HashMap<String, String>, name: &str) -> Result<&'a str> {
    headers
        .get(name)
        .map(String::as_str)
        .ok_or_else(|| QueueError::Decode(format!("blob codec: missing `{name}` header")))
}

impl Codec for BlobCodec {
    fn format(&self) -> CodecFormat {
        CodecFormat::Blob
    }

    fn encode_task(&self, envelope: &TaskEnvelope) -> Result<Vec<u8>> {
        Ok(envelope.task.payload.clone())
    }

    fn decode_task(
        &self,
        bytes: &[u8],
        key: Option<&str>,
        headers: &HashMap<String, String>,
    ) -> Result<TaskEnvelope> {
        let task_id = key
            .ok_or_else(|| QueueError::Decode("blob codec: missing message key (task id)".into()))?
            .to_string();
        let queue = required_header(headers, "queue")?.to_string();
        let priority: i32 = required_header(headers, "priority")?
            .parse()
            .map_err(|_| QueueError::Decode("blob codec: invalid `priority` header".into()))?;
        let task_type = required_header(headers, "task_type")?.to_string();
        Ok(TaskEnvelope {
            task_id,
            task: Task::new(task_type, bytes.to_vec()),
            queue,
            priority,
        })
    }

    fn encode_delay(&self, envelope: &DelayEnvelope) -> Result<Vec<u8>> {
        Ok(envelope.task.payload.clone())
    }

    fn decode_delay(
        &self,
        bytes: &[u8],
        key: Option<&str>,
        headers: &HashMap<String, String>,
    ) -> Result<DelayEnvelope> {
        let task_id = key
            .ok_or_else(|| QueueError::Decode("blob codec: missing message key (task id)".into()))?
            .to_string();
        let target_queue = required_header(headers, "target_queue")?.to_string();
        let target_topic = required_header(headers, "target_topic")?.to_string();
        let priority: i32 = required_header(headers, "priority")?
            .parse()
            .map_err(|_| QueueError::Decode("blob codec: invalid `priority` header".into()))?;
        let task_type = required_header(headers, "task_type")?.to_string();
        let execute_at: DateTime<Utc> = required_header(headers, "execute_at")?
            .parse()
            .map_err(|_| QueueError::Decode("blob codec: invalid `execute_at` header".into()))?;
        Ok(DelayEnvelope {
            task_id,
            task: Task::new(task_type, bytes.to_vec()),
            target_topic,
            target_queue,
            priority,
            execute_at,
            // Not part of the propagated header set; the creation instant
            // isn't recoverable from the wire message alone under the blob
            // format, so it is approximated with the
            // decode instant. This only affects observability, never the
            // `execute_at` scheduling invariant.
            created_at: Utc::now(),
        })
    }

    fn encode_value(&self, value: &serde_json::Value) -> Result<Vec<u8>> {
        let bytes: Vec<u8> = serde_json::from_value(value.clone())
            .map_err(|_| QueueError::Encode("blob codec: value is not a byte sequence".into()))?;
        Ok(bytes)
    }

    fn decode_value(&self, bytes: &[u8]) -> Result<serde_json::Value> {
        serde_json::to_value(bytes.to_vec()).map_err(|e| QueueError::Decode(e.to_string()))
    }
}
