use super::{Codec, CodecFormat};
use crate::error::{QueueError, Result};
use crate::task::{DelayEnvelope, TaskEnvelope};
use std::collections::HashMap;

/// Human-readable JSON codec via `serde_json`. The default codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn format(&self) -> CodecFormat {
        CodecFormat::Json
    }

    fn encode_task(&self, envelope: &TaskEnvelope) -> Result<Vec<u8>> {
        serde_json::to_vec(envelope).map_err(|e| QueueError::Encode(e.to_string()))
    }

    fn decode_task(
        &self,
        bytes: &[u8],
        _key: Option<&str>,
        _headers: &HashMap<String, String>,
    ) -> Result<TaskEnvelope> {
        serde_json::from_slice(bytes).map_err(|e| QueueError::Decode(e.to_string()))
    }

    fn encode_delay(&self, envelope: &DelayEnvelope) -> Result<Vec<u8>> {
        serde_json::to_vec(envelope).map_err(|e| QueueError::Encode(e.to_string()))
    }

    fn decode_delay(
        &self,
        bytes: &[u8],
        _key: Option<&str>,
        _headers: &HashMap<String, String>,
    ) -> Result<DelayEnvelope> {
        serde_json::from_slice(bytes).map_err(|e| QueueError::Decode(e.to_string()))
    }
}
