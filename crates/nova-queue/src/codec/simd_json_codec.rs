use super::{Codec, CodecFormat};
use crate::error::{QueueError, Result};
use crate::task::{DelayEnvelope, TaskEnvelope};
use std::collections::HashMap;

/// High-performance JSON codec, semantically equivalent to [`super::JsonCodec`]
/// but backed by `simd-json`'s SIMD-accelerated parser for higher decode
/// throughput. `simd-json` parses in place and therefore needs a mutable
/// copy of the input buffer.
#[derive(Debug, Clone, Copy, Default)]
pub struct SimdJsonCodec;

impl Codec for SimdJsonCodec {
    fn format(&self) -> CodecFormat {
        CodecFormat::SimdJson
    }

    fn encode_task(&self, envelope: &TaskEnvelope) -> Result<Vec<u8>> {
        simd_json::serde::to_vec(envelope).map_err(|e| QueueError::Encode(e.to_string()))
    }

    fn decode_task(
        &self,
        bytes: &[u8],
        _key: Option<&str>,
        _headers: &HashMap<String, String>,
    ) -> Result<TaskEnvelope> {
        let mut buf = bytes.to_vec();
        simd_json::serde::from_slice(&mut buf).map_err(|e| QueueError::Decode(e.to_string()))
    }

    fn encode_delay(&self, envelope: &DelayEnvelope) -> Result<Vec<u8>> {
        simd_json::serde::to_vec(envelope).map_err(|e| QueueError::Encode(e.to_string()))
    }

    fn decode_delay(
        &self,
        bytes: &[u8],
        _key: Option<&str>,
        _headers: &HashMap<String, String>,
    ) -> Result<DelayEnvelope> {
        let mut buf = bytes.to_vec();
        simd_json::serde::from_slice(&mut buf).map_err(|e| QueueError::Decode(e.to_string()))
    }

    fn encode_value(&self, value: &serde_json::Value) -> Result<Vec<u8>> {
        simd_json::serde::to_vec(value).map_err(|e| QueueError::Encode(e.to_string()))
    }

    fn decode_value(&self, bytes: &[u8]) -> Result<serde_json::Value> {
        let mut buf = bytes.to_vec();
        simd_json::serde::from_slice(&mut buf).map_err(|e| QueueError::Decode(e.to_string()))
    }
}
