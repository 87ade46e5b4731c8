mod blob;
mod json;
mod protobuf;
mod simd_json_codec;

pub use blob::BlobCodec;
pub use json::JsonCodec;
pub use protobuf::{ProtoTask, ProtobufCodec};
pub use simd_json_codec::SimdJsonCodec;

use crate::error::{QueueError, Result};
use crate::task::{DelayEnvelope, TaskEnvelope};
use std::collections::HashMap;

/// Tag returned by `Codec::format()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecFormat {
    Json,
    SimdJson,
    Blob,
    Protobuf,
}

impl CodecFormat {
    pub fn tag(&self) -> &'static str {
        match self {
            CodecFormat::Json => "json",
            CodecFormat::SimdJson => "simd_json",
            CodecFormat::Blob => "blob",
            CodecFormat::Protobuf => "protobuf",
        }
    }
}

/// Four interchangeable wire formats for `TaskEnvelope`/`DelayEnvelope`. A
/// single codec is chosen at queue construction and shared with the delay
/// manager so the delay wire format matches the task wire format.
///
/// `encode_value`/`decode_value` additionally expose the format's *generic*
/// encode/decode capability through a `serde_json::Value` intermediate,
/// including the blob codec's rule that encoding fails for any value that
/// is not itself a byte sequence.
pub trait Codec: Send + Sync + std::fmt::Debug {
    fn format(&self) -> CodecFormat;

    fn encode_task(&self, envelope: &TaskEnvelope) -> Result<Vec<u8>>;
    /// `key` is the broker message key, which Nova always sets to the task
    /// id; formats that don't embed the task id in the payload (blob) need
    /// it to reconstruct the envelope.
    fn decode_task(
        &self,
        bytes: &[u8],
        key: Option<&str>,
        headers: &HashMap<String, String>,
    ) -> Result<TaskEnvelope>;

    fn encode_delay(&self, envelope: &DelayEnvelope) -> Result<Vec<u8>>;
    fn decode_delay(
        &self,
        bytes: &[u8],
        key: Option<&str>,
        headers: &HashMap<String, String>,
    ) -> Result<DelayEnvelope>;

    fn encode_value(&self, value: &serde_json::Value) -> Result<Vec<u8>> {
        serde_json::to_vec(value).map_err(|e| QueueError::Encode(e.to_string()))
    }

    fn decode_value(&self, bytes: &[u8]) -> Result<serde_json::Value> {
        serde_json::from_slice(bytes).map_err(|e| QueueError::Decode(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{Priority, Task};

    fn sample_envelope() -> TaskEnvelope {
        TaskEnvelope::new(
            "APP",
            Task::new("email", b"hi".to_vec()),
            "APP_PRIORITY_NORMAL".into(),
            Priority::Normal,
        )
    }

    fn roundtrip(codec: &dyn Codec) {
        let envelope = sample_envelope();
        let bytes = codec.encode_task(&envelope).expect("encode");
        let decoded = codec
            .decode_task(&bytes, Some(&envelope.task_id), &envelope.headers())
            .expect("decode");
        assert_eq!(decoded.task_id, envelope.task_id);
        assert_eq!(decoded.task.task_type, envelope.task.task_type);
        assert_eq!(decoded.task.payload, envelope.task.payload);
    }

    #[test]
    fn json_codec_round_trips() {
        roundtrip(&JsonCodec);
    }

    #[test]
    fn simd_json_codec_round_trips() {
        roundtrip(&SimdJsonCodec);
    }

    #[test]
    fn blob_codec_round_trips_payload_bytes() {
        roundtrip(&BlobCodec);
    }

    #[test]
    fn blob_codec_generic_encode_rejects_non_byte_values() {
        let codec = BlobCodec;
        let not_bytes = serde_json::json!({ "not": "bytes" });
        assert!(codec.encode_value(&not_bytes).is_err());

        let bytes_value = serde_json::to_value(vec![1u8, 2, 3]).unwrap();
        let encoded = codec.encode_value(&bytes_value).expect("byte array encodes");
        assert_eq!(encoded, vec![1, 2, 3]);
        let decoded = codec.decode_value(&encoded).expect("decode");
        let back: Vec<u8> = serde_json::from_value(decoded).unwrap();
        assert_eq!(back, vec![1, 2, 3]);
    }
}
