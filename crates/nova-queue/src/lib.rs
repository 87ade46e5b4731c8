//! Broker-agnostic distributed task queue core.
//!
//! Unifies Kafka, RocketMQ, and RabbitMQ behind one enqueue/consume API with
//! priority routing, a two-tier delay scheduler (in-process timer wheel plus
//! broker-backed delay slots), pluggable batch aggregation, and four
//! interchangeable wire codecs.

pub mod aggregator;
pub mod broker;
pub mod clock;
pub mod codec;
pub mod config;
pub mod delay;
pub mod error;
pub mod queue;
pub mod recorder;
pub mod task;
pub mod timer_wheel;

pub use aggregator::{Aggregator, CountAggregator, TimeAggregator, TimeCountAggregator};
pub use broker::{Broker, Message, MessageHandler, OutboundMessage};
pub use clock::{Clock, FakeClock, SystemClock};
pub use codec::{BlobCodec, Codec, CodecFormat, JsonCodec, ProtobufCodec, SimdJsonCodec};
pub use config::{BrokerKind, QueueConfig, QueueConfigBuilder};
pub use delay::{DefaultDelayManager, DelayManager};
pub use error::{QueueError, Result};
pub use queue::{BatchHandler, TaskHandler, TaskQueue};
pub use recorder::{InMemoryRecorder, NoopRecorder, RecordFilter, TaskRecord, TaskRecorder, TaskStatus};
pub use task::{DelayEnvelope, EnqueueOptions, EnqueueResult, Priority, Task, TaskEnvelope};
