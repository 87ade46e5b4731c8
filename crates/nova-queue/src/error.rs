use thiserror::Error;

/// Taxonomy for Nova task-queue errors.
///
/// Configuration errors are fail-fast (surfaced at construction). Broker I/O
/// errors propagate to the caller for sends but are swallowed (logged, loop
/// continues) inside `Broker::subscribe`. Encoding errors propagate on
/// encode, are dropped-and-logged on decode.
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("broker send failed: {0}")]
    BrokerSend(String),

    #[error("broker subscribe failed: {0}")]
    BrokerSubscribe(String),

    #[error("broker close failed: {0}")]
    BrokerClose(String),

    #[error("codec encode failed: {0}")]
    Encode(String),

    #[error("codec decode failed: {0}")]
    Decode(String),

    #[error("task queue is already running")]
    AlreadyRunning,

    #[error("task queue is stopped")]
    Stopped,

    #[error("batch must not be empty")]
    EmptyBatch,

    #[error("shutdown timed out after {0:?}")]
    ShutdownTimeout(std::time::Duration),
}

/// Per-batch-send detail: how many messages succeeded before the first
/// error was hit. Each broker's `send_batch` folds one of these into the
/// `QueueError::BrokerSend` it returns via `Display` formatting.
#[derive(Debug, Clone, Copy)]
pub struct BatchSendOutcome {
    pub sent: usize,
    pub total: usize,
}

impl std::fmt::Display for BatchSendOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{} messages sent", self.sent, self.total)
    }
}

impl BatchSendOutcome {
    pub fn into_error(self, cause: impl std::fmt::Display) -> QueueError {
        QueueError::BrokerSend(format!("{cause} ({self})"))
    }
}

pub type Result<T> = std::result::Result<T, QueueError>;
