use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Ordered task priority. Maps one-to-one onto a broker topic/queue; this is
/// routing, not dispatch policy. Higher-priority queues get their own topic,
/// not preferential scheduling within a shared one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(i32)]
pub enum Priority {
    Low = 1,
    Normal = 2,
    High = 3,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

impl Priority {
    pub fn as_i32(&self) -> i32 {
        *self as i32
    }

    /// The fixed topic suffix for this priority.
    pub fn suffix(&self) -> &'static str {
        match self {
            Priority::High => "HIGH",
            Priority::Normal => "NORMAL",
            Priority::Low => "LOW",
        }
    }
}

/// The fixed topic name for a priority queue, e.g. `APP_PRIORITY_HIGH`.
pub fn priority_queue_name(prefix: &str, priority: Priority) -> String {
    format!("{prefix}_PRIORITY_{}", priority.suffix())
}

/// The fixed topic name for the shared, priority-less tasks queue.
pub fn tasks_queue_name(prefix: &str) -> String {
    format!("{prefix}_TASKS")
}

/// The unit of work. Immutable once enqueued; destroyed once the consumer's
/// handler returns (success or final failure).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Free-form string identifier chosen by the caller (e.g. "send_email").
    #[serde(rename = "type")]
    pub task_type: String,
    /// Opaque byte payload.
    pub payload: Vec<u8>,
}

impl Task {
    pub fn new(task_type: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            task_type: task_type.into(),
            payload: payload.into(),
        }
    }
}

/// Wire form of a task plus routing metadata. Created at enqueue, decoded at
/// consume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEnvelope {
    pub task_id: String,
    pub task: Task,
    pub queue: String,
    pub priority: i32,
}

impl TaskEnvelope {
    /// `<prefix>_TASKS_<uuid-v4>`, a single literal with the prefix
    /// substituted in.
    pub fn new_task_id(prefix: &str) -> String {
        format!("{prefix}_TASKS_{}", uuid::Uuid::new_v4())
    }

    pub fn new(prefix: &str, task: Task, queue: String, priority: Priority) -> Self {
        Self {
            task_id: Self::new_task_id(prefix),
            task,
            queue,
            priority: priority.as_i32(),
        }
    }

    /// Header map propagated on the wire message.
    pub fn headers(&self) -> HashMap<String, String> {
        let mut h = HashMap::new();
        h.insert("queue".to_string(), self.queue.clone());
        h.insert("priority".to_string(), self.priority.to_string());
        h.insert("task_type".to_string(), self.task.task_type.clone());
        h
    }
}

/// Extends `TaskEnvelope` with the scheduling metadata needed by the
/// broker-backed delay tier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelayEnvelope {
    pub task_id: String,
    pub task: Task,
    pub target_topic: String,
    pub target_queue: String,
    pub priority: i32,
    pub execute_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl DelayEnvelope {
    pub fn from_task_envelope(
        envelope: TaskEnvelope,
        target_topic: String,
        execute_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            task_id: envelope.task_id,
            target_queue: envelope.queue.clone(),
            task: envelope.task,
            target_topic,
            priority: envelope.priority,
            execute_at,
            created_at: now,
        }
    }

    pub fn headers(&self) -> HashMap<String, String> {
        let mut h = HashMap::new();
        h.insert("queue".to_string(), self.target_queue.clone());
        h.insert("priority".to_string(), self.priority.to_string());
        h.insert("task_type".to_string(), self.task.task_type.clone());
        h.insert("execute_at".to_string(), self.execute_at.to_rfc3339());
        h.insert("target_topic".to_string(), self.target_topic.clone());
        h.insert("target_queue".to_string(), self.target_queue.clone());
        h
    }

    /// Rebuild the plain task envelope this delay envelope wraps, for
    /// redelivery to its target queue once `execute_at` has passed.
    pub fn into_task_envelope(self) -> TaskEnvelope {
        TaskEnvelope {
            task_id: self.task_id,
            task: self.task,
            queue: self.target_queue,
            priority: self.priority,
        }
    }
}

/// Options accepted by `Enqueue`/`EnqueueBatch`.
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    pub priority: Priority,
    /// Absolute time to process the task at. Takes precedence over `process_in`.
    pub process_at: Option<DateTime<Utc>>,
    /// Relative delay from now.
    pub process_in: Option<std::time::Duration>,
    /// Overrides the priority-derived queue name.
    pub queue: Option<String>,
}

impl EnqueueOptions {
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn process_at(mut self, at: DateTime<Utc>) -> Self {
        self.process_at = Some(at);
        self
    }

    pub fn process_in(mut self, delay: std::time::Duration) -> Self {
        self.process_in = Some(delay);
        self
    }

    pub fn queue(mut self, name: impl Into<String>) -> Self {
        self.queue = Some(name.into());
        self
    }

    /// Resolve the absolute execution time this enqueue should target,
    /// given the instant the enqueue call is made.
    pub fn resolve_eta(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        if let Some(at) = self.process_at {
            at
        } else if let Some(delay) = self.process_in {
            now + chrono::Duration::from_std(delay).unwrap_or_default()
        } else {
            now
        }
    }
}

/// Result of a successful enqueue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnqueueResult {
    pub id: String,
    pub queue: String,
    pub priority: Priority,
    pub eta: DateTime<Utc>,
}
