use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;

/// Task lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    Pending,
    Queued,
    Processing,
    Completed,
    Failed,
    Cancelled,
    Timeout,
    Skipped,
    Unknown,
}

/// A single recorded task lifecycle entry, covering the task's identity,
/// routing, current status, the timestamps for each transition it has gone
/// through, and the error it last failed with, if any.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: String,
    pub task_type: String,
    pub queue: String,
    pub priority: i32,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub queued_at: Option<DateTime<Utc>>,
    pub process_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub retry_count: u32,
    pub metadata: serde_json::Value,
}

/// Filter for `TaskRecorder::list`. All fields are conjunctive; `None`
/// means "don't filter on this field".
#[derive(Debug, Clone, Default)]
pub struct RecordFilter {
    pub queue: Option<String>,
    pub status: Option<TaskStatus>,
}

impl RecordFilter {
    fn matches(&self, record: &TaskRecord) -> bool {
        if let Some(queue) = &self.queue {
            if &record.queue != queue {
                return false;
            }
        }
        if let Some(status) = self.status {
            if record.status != status {
                return false;
            }
        }
        true
    }
}

/// Optional external observability hook. The core invokes the recorder at
/// state transitions but never blocks task dispatch on recorder failure.
#[async_trait]
pub trait TaskRecorder: Send + Sync {
    async fn record(&self, record: TaskRecord);
    async fn update_status(&self, task_id: &str, status: TaskStatus, error: Option<String>);
    async fn get(&self, task_id: &str) -> Option<TaskRecord>;
    async fn list(&self, filter: RecordFilter) -> Vec<TaskRecord>;
    async fn delete(&self, task_id: &str);
}

/// Default recorder: does nothing. Used when no `TaskRecorder` is
/// configured, since recording is optional.
#[derive(Debug, Default)]
pub struct NoopRecorder;

#[async_trait]
impl TaskRecorder for NoopRecorder {
    async fn record(&self, _record: TaskRecord) {}
    async fn update_status(&self, _task_id: &str, _status: TaskStatus, _error: Option<String>) {}
    async fn get(&self, _task_id: &str) -> Option<TaskRecord> {
        None
    }
    async fn list(&self, _filter: RecordFilter) -> Vec<TaskRecord> {
        Vec::new()
    }
    async fn delete(&self, _task_id: &str) {}
}

/// In-memory recorder used by integration tests and as a reference
/// implementation for a real columnar-store-backed recorder.
#[derive(Debug, Default)]
pub struct InMemoryRecorder {
    records: DashMap<String, TaskRecord>,
}

impl InMemoryRecorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl TaskRecorder for InMemoryRecorder {
    async fn record(&self, record: TaskRecord) {
        // Replacing-merge semantics keyed by task_id.
        self.records.insert(record.task_id.clone(), record);
    }

    async fn update_status(&self, task_id: &str, status: TaskStatus, error: Option<String>) {
        match self.records.get_mut(task_id) {
            Some(mut record) => {
                record.status = status;
                let now = Utc::now();
                match status {
                    TaskStatus::Processing => record.started_at = Some(now),
                    TaskStatus::Completed => record.completed_at = Some(now),
                    TaskStatus::Failed | TaskStatus::Timeout => {
                        record.failed_at = Some(now);
                        record.error = error;
                    }
                    _ => {}
                }
            }
            None => warn!(task_id, "update_status for unknown task id"),
        }
    }

    async fn get(&self, task_id: &str) -> Option<TaskRecord> {
        self.records.get(task_id).map(|r| r.clone())
    }

    async fn list(&self, filter: RecordFilter) -> Vec<TaskRecord> {
        self.records
            .iter()
            .filter(|entry| filter.matches(entry.value()))
            .map(|entry| entry.value().clone())
            .collect()
    }

    async fn delete(&self, task_id: &str) {
        self.records.remove(task_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(task_id: &str) -> TaskRecord {
        TaskRecord {
            task_id: task_id.to_string(),
            task_type: "email".into(),
            queue: "APP_PRIORITY_NORMAL".into(),
            priority: 2,
            status: TaskStatus::Pending,
            created_at: Utc::now(),
            queued_at: None,
            process_at: None,
            started_at: None,
            completed_at: None,
            failed_at: None,
            error: None,
            retry_count: 0,
            metadata: serde_json::json!({}),
        }
    }

    #[tokio::test]
    async fn record_then_get_round_trips() {
        let recorder = InMemoryRecorder::new();
        recorder.record(sample("t1")).await;
        let record = recorder.get("t1").await.expect("should exist");
        assert_eq!(record.status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn update_status_sets_completed_at() {
        let recorder = InMemoryRecorder::new();
        recorder.record(sample("t1")).await;
        recorder.update_status("t1", TaskStatus::Completed, None).await;
        let record = recorder.get("t1").await.unwrap();
        assert_eq!(record.status, TaskStatus::Completed);
        assert!(record.completed_at.is_some());
    }

    #[tokio::test]
    async fn delete_removes_record() {
        let recorder = InMemoryRecorder::new();
        recorder.record(sample("t1")).await;
        recorder.delete("t1").await;
        assert!(recorder.get("t1").await.is_none());
    }

    #[tokio::test]
    async fn noop_recorder_never_blocks() {
        let recorder = NoopRecorder;
        recorder.record(sample("t1")).await;
        assert!(recorder.get("t1").await.is_none());
    }
}
