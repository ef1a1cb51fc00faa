//! Task record: task + retry bookkeeping, and the persisted per-owner layout.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{Task, TaskId, TaskStatus, TerminalStatus};

/// Metadata + task for one entry in an owner's queue.
///
/// Design:
/// - This is the "single source of truth" for task state.
/// - The pending order holds TaskId only.
/// - All state transitions happen here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task: Task,
    pub status: TaskStatus,

    /// Number of times this task has been sent back for a retry.
    pub retry_count: u32,

    /// Not eligible for dispatch before this instant (retry backoff).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_before: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl TaskRecord {
    pub fn new(task: Task) -> Self {
        Self {
            task,
            status: TaskStatus::Pending,
            retry_count: 0,
            not_before: None,
            last_error: None,
        }
    }

    pub fn id(&self) -> TaskId {
        self.task.id()
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.not_before.is_none_or(|t| t <= now)
    }

    pub fn start(&mut self) {
        self.status = TaskStatus::InFlight;
    }

    /// Back to Pending after a transient failure.
    pub fn schedule_retry(&mut self, not_before: DateTime<Utc>, error: String) {
        self.status = TaskStatus::Pending;
        self.retry_count += 1;
        self.not_before = Some(not_before);
        self.last_error = Some(error);
    }

    pub fn finish(&mut self, status: TerminalStatus) {
        self.status = status.into();
        self.not_before = None;
    }

    /// Process died mid-call: the call may or may not have reached the server.
    pub fn reset_in_flight(&mut self) {
        if self.status == TaskStatus::InFlight {
            self.status = TaskStatus::Pending;
        }
    }
}

/// What [`crate::ports::QueueStore`] persists for one owner.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSnapshot {
    /// Next sequence number to hand out.
    pub next_seq: u64,

    /// Pending records in dispatch order (the in-flight one included).
    pub pending: Vec<TaskRecord>,

    /// Recently finished records, oldest first.
    #[serde(default)]
    pub terminal: Vec<TaskRecord>,
}
