//! State - タスクの状態
//!
//! # 状態遷移
//! - pending: 依存待ち / backoff 待ち / 実行待ち
//! - in_flight: リモート実行中（owner ごとに最大 1 つ）
//! - succeeded: 成功（終端）
//! - failed: 失敗（終端、理由付き）
//!
//! ```text
//! Pending -> InFlight -> Succeeded
//!    ^          |
//!    +----------+ (Transient, retry_count < max)
//!               |
//!               +-> Failed(reason)
//! ```

use serde::{Deserialize, Serialize};

use super::errors::RemoteError;
use super::ids::TaskId;

/// Why a task reached `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum FailureReason {
    /// Retries exhausted; carries the last transient message.
    Transient(String),
    Permanent(String),
    Unauthorized(String),
    /// A dependency failed, so this task can never run.
    DependencyFailed(TaskId),
    /// Removed by `cancel_all` before it was dispatched, or a retry dropped
    /// because the owner logged out while the call was in flight.
    Cancelled,
}

impl FailureReason {
    pub fn from_remote(error: &RemoteError) -> Self {
        match error {
            RemoteError::Transient(m) => FailureReason::Transient(m.clone()),
            RemoteError::Permanent(m) => FailureReason::Permanent(m.clone()),
            RemoteError::Unauthorized(m) => FailureReason::Unauthorized(m.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InFlight,
    Succeeded,
    Failed(FailureReason),
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Succeeded | TaskStatus::Failed(_))
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, TaskStatus::Failed(_))
    }
}

/// The two statuses `mark_terminal` accepts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum TerminalStatus {
    Succeeded,
    Failed(FailureReason),
}

impl From<TerminalStatus> for TaskStatus {
    fn from(status: TerminalStatus) -> Self {
        match status {
            TerminalStatus::Succeeded => TaskStatus::Succeeded,
            TerminalStatus::Failed(reason) => TaskStatus::Failed(reason),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses_are_terminal() {
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::InFlight.is_terminal());
        assert!(TaskStatus::from(TerminalStatus::Succeeded).is_terminal());

        let failed = TaskStatus::from(TerminalStatus::Failed(FailureReason::Cancelled));
        assert!(failed.is_terminal());
        assert!(failed.is_failed());
    }

    #[test]
    fn remote_errors_map_to_failure_reasons() {
        let reason = FailureReason::from_remote(&RemoteError::Unauthorized("token".into()));
        assert_eq!(reason, FailureReason::Unauthorized("token".into()));
    }

    #[test]
    fn status_round_trips_through_json() {
        let status = TaskStatus::Failed(FailureReason::Permanent("not found".into()));
        let json = serde_json::to_string(&status).unwrap();
        let back: TaskStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(back, status);
    }
}
