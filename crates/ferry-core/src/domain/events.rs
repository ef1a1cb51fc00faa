//! Events - タスクのライフサイクルイベント
//!
//! QueueManager が broadcast で配信します。購読者がいなくても送信は失敗扱いにしません。

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::ids::{OwnerId, TaskId};
use super::state::{FailureReason, TerminalStatus};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TaskEvent {
    Enqueued {
        owner: OwnerId,
        task_id: TaskId,
    },
    Dispatched {
        owner: OwnerId,
        task_id: TaskId,
        attempt: u32,
    },
    Retrying {
        owner: OwnerId,
        task_id: TaskId,
        retry_count: u32,
        #[serde(with = "millis")]
        delay: Duration,
        error: String,
    },
    Succeeded {
        owner: OwnerId,
        task_id: TaskId,
    },
    Failed {
        owner: OwnerId,
        task_id: TaskId,
        reason: FailureReason,
    },
}

impl TaskEvent {
    pub fn terminal(owner: OwnerId, task_id: TaskId, status: &TerminalStatus) -> Self {
        match status {
            TerminalStatus::Succeeded => TaskEvent::Succeeded { owner, task_id },
            TerminalStatus::Failed(reason) => TaskEvent::Failed {
                owner,
                task_id,
                reason: reason.clone(),
            },
        }
    }

    pub fn task_id(&self) -> TaskId {
        match self {
            TaskEvent::Enqueued { task_id, .. }
            | TaskEvent::Dispatched { task_id, .. }
            | TaskEvent::Retrying { task_id, .. }
            | TaskEvent::Succeeded { task_id, .. }
            | TaskEvent::Failed { task_id, .. } => *task_id,
        }
    }

    pub fn owner(&self) -> &OwnerId {
        match self {
            TaskEvent::Enqueued { owner, .. }
            | TaskEvent::Dispatched { owner, .. }
            | TaskEvent::Retrying { owner, .. }
            | TaskEvent::Succeeded { owner, .. }
            | TaskEvent::Failed { owner, .. } => owner,
        }
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
