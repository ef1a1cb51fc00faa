//! Errors - エラー型と分類
//!
//! レイヤーごとに thiserror の enum を持ちます。
//! - `TaskError`: Task の組み立て時の検証エラー（副作用の前に弾く）
//! - `QueueError`: TaskQueue の操作エラー
//! - `RemoteError`: リモート実行の結果（Transient / Permanent / Unauthorized）
//! - `LocalStoreError` / `EventStreamError` / `StoreError`: 各 port のエラー
//! - `ReconcileError`, `MutationError`: app 層のエラー

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::ids::{OwnerId, TaskId};

/// Rejected before any state is touched.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    #[error("task has an empty target set")]
    EmptyTargetSet,

    #[error("task has an empty label id")]
    EmptyLabel,
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error(transparent)]
    Invalid(#[from] TaskError),

    #[error("unknown task: {0}")]
    UnknownTask(TaskId),

    #[error("dependency {0} is not known to this owner's queue")]
    UnknownDependency(TaskId),

    #[error("dependency {0} has already failed")]
    DependencyAlreadyFailed(TaskId),

    #[error("dependency cycle detected: {0:?}")]
    DependencyCycle(Vec<TaskId>),

    #[error("queue store error: {0}")]
    Storage(#[from] StoreError),

    /// The owner logged out; nothing is accepted until the next login.
    #[error("owner {0} is logged out")]
    Closed(OwnerId),

    #[error("queue manager is shut down")]
    ShutDown,
}

/// ErrorKind of a remote execution.
///
/// - Transient: 一時的なエラー（リトライ推奨、タイムアウトもここ）
/// - Permanent: 恒久的なエラー（エンティティが存在しない等、リトライ無意味）
/// - Unauthorized: 認証エラー（リトライ無意味）
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum RemoteError {
    #[error("transient remote failure: {0}")]
    Transient(String),

    #[error("permanent remote failure: {0}")]
    Permanent(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),
}

impl RemoteError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, RemoteError::Transient(_))
    }

    pub fn message(&self) -> &str {
        match self {
            RemoteError::Transient(m) | RemoteError::Permanent(m) | RemoteError::Unauthorized(m) => m,
        }
    }
}

/// Local projection write/read failure. Always distinct from remote errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LocalStoreError {
    #[error("local store unavailable: {0}")]
    Unavailable(String),

    #[error("local store write failed: {0}")]
    Write(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EventStreamError {
    #[error("event stream unavailable: {0}")]
    Unavailable(String),

    /// The server no longer knows the cursor; the caller restarts from scratch.
    #[error("event cursor expired for owner {0}")]
    CursorExpired(OwnerId),
}

/// Durable queue persistence failure.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("corrupt queue state for owner {owner}: {reason}")]
    Corrupt { owner: OwnerId, reason: String },
}

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    EventStream(#[from] EventStreamError),

    #[error(transparent)]
    Local(#[from] LocalStoreError),
}

/// Errors surfaced by the mutation facade.
#[derive(Debug, Error)]
pub enum MutationError {
    #[error(transparent)]
    Invalid(#[from] TaskError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    /// The task is durably queued and will still run remotely.
    #[error("task {task_id} was queued but the local apply failed: {source}")]
    LocalApply {
        task_id: TaskId,
        #[source]
        source: LocalStoreError,
    },

    #[error(transparent)]
    Reconcile(#[from] ReconcileError),
}

impl MutationError {
    /// `EmptyTargetSet`/`EmptyLabel` regardless of which layer caught it.
    pub fn task_error(&self) -> Option<&TaskError> {
        match self {
            MutationError::Invalid(e) | MutationError::Queue(QueueError::Invalid(e)) => Some(e),
            _ => None,
        }
    }
}
