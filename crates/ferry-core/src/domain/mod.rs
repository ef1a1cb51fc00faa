//! Domain model (IDs, tasks, statuses, snapshots, events, errors).

pub mod errors;
pub mod events;
pub mod ids;
pub mod snapshot;
pub mod state;
pub mod task;

pub use errors::{
    EventStreamError, LocalStoreError, MutationError, QueueError, ReconcileError, RemoteError,
    StoreError, TaskError,
};
pub use events::TaskEvent;
pub use ids::{EntityId, LabelId, OwnerId, TaskId};
pub use snapshot::{EntityChange, EntitySnapshot, EventBatch, EventCursor};
pub use state::{FailureReason, TaskStatus, TerminalStatus};
pub use task::{Task, TaskKind, TaskRequest};
