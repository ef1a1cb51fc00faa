//! Queue module: durable per-owner task queue with dependency tracking and retry state.
//!
//! Design:
//! - One lane per owner, each behind its own async mutex (owners never contend).
//! - Every mutation is committed by: clone lane -> mutate -> `QueueStore::save` -> swap.
//!   A failed save leaves the in-memory lane untouched.
//! - Lanes are loaded from the store on first use, so a restart resumes where it stopped.

mod dependency;
mod record;
mod retry;
mod state;

pub use dependency::DependencyGraph;
pub use record::{QueueSnapshot, TaskRecord};
pub use retry::{RetryDecision, RetryPolicy};
pub use state::{DEFAULT_HISTORY_LIMIT, Finished, QueueCounts};

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex as AsyncMutex, OwnedMappedMutexGuard, OwnedMutexGuard};

use crate::domain::{OwnerId, QueueError, Task, TaskId, TaskRequest, TaskStatus, TerminalStatus};
use crate::ports::{Clock, IdGenerator, QueueStore};
use state::OwnerQueue;

/// `None` until the owner's persisted state has been loaded.
type Lane = Arc<AsyncMutex<Option<OwnerQueue>>>;
type LaneGuard = OwnedMappedMutexGuard<Option<OwnerQueue>, OwnerQueue>;

pub struct TaskQueue {
    store: Arc<dyn QueueStore>,
    ids: Arc<dyn IdGenerator>,
    clock: Arc<dyn Clock>,
    history_limit: usize,
    lanes: Mutex<HashMap<OwnerId, Lane>>,
    /// TaskId -> owner, for operations addressed by task id only.
    index: Mutex<HashMap<TaskId, OwnerId>>,
}

impl TaskQueue {
    pub fn new(
        store: Arc<dyn QueueStore>,
        ids: Arc<dyn IdGenerator>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            ids,
            clock,
            history_limit: DEFAULT_HISTORY_LIMIT,
            lanes: Mutex::new(HashMap::new()),
            index: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_history_limit(mut self, history_limit: usize) -> Self {
        self.history_limit = history_limit;
        self
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Validates, persists and appends a task. Returns its id.
    pub async fn enqueue(&self, request: TaskRequest) -> Result<TaskId, QueueError> {
        self.enqueue_with(request, |_| {}).await.map(|task| task.id())
    }

    /// Like [`TaskQueue::enqueue`], but runs `on_enqueued` while the owner lane
    /// is still locked, i.e. before the task can possibly be dequeued.
    pub async fn enqueue_with<F>(
        &self,
        request: TaskRequest,
        on_enqueued: F,
    ) -> Result<Task, QueueError>
    where
        F: FnOnce(&Task) + Send,
    {
        let owner = request.owner().clone();
        let mut guard = self.lock_lane(&owner).await?;
        let lane = &mut *guard;

        let mut next = lane.clone();
        let id = self.ids.generate_task_id();
        let task = next.insert(id, request, self.clock.now())?;
        self.commit(&owner, lane, next).await?;

        self.index_lock().insert(id, owner.clone());
        tracing::debug!(%owner, task_id = %id, kind = %task.kind(), "task enqueued");
        on_enqueued(&task);
        Ok(task)
    }

    /// Marks the next eligible task `InFlight` and returns it.
    ///
    /// `None` when something is already in flight for the owner, or when every
    /// pending task waits on a dependency or a retry backoff.
    pub async fn dequeue_next(&self, owner: &OwnerId) -> Result<Option<Task>, QueueError> {
        let mut guard = self.lock_lane(owner).await?;
        let lane = &mut *guard;

        let Some(id) = lane.next_eligible(self.clock.now()) else {
            return Ok(None);
        };
        let mut next = lane.clone();
        let task = next.start(id)?;
        self.commit(owner, lane, next).await?;
        Ok(Some(task))
    }

    /// Transitions a pending task to `Succeeded`/`Failed`.
    ///
    /// The returned list starts with `task_id` itself, followed by the dependents
    /// that failed along with it.
    pub async fn mark_terminal(
        &self,
        task_id: TaskId,
        status: TerminalStatus,
    ) -> Result<Vec<Finished>, QueueError> {
        let owner = self.owner_of(task_id)?;
        let mut guard = self.lock_lane(&owner).await?;
        let lane = &mut *guard;

        let mut next = lane.clone();
        let finished = next.finish(task_id, status)?;
        self.commit(&owner, lane, next).await?;
        Ok(finished)
    }

    /// Sends the task back to the tail of its owner's sequence, not eligible
    /// before `not_before`. Returns the new retry count.
    pub async fn requeue_for_retry(
        &self,
        task_id: TaskId,
        not_before: DateTime<Utc>,
        error: impl Into<String>,
    ) -> Result<u32, QueueError> {
        let owner = self.owner_of(task_id)?;
        let mut guard = self.lock_lane(&owner).await?;
        let lane = &mut *guard;

        let mut next = lane.clone();
        let retry_count = next.requeue(task_id, not_before, error.into())?;
        self.commit(&owner, lane, next).await?;
        Ok(retry_count)
    }

    /// Removes every pending task that is not in flight. Local optimistic state
    /// is left as it is.
    pub async fn cancel_all(&self, owner: &OwnerId) -> Result<Vec<Finished>, QueueError> {
        let mut guard = self.lock_lane(owner).await?;
        let lane = &mut *guard;

        let mut next = lane.clone();
        let cancelled = next.cancel_all();
        if cancelled.is_empty() {
            return Ok(cancelled);
        }
        self.commit(owner, lane, next).await?;
        tracing::info!(%owner, cancelled = cancelled.len(), "pending tasks cancelled");
        Ok(cancelled)
    }

    /// Loads the owner's persisted state (no-op when already loaded in this process).
    ///
    /// A task persisted as `InFlight` comes back as `Pending` and will run again.
    pub async fn restore(&self, owner: &OwnerId) -> Result<QueueCounts, QueueError> {
        Ok(self.lock_lane(owner).await?.counts())
    }

    /// Owners with persisted state, e.g. to restore all of them at startup.
    pub async fn persisted_owners(&self) -> Result<Vec<OwnerId>, QueueError> {
        Ok(self.store.owners().await?)
    }

    pub async fn pending(&self, owner: &OwnerId) -> Result<Vec<Task>, QueueError> {
        Ok(self.lock_lane(owner).await?.pending())
    }

    pub async fn counts(&self, owner: &OwnerId) -> Result<QueueCounts, QueueError> {
        Ok(self.lock_lane(owner).await?.counts())
    }

    pub async fn status(&self, task_id: TaskId) -> Option<TaskStatus> {
        self.record(task_id).await.map(|r| r.status)
    }

    /// The full record of a pending or recently finished task.
    pub async fn record(&self, task_id: TaskId) -> Option<TaskRecord> {
        let owner = self.owner_of(task_id).ok()?;
        let lane = self.lock_lane(&owner).await.ok()?;
        lane.record(task_id).cloned()
    }

    /// When the earliest backoff of a runnable task expires.
    pub async fn next_wakeup(&self, owner: &OwnerId) -> Result<Option<DateTime<Utc>>, QueueError> {
        Ok(self.lock_lane(owner).await?.next_wakeup())
    }

    async fn commit(
        &self,
        owner: &OwnerId,
        lane: &mut OwnerQueue,
        mut next: OwnerQueue,
    ) -> Result<(), QueueError> {
        self.store.save(owner, &next.snapshot()).await?;
        let evicted = next.drain_evicted();
        *lane = next;
        if !evicted.is_empty() {
            let mut index = self.index_lock();
            for id in evicted {
                index.remove(&id);
            }
        }
        Ok(())
    }

    /// Locks the owner lane, loading it from the store on first use.
    async fn lock_lane(&self, owner: &OwnerId) -> Result<LaneGuard, QueueError> {
        let lane = {
            let mut lanes = self.lanes.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(lanes.entry(owner.clone()).or_default())
        };
        let mut guard = lane.lock_owned().await;
        if guard.is_none() {
            let lane = match self.store.load(owner).await? {
                Some(snapshot) => {
                    let lane = OwnerQueue::restore(owner.clone(), snapshot, self.history_limit)?;
                    let counts = lane.counts();
                    tracing::info!(
                        %owner,
                        pending = counts.pending,
                        history = counts.succeeded + counts.failed,
                        "queue restored"
                    );
                    lane
                }
                None => OwnerQueue::new(owner.clone(), self.history_limit),
            };
            {
                let mut index = self.index_lock();
                for id in lane.task_ids() {
                    index.insert(id, owner.clone());
                }
            }
            *guard = Some(lane);
        }
        let history_limit = self.history_limit;
        let owner = owner.clone();
        Ok(OwnedMutexGuard::map(guard, move |slot| {
            slot.get_or_insert_with(|| OwnerQueue::new(owner, history_limit))
        }))
    }

    fn owner_of(&self, task_id: TaskId) -> Result<OwnerId, QueueError> {
        self.index_lock()
            .get(&task_id)
            .cloned()
            .ok_or(QueueError::UnknownTask(task_id))
    }

    fn index_lock(&self) -> std::sync::MutexGuard<'_, HashMap<TaskId, OwnerId>> {
        self.index.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{EntityId, FailureReason, LabelId, StoreError, TaskError, TaskKind};
    use crate::impls::InMemoryQueueStore;
    use crate::ports::{FixedClock, SystemClock, UlidGenerator};
    use async_trait::async_trait;
    use chrono::{Duration, TimeZone};

    fn owner() -> OwnerId {
        OwnerId::new("alice")
    }

    fn label(target: &str) -> TaskRequest {
        TaskRequest::new(
            owner(),
            TaskKind::Label {
                label: LabelId::new("starred"),
            },
            [EntityId::new(target)],
        )
        .unwrap()
    }

    fn queue_with(store: Arc<dyn QueueStore>, clock: Arc<dyn Clock>) -> TaskQueue {
        TaskQueue::new(store, Arc::new(UlidGenerator::new(Arc::clone(&clock))), clock)
    }

    fn queue() -> (TaskQueue, Arc<InMemoryQueueStore>) {
        let store = Arc::new(InMemoryQueueStore::new());
        (queue_with(store.clone(), Arc::new(SystemClock)), store)
    }

    #[tokio::test]
    async fn enqueue_persists_before_returning() {
        let (q, store) = queue();
        let id = q.enqueue(label("c1")).await.unwrap();

        let snapshot = store.load(&owner()).await.unwrap().unwrap();
        assert_eq!(snapshot.pending.len(), 1);
        assert_eq!(snapshot.pending[0].task.id(), id);
        assert_eq!(q.status(id).await, Some(TaskStatus::Pending));
    }

    #[tokio::test]
    async fn invalid_request_never_reaches_the_queue() {
        let (q, store) = queue();
        let err = TaskRequest::new(owner(), TaskKind::MarkRead, Vec::<EntityId>::new()).unwrap_err();
        assert_eq!(err, TaskError::EmptyTargetSet);
        assert!(store.load(&owner()).await.unwrap().is_none());
        assert!(q.pending(&owner()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn one_in_flight_per_owner() {
        let (q, _) = queue();
        let a = q.enqueue(label("c1")).await.unwrap();
        q.enqueue(label("c2")).await.unwrap();

        let first = q.dequeue_next(&owner()).await.unwrap().unwrap();
        assert_eq!(first.id(), a);
        assert!(q.dequeue_next(&owner()).await.unwrap().is_none());

        // 他の owner は独立
        let bob = OwnerId::new("bob");
        let request = TaskRequest::new(bob.clone(), TaskKind::MarkRead, [EntityId::new("x")]).unwrap();
        q.enqueue(request).await.unwrap();
        assert!(q.dequeue_next(&bob).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn mark_terminal_twice_is_unknown_task() {
        let (q, _) = queue();
        let a = q.enqueue(label("c1")).await.unwrap();
        q.dequeue_next(&owner()).await.unwrap();

        let finished = q.mark_terminal(a, TerminalStatus::Succeeded).await.unwrap();
        assert_eq!(finished.len(), 1);
        let before = q.counts(&owner()).await.unwrap();

        let err = q.mark_terminal(a, TerminalStatus::Succeeded).await.unwrap_err();
        assert!(matches!(err, QueueError::UnknownTask(id) if id == a));
        assert_eq!(q.counts(&owner()).await.unwrap(), before);
    }

    #[tokio::test]
    async fn unknown_task_id() {
        let (q, _) = queue();
        let id = TaskId::from_ulid(ulid::Ulid::new());
        let err = q.mark_terminal(id, TerminalStatus::Succeeded).await.unwrap_err();
        assert!(matches!(err, QueueError::UnknownTask(_)));
        assert!(q.status(id).await.is_none());
    }

    #[tokio::test]
    async fn retry_backoff_follows_the_clock() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let clock = Arc::new(FixedClock::new(start));
        let q = queue_with(Arc::new(InMemoryQueueStore::new()), clock.clone());

        let a = q.enqueue(label("c1")).await.unwrap();
        q.dequeue_next(&owner()).await.unwrap();
        let retry_at = start + Duration::seconds(2);
        assert_eq!(q.requeue_for_retry(a, retry_at, "timeout").await.unwrap(), 1);

        assert!(q.dequeue_next(&owner()).await.unwrap().is_none());
        assert_eq!(q.next_wakeup(&owner()).await.unwrap(), Some(retry_at));

        clock.advance(Duration::seconds(2));
        let task = q.dequeue_next(&owner()).await.unwrap().unwrap();
        assert_eq!(task.id(), a);
        let record = q.record(a).await.unwrap();
        assert_eq!(record.retry_count, 1);
        assert_eq!(record.last_error.as_deref(), Some("timeout"));
    }

    #[tokio::test]
    async fn restart_restores_pending_and_resets_in_flight() {
        let store = Arc::new(InMemoryQueueStore::new());
        let q = queue_with(store.clone(), Arc::new(SystemClock));
        let done = q.enqueue(label("c1")).await.unwrap();
        q.dequeue_next(&owner()).await.unwrap();
        q.mark_terminal(done, TerminalStatus::Succeeded).await.unwrap();
        let crashed = q.enqueue(label("c2")).await.unwrap();
        let waiting = q.enqueue(label("c3")).await.unwrap();
        q.dequeue_next(&owner()).await.unwrap();
        drop(q);

        let q = queue_with(store, Arc::new(SystemClock));
        let counts = q.restore(&owner()).await.unwrap();
        assert_eq!(counts.pending, 2);
        assert_eq!(counts.succeeded, 1);
        assert_eq!(q.status(done).await, Some(TaskStatus::Succeeded));

        let next = q.dequeue_next(&owner()).await.unwrap().unwrap();
        assert_eq!(next.id(), crashed);
        q.mark_terminal(crashed, TerminalStatus::Succeeded).await.unwrap();
        assert_eq!(q.dequeue_next(&owner()).await.unwrap().unwrap().id(), waiting);

        // succeeded な依存先は再起動後も参照できる
        q.enqueue(label("c4").depends_on(done)).await.unwrap();
    }

    #[tokio::test]
    async fn cancel_all_leaves_in_flight_running() {
        let (q, _) = queue();
        let a = q.enqueue(label("c1")).await.unwrap();
        let b = q.enqueue(label("c2")).await.unwrap();
        q.dequeue_next(&owner()).await.unwrap();

        let cancelled = q.cancel_all(&owner()).await.unwrap();
        assert_eq!(cancelled.len(), 1);
        assert_eq!(cancelled[0].task.id(), b);
        assert_eq!(
            q.status(b).await,
            Some(TaskStatus::Failed(FailureReason::Cancelled))
        );

        q.mark_terminal(a, TerminalStatus::Succeeded).await.unwrap();
        assert!(q.pending(&owner()).await.unwrap().is_empty());
    }

    struct BrokenStore;

    #[async_trait]
    impl QueueStore for BrokenStore {
        async fn load(&self, _owner: &OwnerId) -> Result<Option<QueueSnapshot>, StoreError> {
            Ok(None)
        }

        async fn save(&self, _owner: &OwnerId, _snapshot: &QueueSnapshot) -> Result<(), StoreError> {
            Err(StoreError::Io(std::io::Error::other("disk full")))
        }

        async fn owners(&self) -> Result<Vec<OwnerId>, StoreError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn failed_save_leaves_queue_unchanged() {
        let q = queue_with(Arc::new(BrokenStore), Arc::new(SystemClock));
        let err = q.enqueue(label("c1")).await.unwrap_err();
        assert!(matches!(err, QueueError::Storage(_)));
        assert!(q.pending(&owner()).await.unwrap().is_empty());
    }
}
