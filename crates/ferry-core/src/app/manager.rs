//! QueueManager - owner ごとの配送（dispatch）とリトライ
//!
//! # フロー
//! 1. submit/完了/backoff 明けのタイマーが owner の lane を kick する（ポーリングしない）
//! 2. kick された lane は dequeue_next → RemoteExecutor::execute → on_task_completion を
//!    取り出せるタスクがなくなるまで繰り返す
//! 3. 完了後に Reconciler でローカル状態を正本に寄せてから ticket / イベントで通知する
//!
//! # 不変条件
//! - owner ごとに実行中は最大 1 つ（TaskQueue 側の in_flight で保証）
//! - owner 同士は完全に並行
//! - 各タスクの完了通知（TaskTicket）はちょうど 1 回

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, oneshot, watch};

use crate::domain::{
    EntityId, FailureReason, LabelId, OwnerId, QueueError, RemoteError, Task, TaskEvent, TaskId,
    TaskRequest, TerminalStatus,
};
use crate::ports::RemoteExecutor;
use crate::queue::{Finished, QueueCounts, RetryDecision, RetryPolicy, TaskQueue};

use super::reconciler::Reconciler;

const EVENT_CAPACITY: usize = 256;

/// Completion handle for one submitted task.
#[derive(Debug)]
pub struct TaskTicket {
    task: Task,
    rx: oneshot::Receiver<TerminalStatus>,
}

impl TaskTicket {
    pub fn task_id(&self) -> TaskId {
        self.task.id()
    }

    pub fn task(&self) -> &Task {
        &self.task
    }

    /// Resolves once the task is terminal. `None` if the manager was shut down
    /// (or dropped) first.
    pub async fn wait(self) -> Option<TerminalStatus> {
        self.rx.await.ok()
    }
}

#[derive(Clone)]
pub struct QueueManager {
    inner: Arc<Inner>,
}

struct Inner {
    queue: Arc<TaskQueue>,
    remote: Arc<dyn RemoteExecutor>,
    reconciler: Arc<Reconciler>,
    policy: RetryPolicy,
    online: AtomicBool,
    waiters: Mutex<HashMap<TaskId, oneshot::Sender<TerminalStatus>>>,
    events: broadcast::Sender<TaskEvent>,
    /// Owners to drain when connectivity comes back.
    owners: Mutex<HashSet<OwnerId>>,
    /// Logged-out owners.
    closed: Mutex<HashSet<OwnerId>>,
    /// Earliest armed backoff timer per owner.
    timers: Mutex<HashMap<OwnerId, DateTime<Utc>>>,
    shutdown: watch::Sender<bool>,
}

impl QueueManager {
    pub fn new(
        queue: Arc<TaskQueue>,
        remote: Arc<dyn RemoteExecutor>,
        reconciler: Arc<Reconciler>,
        policy: RetryPolicy,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                queue,
                remote,
                reconciler,
                policy,
                online: AtomicBool::new(true),
                waiters: Mutex::new(HashMap::new()),
                events,
                owners: Mutex::new(HashSet::new()),
                closed: Mutex::new(HashSet::new()),
                timers: Mutex::new(HashMap::new()),
                shutdown,
            }),
        }
    }

    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.inner.queue
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.inner.policy
    }

    /// Durably enqueues the task and kicks the owner's lane.
    pub async fn submit(&self, request: TaskRequest) -> Result<TaskTicket, QueueError> {
        if self.is_shut_down() {
            return Err(QueueError::ShutDown);
        }
        let owner = request.owner().clone();
        if self.is_closed(&owner) {
            return Err(QueueError::Closed(owner));
        }

        let (tx, rx) = oneshot::channel();
        let inner = &self.inner;
        // waiter は lane のロック中に登録する（dispatch より先に）
        let task = self
            .inner
            .queue
            .enqueue_with(request, move |task| {
                let mut waiters = lock(&inner.waiters);
                if !*inner.shutdown.borrow() {
                    waiters.insert(task.id(), tx);
                }
            })
            .await?;

        self.emit(TaskEvent::Enqueued {
            owner: owner.clone(),
            task_id: task.id(),
        });
        lock(&self.inner.owners).insert(owner.clone());
        self.kick(&owner);
        Ok(TaskTicket { task, rx })
    }

    /// Starts draining the owner's lane in the background. No-op while offline.
    pub fn kick(&self, owner: &OwnerId) {
        if !self.is_online() || self.is_shut_down() {
            return;
        }
        let this = self.clone();
        let owner = owner.clone();
        tokio::spawn(async move {
            this.drain(&owner).await;
        });
    }

    /// Applies the remote result of a dispatched task.
    ///
    /// - success: `Succeeded`, then refresh from the event stream
    /// - transient: back to the tail with backoff, or `Failed` once retries are exhausted
    /// - permanent / unauthorized: `Failed` right away, then a full reconciliation
    ///
    /// If the owner logged out while the call was in flight, the result is recorded
    /// but nothing is retried or reconciled: a retryable failure becomes
    /// `Failed(Cancelled)`.
    pub async fn on_task_completion(&self, task_id: TaskId, result: Result<(), RemoteError>) {
        let Some(record) = self.inner.queue.record(task_id).await else {
            tracing::warn!(task_id = %task_id, "completion for unknown task ignored");
            return;
        };
        let task = record.task;
        let owner = task.owner().clone();

        if self.is_closed(&owner) {
            let status = match &result {
                Ok(()) => TerminalStatus::Succeeded,
                Err(error) if error.is_retryable() => TerminalStatus::Failed(FailureReason::Cancelled),
                Err(error) => TerminalStatus::Failed(FailureReason::from_remote(error)),
            };
            match self.inner.queue.mark_terminal(task_id, status).await {
                Ok(finished) => {
                    tracing::info!(%owner, task_id = %task_id, ?result, "in-flight task finished after logout");
                    self.settle(&finished);
                }
                Err(e) => log_queue_error(&owner, task_id, &e),
            }
            return;
        }

        let error = match result {
            Ok(()) => {
                let finished = match self
                    .inner
                    .queue
                    .mark_terminal(task_id, TerminalStatus::Succeeded)
                    .await
                {
                    Ok(finished) => finished,
                    Err(e) => return log_queue_error(&owner, task_id, &e),
                };
                tracing::info!(%owner, task_id = %task_id, kind = %task.kind(), "task succeeded");
                self.refresh_after_success(&task).await;
                self.settle(&finished);
                return;
            }
            Err(error) => error,
        };

        if error.is_retryable()
            && let RetryDecision::Retry { delay } = self.inner.policy.decide(record.retry_count)
        {
            let now = self.inner.queue.clock().now();
            let not_before = now + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());
            match self
                .inner
                .queue
                .requeue_for_retry(task_id, not_before, error.message())
                .await
            {
                Ok(retry_count) => {
                    tracing::warn!(
                        %owner,
                        task_id = %task_id,
                        retry_count,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %error,
                        "transient failure, retrying"
                    );
                    self.emit(TaskEvent::Retrying {
                        owner: owner.clone(),
                        task_id,
                        retry_count,
                        delay,
                        error: error.message().to_owned(),
                    });
                    self.arm_at(&owner, not_before);
                }
                Err(e) => log_queue_error(&owner, task_id, &e),
            }
            return;
        }

        let reason = FailureReason::from_remote(&error);
        match self
            .inner
            .queue
            .mark_terminal(task_id, TerminalStatus::Failed(reason))
            .await
        {
            Ok(finished) => {
                tracing::error!(
                    %owner,
                    task_id = %task_id,
                    kind = %task.kind(),
                    retries = record.retry_count,
                    error = %error,
                    cascaded = finished.len().saturating_sub(1),
                    "task failed"
                );
                self.reconcile_after_failure(&owner, &finished).await;
                self.settle(&finished);
            }
            Err(e) => log_queue_error(&owner, task_id, &e),
        }
    }

    /// Loads the owner's persisted queue and starts draining it.
    pub async fn resume(&self, owner: &OwnerId) -> Result<QueueCounts, QueueError> {
        lock(&self.inner.closed).remove(owner);
        let counts = self.inner.queue.restore(owner).await?;
        lock(&self.inner.owners).insert(owner.clone());
        tracing::info!(%owner, pending = counts.pending, "owner resumed");
        self.kick(owner);
        Ok(counts)
    }

    /// Cancels every not-yet-dispatched task of the owner. Their tickets resolve
    /// as `Failed(Cancelled)`.
    pub async fn cancel_all(&self, owner: &OwnerId) -> Result<Vec<TaskId>, QueueError> {
        let cancelled = self.inner.queue.cancel_all(owner).await?;
        self.settle(&cancelled);
        Ok(cancelled.iter().map(|f| f.task.id()).collect())
    }

    /// Stops accepting tasks for the owner and cancels what is pending.
    pub async fn close(&self, owner: &OwnerId) -> Result<Vec<TaskId>, QueueError> {
        lock(&self.inner.closed).insert(owner.clone());
        lock(&self.inner.owners).remove(owner);
        self.cancel_all(owner).await
    }

    /// Offline: nothing is dispatched, tasks keep accumulating durably.
    /// Back online: every known owner is drained.
    pub fn set_online(&self, online: bool) {
        let was = self.inner.online.swap(online, Ordering::SeqCst);
        if was == online {
            return;
        }
        tracing::info!(online, "connectivity changed");
        if online {
            let owners: Vec<OwnerId> = lock(&self.inner.owners).iter().cloned().collect();
            for owner in owners {
                self.kick(&owner);
            }
        }
    }

    pub fn is_online(&self) -> bool {
        self.inner.online.load(Ordering::SeqCst)
    }

    /// Stops all dispatching and backoff timers. An in-flight call still completes.
    ///
    /// Every outstanding ticket resolves to `None`; the tasks stay persisted.
    pub fn shutdown(&self) {
        let dropped = {
            let mut waiters = lock(&self.inner.waiters);
            self.inner.shutdown.send_replace(true);
            let dropped = waiters.len();
            waiters.clear();
            dropped
        };
        tracing::info!(dropped_tickets = dropped, "queue manager shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        *self.inner.shutdown.borrow()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.inner.events.subscribe()
    }

    pub fn owners(&self) -> Vec<OwnerId> {
        let mut owners: Vec<OwnerId> = lock(&self.inner.owners).iter().cloned().collect();
        owners.sort();
        owners
    }

    fn is_closed(&self, owner: &OwnerId) -> bool {
        lock(&self.inner.closed).contains(owner)
    }

    async fn drain(&self, owner: &OwnerId) {
        loop {
            if !self.is_online() || self.is_shut_down() || self.is_closed(owner) {
                return;
            }
            let task = match self.inner.queue.dequeue_next(owner).await {
                Ok(Some(task)) => task,
                Ok(None) => {
                    self.arm_wakeup(owner).await;
                    return;
                }
                Err(e) => {
                    tracing::error!(%owner, error = %e, "dequeue failed");
                    return;
                }
            };

            let attempt = self
                .inner
                .queue
                .record(task.id())
                .await
                .map_or(1, |r| r.retry_count + 1);
            tracing::debug!(%owner, task_id = %task.id(), kind = %task.kind(), attempt, "dispatching");
            self.emit(TaskEvent::Dispatched {
                owner: owner.clone(),
                task_id: task.id(),
                attempt,
            });

            let result = self.inner.remote.execute(&task).await;
            self.on_task_completion(task.id(), result).await;
        }
    }

    async fn arm_wakeup(&self, owner: &OwnerId) {
        match self.inner.queue.next_wakeup(owner).await {
            Ok(Some(at)) => self.arm_at(owner, at),
            Ok(None) => {}
            Err(e) => tracing::warn!(%owner, error = %e, "could not read backoff deadline"),
        }
    }

    /// One-shot timer that kicks the owner at `at`.
    fn arm_at(&self, owner: &OwnerId, at: DateTime<Utc>) {
        {
            let mut timers = lock(&self.inner.timers);
            if let Some(existing) = timers.get(owner)
                && *existing <= at
            {
                return;
            }
            timers.insert(owner.clone(), at);
        }

        let now = self.inner.queue.clock().now();
        let delay = (at - now)
            .to_std()
            .unwrap_or(Duration::ZERO)
            .max(Duration::from_millis(1));
        let this = self.clone();
        let owner = owner.clone();
        let mut shutdown = self.inner.shutdown.subscribe();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => return,
            }
            {
                let mut timers = lock(&this.inner.timers);
                if timers.get(&owner) == Some(&at) {
                    timers.remove(&owner);
                }
            }
            this.kick(&owner);
        });
    }

    /// Resolves tickets and broadcasts terminal events.
    fn settle(&self, finished: &[Finished]) {
        for f in finished {
            let task_id = f.task.id();
            if let Some(tx) = lock(&self.inner.waiters).remove(&task_id) {
                // 受け手が ticket を捨てていても問題ない
                let _ = tx.send(f.status.clone());
            }
            if let TerminalStatus::Failed(FailureReason::DependencyFailed(dep)) = &f.status {
                tracing::warn!(owner = %f.task.owner(), task_id = %task_id, dependency = %dep, "dependency failed");
            }
            self.emit(TaskEvent::terminal(f.task.owner().clone(), task_id, &f.status));
        }
    }

    async fn refresh_after_success(&self, task: &Task) {
        let owner = task.owner();
        let labels = task.kind().affected_labels();
        match self.inner.reconciler.refresh(owner, &labels).await {
            Ok(report) if report.cursor_reset => {
                let targets: Vec<EntityId> = task.targets().iter().cloned().collect();
                if let Err(e) = self.inner.reconciler.reconcile_targets(owner, &targets).await {
                    tracing::warn!(%owner, task_id = %task.id(), error = %e, "target reconciliation failed");
                }
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(%owner, task_id = %task.id(), error = %e, "refresh failed"),
        }
    }

    /// The optimistic writes of every failed task (cascades included) are now wrong.
    async fn reconcile_after_failure(&self, owner: &OwnerId, finished: &[Finished]) {
        let labels: BTreeSet<LabelId> = finished
            .iter()
            .flat_map(|f| f.task.kind().affected_labels())
            .collect();
        let targets: BTreeSet<EntityId> = finished
            .iter()
            .flat_map(|f| f.task.targets().iter().cloned())
            .collect();
        let labels: Vec<LabelId> = labels.into_iter().collect();
        let targets: Vec<EntityId> = targets.into_iter().collect();

        if let Err(e) = self.inner.reconciler.refresh(owner, &labels).await {
            tracing::warn!(%owner, error = %e, "refresh after failure failed");
        }
        if let Err(e) = self.inner.reconciler.reconcile_targets(owner, &targets).await {
            tracing::warn!(%owner, error = %e, "target reconciliation after failure failed");
        }
    }

    fn emit(&self, event: TaskEvent) {
        // 購読者がいなくてもエラーにしない
        let _ = self.inner.events.send(event);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn log_queue_error(owner: &OwnerId, task_id: TaskId, error: &QueueError) {
    match error {
        QueueError::UnknownTask(_) => {
            tracing::warn!(%owner, task_id = %task_id, "task already settled");
        }
        // 永続化に失敗したタスクは InFlight のまま残り、再起動時に Pending に戻る
        other => tracing::error!(%owner, task_id = %task_id, error = %other, "queue update failed"),
    }
}
