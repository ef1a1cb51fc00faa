//! Per-owner queue state (one lane).
//!
//! 副作用なしの純粋な状態機械。永続化とロックは `TaskQueue` 側が担当します。
//!
//! Invariants:
//! - `order` and `records` hold exactly the same ids
//! - at most one record is `InFlight`, and `in_flight` names it
//! - `graph` only has edges between pending tasks

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::dependency::DependencyGraph;
use super::record::{QueueSnapshot, TaskRecord};
use crate::domain::{
    FailureReason, OwnerId, QueueError, StoreError, Task, TaskId, TaskRequest, TaskStatus,
    TerminalStatus,
};

/// How many finished tasks an owner remembers (for `status` and dependency checks).
pub const DEFAULT_HISTORY_LIMIT: usize = 512;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub pending: usize,
    pub in_flight: usize,
    pub succeeded: usize,
    pub failed: usize,
}

/// A task that reached a terminal state, possibly as a cascade of another failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finished {
    pub task: Task,
    pub status: TerminalStatus,
}

#[derive(Debug, Clone)]
pub(crate) struct OwnerQueue {
    owner: OwnerId,
    order: VecDeque<TaskId>,
    records: HashMap<TaskId, TaskRecord>,
    in_flight: Option<TaskId>,
    graph: DependencyGraph,
    terminal: HashMap<TaskId, TaskRecord>,
    terminal_order: VecDeque<TaskId>,
    history_limit: usize,
    /// Terminal ids dropped from history since the last `drain_evicted`.
    evicted: Vec<TaskId>,
    next_seq: u64,
}

impl OwnerQueue {
    pub fn new(owner: OwnerId, history_limit: usize) -> Self {
        Self {
            owner,
            order: VecDeque::new(),
            records: HashMap::new(),
            in_flight: None,
            graph: DependencyGraph::new(),
            terminal: HashMap::new(),
            terminal_order: VecDeque::new(),
            history_limit,
            evicted: Vec::new(),
            next_seq: 1,
        }
    }

    /// Rebuilds a lane from persisted state. In-flight records go back to Pending.
    pub fn restore(
        owner: OwnerId,
        snapshot: QueueSnapshot,
        history_limit: usize,
    ) -> Result<Self, StoreError> {
        let mut lane = Self::new(owner, history_limit);
        for record in snapshot.terminal {
            if !record.status.is_terminal() {
                return Err(lane.corrupt(format!("{} in history is not terminal", record.id())));
            }
            lane.remember(record);
        }
        lane.evicted.clear();

        for mut record in snapshot.pending {
            if record.status.is_terminal() {
                return Err(lane.corrupt(format!("{} is pending but terminal", record.id())));
            }
            if record.task.owner() != &lane.owner {
                return Err(lane.corrupt(format!("{} belongs to another owner", record.id())));
            }
            record.reset_in_flight();
            let id = record.id();
            lane.order.push_back(id);
            lane.records.insert(id, record);
        }

        // 依存先がまだ pending の場合だけ edge を張る（終端済みなら解消済み）
        for id in &lane.order {
            if let Some(record) = lane.records.get(id) {
                for dep in record.task.dependencies() {
                    if lane.records.contains_key(dep) {
                        lane.graph.add_dependency(*id, *dep);
                    }
                }
            }
        }
        if let Some(cycle) = lane.graph.detect_cycle() {
            return Err(lane.corrupt(format!("dependency cycle {cycle:?}")));
        }

        let max_seq = lane
            .records
            .values()
            .map(|r| r.task.created_at())
            .max()
            .unwrap_or(0);
        lane.next_seq = snapshot.next_seq.max(max_seq + 1);
        Ok(lane)
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        QueueSnapshot {
            next_seq: self.next_seq,
            pending: self
                .order
                .iter()
                .filter_map(|id| self.records.get(id).cloned())
                .collect(),
            terminal: self
                .terminal_order
                .iter()
                .filter_map(|id| self.terminal.get(id).cloned())
                .collect(),
        }
    }

    /// Validates dependencies, assigns the sequence number and appends the task.
    pub fn insert(
        &mut self,
        id: TaskId,
        request: TaskRequest,
        now: DateTime<Utc>,
    ) -> Result<Task, QueueError> {
        for dep in request.dependencies() {
            if self.records.contains_key(dep) {
                continue;
            }
            match self.terminal.get(dep).map(|r| &r.status) {
                Some(TaskStatus::Succeeded) => {}
                Some(_) => return Err(QueueError::DependencyAlreadyFailed(*dep)),
                None => return Err(QueueError::UnknownDependency(*dep)),
            }
        }

        let task = request.into_task(id, self.next_seq, now);
        for dep in task.dependencies() {
            if self.records.contains_key(dep) {
                self.graph.add_dependency(id, *dep);
            }
        }
        if let Some(cycle) = self.graph.detect_cycle() {
            self.graph.remove_task(id);
            return Err(QueueError::DependencyCycle(cycle));
        }

        self.next_seq += 1;
        self.order.push_back(id);
        self.records.insert(id, TaskRecord::new(task.clone()));
        Ok(task)
    }

    /// The first due task with no unfinished dependency, if nothing is in flight.
    pub fn next_eligible(&self, now: DateTime<Utc>) -> Option<TaskId> {
        if self.in_flight.is_some() {
            return None;
        }
        self.order.iter().copied().find(|id| {
            !self.graph.has_dependencies(*id)
                && self.records.get(id).is_some_and(|r| r.is_due(now))
        })
    }

    /// Earliest backoff deadline among otherwise runnable tasks.
    pub fn next_wakeup(&self) -> Option<DateTime<Utc>> {
        if self.in_flight.is_some() {
            return None;
        }
        self.order
            .iter()
            .filter(|id| !self.graph.has_dependencies(**id))
            .filter_map(|id| self.records.get(id).and_then(|r| r.not_before))
            .min()
    }

    pub fn start(&mut self, id: TaskId) -> Result<Task, QueueError> {
        let record = self
            .records
            .get_mut(&id)
            .ok_or(QueueError::UnknownTask(id))?;
        record.start();
        self.in_flight = Some(id);
        Ok(record.task.clone())
    }

    /// Moves `id` out of the pending set. A failure cascades to every task that
    /// (transitively) depends on it.
    pub fn finish(
        &mut self,
        id: TaskId,
        status: TerminalStatus,
    ) -> Result<Vec<Finished>, QueueError> {
        let mut finished = Vec::new();
        let mut work = VecDeque::from([(id, status)]);

        while let Some((id, status)) = work.pop_front() {
            let Some(mut record) = self.take(id) else {
                if finished.is_empty() {
                    return Err(QueueError::UnknownTask(id));
                }
                // 別経路で既に cascade 済み
                continue;
            };
            let waiting = self.graph.remove_task(id);
            if let TerminalStatus::Failed(_) = status {
                for waiter in waiting {
                    if self.in_flight != Some(waiter) {
                        let reason = FailureReason::DependencyFailed(id);
                        work.push_back((waiter, TerminalStatus::Failed(reason)));
                    }
                }
            }
            record.finish(status.clone());
            finished.push(Finished {
                task: record.task.clone(),
                status,
            });
            self.remember(record);
        }
        Ok(finished)
    }

    /// Returns the new retry count.
    pub fn requeue(
        &mut self,
        id: TaskId,
        not_before: DateTime<Utc>,
        error: String,
    ) -> Result<u32, QueueError> {
        let record = self
            .records
            .get_mut(&id)
            .ok_or(QueueError::UnknownTask(id))?;
        record.schedule_retry(not_before, error);
        let retry_count = record.retry_count;
        if self.in_flight == Some(id) {
            self.in_flight = None;
        }
        self.order.retain(|t| *t != id);
        self.order.push_back(id);
        Ok(retry_count)
    }

    /// Drops every pending task except the in-flight one.
    pub fn cancel_all(&mut self) -> Vec<Finished> {
        let victims: Vec<TaskId> = self
            .order
            .iter()
            .copied()
            .filter(|id| self.in_flight != Some(*id))
            .collect();
        let mut cancelled = Vec::with_capacity(victims.len());
        for id in victims {
            let Some(mut record) = self.take(id) else {
                continue;
            };
            self.graph.remove_task(id);
            let status = TerminalStatus::Failed(FailureReason::Cancelled);
            record.finish(status.clone());
            cancelled.push(Finished {
                task: record.task.clone(),
                status,
            });
            self.remember(record);
        }
        cancelled
    }

    pub fn pending(&self) -> Vec<Task> {
        self.order
            .iter()
            .filter_map(|id| self.records.get(id).map(|r| r.task.clone()))
            .collect()
    }

    pub fn record(&self, id: TaskId) -> Option<&TaskRecord> {
        self.records.get(&id).or_else(|| self.terminal.get(&id))
    }

    pub fn task_ids(&self) -> impl Iterator<Item = TaskId> + '_ {
        self.order.iter().chain(self.terminal_order.iter()).copied()
    }

    pub fn in_flight(&self) -> Option<TaskId> {
        self.in_flight
    }

    pub fn counts(&self) -> QueueCounts {
        let mut counts = QueueCounts::default();
        for record in self.records.values().chain(self.terminal.values()) {
            match record.status {
                TaskStatus::Pending => counts.pending += 1,
                TaskStatus::InFlight => counts.in_flight += 1,
                TaskStatus::Succeeded => counts.succeeded += 1,
                TaskStatus::Failed(_) => counts.failed += 1,
            }
        }
        counts
    }

    pub fn drain_evicted(&mut self) -> Vec<TaskId> {
        std::mem::take(&mut self.evicted)
    }

    fn take(&mut self, id: TaskId) -> Option<TaskRecord> {
        let record = self.records.remove(&id)?;
        self.order.retain(|t| *t != id);
        if self.in_flight == Some(id) {
            self.in_flight = None;
        }
        Some(record)
    }

    fn remember(&mut self, record: TaskRecord) {
        let id = record.id();
        if self.terminal.insert(id, record).is_none() {
            self.terminal_order.push_back(id);
        }
        while self.terminal_order.len() > self.history_limit {
            if let Some(old) = self.terminal_order.pop_front() {
                self.terminal.remove(&old);
                self.evicted.push(old);
            }
        }
    }

    fn corrupt(&self, reason: String) -> StoreError {
        StoreError::Corrupt {
            owner: self.owner.clone(),
            reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{EntityId, LabelId, TaskKind};
    use chrono::Duration;
    use ulid::Ulid;

    fn owner() -> OwnerId {
        OwnerId::new("alice")
    }

    fn request() -> TaskRequest {
        TaskRequest::new(
            owner(),
            TaskKind::Label {
                label: LabelId::new("starred"),
            },
            [EntityId::new("c1")],
        )
        .unwrap()
    }

    fn new_id() -> TaskId {
        TaskId::from_ulid(Ulid::new())
    }

    fn lane() -> OwnerQueue {
        OwnerQueue::new(owner(), DEFAULT_HISTORY_LIMIT)
    }

    #[test]
    fn fifo_with_one_in_flight() {
        let mut q = lane();
        let now = Utc::now();
        let a = q.insert(new_id(), request(), now).unwrap();
        let b = q.insert(new_id(), request(), now).unwrap();
        assert!(a.created_at() < b.created_at());

        assert_eq!(q.next_eligible(now), Some(a.id()));
        q.start(a.id()).unwrap();
        assert_eq!(q.next_eligible(now), None);

        q.finish(a.id(), TerminalStatus::Succeeded).unwrap();
        assert_eq!(q.next_eligible(now), Some(b.id()));
    }

    #[test]
    fn dependency_overrides_fifo() {
        let mut q = lane();
        let now = Utc::now();
        let a = q.insert(new_id(), request(), now).unwrap();
        let b = q
            .insert(new_id(), request().depends_on(a.id()), now)
            .unwrap();

        // a を retry で末尾に回しても b は a を待つ
        q.start(a.id()).unwrap();
        q.requeue(a.id(), now, "timeout".into()).unwrap();
        assert_eq!(q.next_eligible(now), Some(a.id()));
        assert_eq!(
            q.pending().iter().map(Task::id).collect::<Vec<_>>(),
            vec![b.id(), a.id()]
        );
    }

    #[test]
    fn dependencies_are_validated() {
        let mut q = lane();
        let now = Utc::now();
        let unknown = new_id();
        let err = q
            .insert(new_id(), request().depends_on(unknown), now)
            .unwrap_err();
        assert!(matches!(err, QueueError::UnknownDependency(id) if id == unknown));

        let a = q.insert(new_id(), request(), now).unwrap();
        q.start(a.id()).unwrap();
        let reason = FailureReason::Permanent("gone".into());
        q.finish(a.id(), TerminalStatus::Failed(reason)).unwrap();

        let err = q
            .insert(new_id(), request().depends_on(a.id()), now)
            .unwrap_err();
        assert!(matches!(err, QueueError::DependencyAlreadyFailed(id) if id == a.id()));
        assert!(q.pending().is_empty());
    }

    #[test]
    fn succeeded_dependency_is_already_satisfied() {
        let mut q = lane();
        let now = Utc::now();
        let a = q.insert(new_id(), request(), now).unwrap();
        q.start(a.id()).unwrap();
        q.finish(a.id(), TerminalStatus::Succeeded).unwrap();

        let b = q
            .insert(new_id(), request().depends_on(a.id()), now)
            .unwrap();
        assert_eq!(q.next_eligible(now), Some(b.id()));
    }

    #[test]
    fn failure_cascades_transitively() {
        let mut q = lane();
        let now = Utc::now();
        let a = q.insert(new_id(), request(), now).unwrap();
        let b = q
            .insert(new_id(), request().depends_on(a.id()), now)
            .unwrap();
        let c = q
            .insert(new_id(), request().depends_on(b.id()), now)
            .unwrap();
        let d = q.insert(new_id(), request(), now).unwrap();

        q.start(a.id()).unwrap();
        let finished = q
            .finish(
                a.id(),
                TerminalStatus::Failed(FailureReason::Unauthorized("expired".into())),
            )
            .unwrap();

        let ids: Vec<TaskId> = finished.iter().map(|f| f.task.id()).collect();
        assert_eq!(ids, vec![a.id(), b.id(), c.id()]);
        assert_eq!(
            q.record(c.id()).unwrap().status,
            TaskStatus::Failed(FailureReason::DependencyFailed(b.id()))
        );
        assert_eq!(q.next_eligible(now), Some(d.id()));
    }

    #[test]
    fn finishing_twice_is_unknown_task() {
        let mut q = lane();
        let now = Utc::now();
        let a = q.insert(new_id(), request(), now).unwrap();
        q.start(a.id()).unwrap();
        q.finish(a.id(), TerminalStatus::Succeeded).unwrap();

        let before = q.counts();
        let err = q.finish(a.id(), TerminalStatus::Succeeded).unwrap_err();
        assert!(matches!(err, QueueError::UnknownTask(id) if id == a.id()));
        assert_eq!(q.counts(), before);
    }

    #[test]
    fn backoff_delays_eligibility() {
        let mut q = lane();
        let now = Utc::now();
        let a = q.insert(new_id(), request(), now).unwrap();
        q.start(a.id()).unwrap();
        let retry_at = now + Duration::seconds(4);
        assert_eq!(q.requeue(a.id(), retry_at, "timeout".into()).unwrap(), 1);

        assert_eq!(q.next_eligible(now), None);
        assert_eq!(q.next_wakeup(), Some(retry_at));
        assert_eq!(q.next_eligible(retry_at), Some(a.id()));
    }

    #[test]
    fn cancel_all_spares_the_in_flight_task() {
        let mut q = lane();
        let now = Utc::now();
        let a = q.insert(new_id(), request(), now).unwrap();
        let b = q.insert(new_id(), request(), now).unwrap();
        q.start(a.id()).unwrap();

        let cancelled = q.cancel_all();
        assert_eq!(cancelled.len(), 1);
        assert_eq!(cancelled[0].task.id(), b.id());
        assert_eq!(q.in_flight(), Some(a.id()));

        // in-flight の完了はまだ記録できる
        q.finish(a.id(), TerminalStatus::Succeeded).unwrap();
        assert_eq!(
            q.counts(),
            QueueCounts {
                pending: 0,
                in_flight: 0,
                succeeded: 1,
                failed: 1
            }
        );
    }

    #[test]
    fn restore_resets_in_flight_and_keeps_order() {
        let mut q = lane();
        let now = Utc::now();
        let a = q.insert(new_id(), request(), now).unwrap();
        let b = q
            .insert(new_id(), request().depends_on(a.id()), now)
            .unwrap();
        q.start(a.id()).unwrap();

        let restored = OwnerQueue::restore(owner(), q.snapshot(), DEFAULT_HISTORY_LIMIT).unwrap();
        assert_eq!(restored.in_flight(), None);
        assert_eq!(restored.record(a.id()).unwrap().status, TaskStatus::Pending);
        assert_eq!(restored.next_eligible(now), Some(a.id()));
        assert_eq!(
            restored.pending().iter().map(Task::id).collect::<Vec<_>>(),
            vec![a.id(), b.id()]
        );

        let mut restored = restored;
        let c = restored.insert(new_id(), request(), now).unwrap();
        assert!(c.created_at() > b.created_at());
    }

    #[test]
    fn history_is_bounded() {
        let mut q = OwnerQueue::new(owner(), 2);
        let now = Utc::now();
        let mut ids = Vec::new();
        for _ in 0..3 {
            let t = q.insert(new_id(), request(), now).unwrap();
            q.start(t.id()).unwrap();
            q.finish(t.id(), TerminalStatus::Succeeded).unwrap();
            ids.push(t.id());
        }

        assert!(q.record(ids[0]).is_none());
        assert_eq!(q.drain_evicted(), vec![ids[0]]);
        assert_eq!(q.counts().succeeded, 2);
    }
}
