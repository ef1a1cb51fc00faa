//! SimulatedServer - RemoteExecutor と EventStream を兼ねる開発用サーバー
//!
//! # 学習ポイント
//! - サーバー側の正本（entities）と owner ごとの変更ログ（seq 付き）
//! - スクリプトで失敗を注入（Transient / Permanent / Unauthorized）
//! - 実行ジャーナルで「owner ごとに同時実行 1 つ」を検証できる

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use crate::domain::{
    EntityChange, EntityId, EntitySnapshot, EventBatch, EventCursor, EventStreamError, OwnerId,
    RemoteError, Task, TaskId, TaskKind,
};
use crate::ports::{EventStream, RemoteExecutor};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JournalEntry {
    Started(TaskId),
    Finished(TaskId),
}

#[derive(Debug, Default)]
struct OwnerLog {
    /// Oldest sequence number still retained; cursors before it are expired.
    base: u64,
    last: u64,
    changes: VecDeque<(u64, EntityChange)>,
}

impl OwnerLog {
    fn push(&mut self, change: EntityChange) {
        self.last += 1;
        self.changes.push_back((self.last, change));
    }
}

#[derive(Debug, Default)]
struct ServerState {
    entities: BTreeMap<(OwnerId, EntityId), EntitySnapshot>,
    logs: HashMap<OwnerId, OwnerLog>,
    failures: VecDeque<RemoteError>,
    journal: Vec<(OwnerId, JournalEntry)>,
    in_flight: HashMap<OwnerId, usize>,
    max_in_flight: HashMap<OwnerId, usize>,
}

#[derive(Debug, Default)]
pub struct SimulatedServer {
    state: Mutex<ServerState>,
    latency: Option<Duration>,
}

impl SimulatedServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every `execute` sleeps this long before answering.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Puts an entity on the server without logging a change.
    pub fn seed(&self, snapshot: EntitySnapshot) {
        self.lock()
            .entities
            .insert((snapshot.owner.clone(), snapshot.id.clone()), snapshot);
    }

    /// A change made by another client: stored and logged.
    pub fn external_upsert(&self, snapshot: EntitySnapshot) {
        let mut state = self.lock();
        let owner = snapshot.owner.clone();
        state
            .entities
            .insert((owner.clone(), snapshot.id.clone()), snapshot.clone());
        state
            .logs
            .entry(owner)
            .or_default()
            .push(EntityChange::Upsert { snapshot });
    }

    pub fn external_delete(&self, owner: &OwnerId, id: &EntityId) {
        let mut state = self.lock();
        state.entities.remove(&(owner.clone(), id.clone()));
        state
            .logs
            .entry(owner.clone())
            .or_default()
            .push(EntityChange::Deleted { id: id.clone() });
    }

    /// The next `execute` calls fail with these errors, in order.
    pub fn push_failures(&self, errors: impl IntoIterator<Item = RemoteError>) {
        self.lock().failures.extend(errors);
    }

    /// Drops the retained log so every outstanding cursor expires.
    pub fn truncate_log(&self, owner: &OwnerId) {
        let mut state = self.lock();
        let log = state.logs.entry(owner.clone()).or_default();
        log.changes.clear();
        log.base = log.last;
    }

    pub fn entity(&self, owner: &OwnerId, id: &EntityId) -> Option<EntitySnapshot> {
        self.lock().entities.get(&(owner.clone(), id.clone())).cloned()
    }

    pub fn journal(&self, owner: &OwnerId) -> Vec<JournalEntry> {
        self.lock()
            .journal
            .iter()
            .filter(|(o, _)| o == owner)
            .map(|(_, e)| *e)
            .collect()
    }

    /// Task ids in the order their executions started (retries repeat the id).
    pub fn executions(&self, owner: &OwnerId) -> Vec<TaskId> {
        self.journal(owner)
            .into_iter()
            .filter_map(|e| match e {
                JournalEntry::Started(id) => Some(id),
                JournalEntry::Finished(_) => None,
            })
            .collect()
    }

    /// Highest number of simultaneous `execute` calls seen for the owner.
    pub fn max_in_flight(&self, owner: &OwnerId) -> usize {
        self.lock().max_in_flight.get(owner).copied().unwrap_or(0)
    }

    fn lock(&self) -> MutexGuard<'_, ServerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn begin(&self, task: &Task) {
        let mut state = self.lock();
        let owner = task.owner().clone();
        state
            .journal
            .push((owner.clone(), JournalEntry::Started(task.id())));
        let now = {
            let n = state.in_flight.entry(owner.clone()).or_default();
            *n += 1;
            *n
        };
        let max = state.max_in_flight.entry(owner).or_default();
        *max = (*max).max(now);
    }

    fn end(&self, task: &Task) {
        let mut state = self.lock();
        let owner = task.owner().clone();
        if let Some(n) = state.in_flight.get_mut(&owner) {
            *n = n.saturating_sub(1);
        }
        state
            .journal
            .push((owner, JournalEntry::Finished(task.id())));
    }

    fn apply(&self, task: &Task) -> Result<(), RemoteError> {
        let mut guard = self.lock();
        let state = &mut *guard;
        if let Some(error) = state.failures.pop_front() {
            return Err(error);
        }

        let owner = task.owner();
        let missing: Vec<&EntityId> = task
            .targets()
            .iter()
            .filter(|id| !state.entities.contains_key(&((*owner).clone(), (*id).clone())))
            .collect();
        if !missing.is_empty() {
            return Err(RemoteError::Permanent(format!("entities not found: {missing:?}")));
        }

        let mut keys: Vec<(OwnerId, EntityId)> = task
            .targets()
            .iter()
            .map(|id| (owner.clone(), id.clone()))
            .collect();
        if task.is_bulk_entity() {
            keys.extend(
                state
                    .entities
                    .values()
                    .filter(|e| &e.owner == owner)
                    .filter(|e| e.parent.as_ref().is_some_and(|p| task.targets().contains(p)))
                    .map(|e| (e.owner.clone(), e.id.clone())),
            );
        }

        let log = state.logs.entry(owner.clone()).or_default();
        for key in keys {
            if let TaskKind::Delete { .. } = task.kind() {
                if state.entities.remove(&key).is_some() {
                    log.push(EntityChange::Deleted { id: key.1 });
                }
            } else if let Some(entity) = state.entities.get_mut(&key) {
                entity.apply(task.kind());
                log.push(EntityChange::Upsert {
                    snapshot: entity.clone(),
                });
            }
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteExecutor for SimulatedServer {
    async fn execute(&self, task: &Task) -> Result<(), RemoteError> {
        self.begin(task);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        let result = self.apply(task);
        self.end(task);
        result
    }
}

#[async_trait]
impl EventStream for SimulatedServer {
    async fn fetch_since(
        &self,
        owner: &OwnerId,
        cursor: Option<&EventCursor>,
    ) -> Result<EventBatch, EventStreamError> {
        let state = self.lock();
        let (base, last, changes) = match state.logs.get(owner) {
            Some(log) => (log.base, log.last, Some(&log.changes)),
            None => (0, 0, None),
        };

        let after = match cursor {
            None => base,
            Some(cursor) => match cursor.as_str().parse::<u64>() {
                Ok(seq) if seq >= base && seq <= last => seq,
                _ => return Err(EventStreamError::CursorExpired(owner.clone())),
            },
        };

        let changes = changes
            .into_iter()
            .flatten()
            .filter(|(seq, _)| *seq > after)
            .map(|(_, change)| change.clone())
            .collect();
        Ok(EventBatch {
            changes,
            cursor: EventCursor::new(last.to_string()),
        })
    }

    async fn fetch_entities(
        &self,
        owner: &OwnerId,
        ids: &[EntityId],
    ) -> Result<Vec<EntitySnapshot>, EventStreamError> {
        let state = self.lock();
        Ok(ids
            .iter()
            .filter_map(|id| state.entities.get(&(owner.clone(), id.clone())).cloned())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{LabelId, TaskRequest};
    use chrono::Utc;
    use ulid::Ulid;

    fn owner() -> OwnerId {
        OwnerId::new("alice")
    }

    fn task(kind: TaskKind, targets: &[&str], bulk: bool) -> Task {
        TaskRequest::new(owner(), kind, targets.iter().map(|t| EntityId::new(*t)))
            .unwrap()
            .bulk_entity(bulk)
            .into_task(TaskId::from_ulid(Ulid::new()), 1, Utc::now())
    }

    fn server() -> SimulatedServer {
        let server = SimulatedServer::new();
        server.seed(EntitySnapshot::new(owner(), "c1".into()).with_labels(["inbox"]));
        server.seed(
            EntitySnapshot::new(owner(), "m1".into())
                .with_parent("c1".into())
                .with_labels(["inbox"]),
        );
        server
    }

    #[tokio::test]
    async fn execute_logs_changes_for_the_event_stream() {
        let server = server();
        let label = TaskKind::Label {
            label: LabelId::new("starred"),
        };
        server.execute(&task(label, &["c1"], true)).await.unwrap();

        let batch = server.fetch_since(&owner(), None).await.unwrap();
        assert_eq!(batch.changes.len(), 2);
        assert_eq!(batch.cursor.as_str(), "2");

        let again = server.fetch_since(&owner(), Some(&batch.cursor)).await.unwrap();
        assert!(again.changes.is_empty());
        assert_eq!(again.cursor, batch.cursor);
    }

    #[tokio::test]
    async fn missing_target_is_permanent() {
        let server = server();
        let err = server
            .execute(&task(TaskKind::MarkRead, &["c1", "gone"], false))
            .await
            .unwrap_err();
        assert!(matches!(err, RemoteError::Permanent(_)));
        // 一部だけ適用されることはない
        assert!(server.fetch_since(&owner(), None).await.unwrap().changes.is_empty());
    }

    #[tokio::test]
    async fn scripted_failures_come_first() {
        let server = server();
        server.push_failures([RemoteError::Transient("timeout".into())]);
        let t = task(TaskKind::MarkRead, &["c1"], false);

        assert!(server.execute(&t).await.is_err());
        assert!(server.execute(&t).await.is_ok());
        assert_eq!(server.executions(&owner()), vec![t.id(), t.id()]);
        assert_eq!(server.max_in_flight(&owner()), 1);
    }

    #[tokio::test]
    async fn truncated_log_expires_cursors() {
        let server = server();
        server
            .execute(&task(TaskKind::MarkRead, &["c1"], false))
            .await
            .unwrap();
        let cursor = EventCursor::new("0");
        server.truncate_log(&owner());

        let err = server.fetch_since(&owner(), Some(&cursor)).await.unwrap_err();
        assert_eq!(err, EventStreamError::CursorExpired(owner()));

        let fresh = server.fetch_since(&owner(), None).await.unwrap();
        assert!(fresh.changes.is_empty());
        assert_eq!(fresh.cursor.as_str(), "1");
    }

    #[tokio::test]
    async fn delete_removes_entities_and_children() {
        let server = server();
        let delete = TaskKind::Delete {
            label: LabelId::new("inbox"),
        };
        server.execute(&task(delete, &["c1"], true)).await.unwrap();

        assert!(server.entity(&owner(), &"c1".into()).is_none());
        assert!(server.entity(&owner(), &"m1".into()).is_none());
        assert!(
            server
                .fetch_entities(&owner(), &["c1".into(), "m1".into()])
                .await
                .unwrap()
                .is_empty()
        );
    }
}
