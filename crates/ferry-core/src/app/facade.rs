//! MutationFacade - UI から呼ばれる変更操作の入り口
//!
//! # フロー（各操作共通）
//! 1. 入力を検証して TaskRequest を作る（空のターゲットはここで弾く）
//! 2. owner の WriteGate に入る
//! 3. キューに永続化（ここで戻り値の task_id が確定）
//! 4. LocalStore に楽観的に適用
//!
//! 3 が 4 より先なので、クラッシュしてもタスクは失われません。
//! 逆に 4 が失敗してもタスクはキューに残り、完了後の refresh で追いつきます。

use std::sync::Arc;

use crate::domain::{
    EntityId, EntitySnapshot, LabelId, LocalStoreError, MutationError, OwnerId, TaskError,
    TaskId, TaskKind, TaskRequest, TerminalStatus,
};
use crate::ports::LocalStore;

use super::gate::WriteGate;
use super::manager::{QueueManager, TaskTicket};
use super::reconciler::{Reconciler, RefreshReport};

/// What a mutation is applied to.
#[derive(Debug, Clone)]
pub struct Selection {
    owner: OwnerId,
    targets: Vec<EntityId>,
    is_bulk_entity: bool,
    is_swipe_action: bool,
    after: Vec<TaskId>,
}

impl Selection {
    /// Conversation ids: the mutation also fans out to their messages.
    pub fn conversations<I, E>(owner: impl Into<OwnerId>, ids: I) -> Self
    where
        I: IntoIterator<Item = E>,
        E: Into<EntityId>,
    {
        Self::new(owner.into(), ids, true)
    }

    pub fn messages<I, E>(owner: impl Into<OwnerId>, ids: I) -> Self
    where
        I: IntoIterator<Item = E>,
        E: Into<EntityId>,
    {
        Self::new(owner.into(), ids, false)
    }

    fn new<I, E>(owner: OwnerId, ids: I, is_bulk_entity: bool) -> Self
    where
        I: IntoIterator<Item = E>,
        E: Into<EntityId>,
    {
        Self {
            owner,
            targets: ids.into_iter().map(Into::into).collect(),
            is_bulk_entity,
            is_swipe_action: false,
            after: Vec::new(),
        }
    }

    pub fn swipe(mut self) -> Self {
        self.is_swipe_action = true;
        self
    }

    /// Runs only after `task_id` has succeeded.
    pub fn after(mut self, task_id: TaskId) -> Self {
        self.after.push(task_id);
        self
    }

    pub fn owner(&self) -> &OwnerId {
        &self.owner
    }

    fn into_request(self, kind: TaskKind) -> Result<TaskRequest, TaskError> {
        Ok(TaskRequest::new(self.owner, kind, self.targets)?
            .bulk_entity(self.is_bulk_entity)
            .swipe_action(self.is_swipe_action)
            .with_dependencies(self.after))
    }
}

/// Accepted mutation: queued durably and applied locally.
#[derive(Debug)]
pub struct MutationReceipt {
    ticket: TaskTicket,
}

impl MutationReceipt {
    pub fn task_id(&self) -> TaskId {
        self.ticket.task_id()
    }

    pub async fn wait(self) -> Option<TerminalStatus> {
        self.ticket.wait().await
    }

    pub fn into_ticket(self) -> TaskTicket {
        self.ticket
    }
}

pub struct MutationFacade {
    manager: QueueManager,
    local: Arc<dyn LocalStore>,
    reconciler: Arc<Reconciler>,
    gate: Arc<WriteGate>,
}

impl MutationFacade {
    pub fn new(
        manager: QueueManager,
        local: Arc<dyn LocalStore>,
        reconciler: Arc<Reconciler>,
        gate: Arc<WriteGate>,
    ) -> Self {
        Self {
            manager,
            local,
            reconciler,
            gate,
        }
    }

    pub async fn mark_read(&self, selection: Selection) -> Result<MutationReceipt, MutationError> {
        self.submit(selection, TaskKind::MarkRead).await
    }

    pub async fn mark_unread(
        &self,
        selection: Selection,
        label: impl Into<LabelId>,
    ) -> Result<MutationReceipt, MutationError> {
        let label = label.into();
        self.submit(selection, TaskKind::MarkUnread { label }).await
    }

    pub async fn label(
        &self,
        selection: Selection,
        label: impl Into<LabelId>,
    ) -> Result<MutationReceipt, MutationError> {
        let label = label.into();
        self.submit(selection, TaskKind::Label { label }).await
    }

    pub async fn unlabel(
        &self,
        selection: Selection,
        label: impl Into<LabelId>,
    ) -> Result<MutationReceipt, MutationError> {
        let label = label.into();
        self.submit(selection, TaskKind::Unlabel { label }).await
    }

    /// `from` may be empty when the current location is unknown.
    pub async fn move_to(
        &self,
        selection: Selection,
        from: impl Into<LabelId>,
        to: impl Into<LabelId>,
    ) -> Result<MutationReceipt, MutationError> {
        let kind = TaskKind::Move {
            from: from.into(),
            to: to.into(),
        };
        self.submit(selection, kind).await
    }

    pub async fn delete(
        &self,
        selection: Selection,
        label: impl Into<LabelId>,
    ) -> Result<MutationReceipt, MutationError> {
        let label = label.into();
        self.submit(selection, TaskKind::Delete { label }).await
    }

    /// Reads the optimistic projection. Unknown ids are skipped.
    pub async fn fetch_local(
        &self,
        owner: &OwnerId,
        ids: &[EntityId],
    ) -> Result<Vec<EntitySnapshot>, LocalStoreError> {
        self.local.fetch_by_ids(owner, ids).await
    }

    /// Pulls the authoritative state of specific entities from the server.
    pub async fn refresh_entities(
        &self,
        owner: &OwnerId,
        ids: &[EntityId],
    ) -> Result<RefreshReport, MutationError> {
        if ids.is_empty() {
            return Err(TaskError::EmptyTargetSet.into());
        }
        Ok(self.reconciler.reconcile_targets(owner, ids).await?)
    }

    async fn submit(
        &self,
        selection: Selection,
        kind: TaskKind,
    ) -> Result<MutationReceipt, MutationError> {
        let request = selection.into_request(kind)?;
        let owner = request.owner().clone();

        let _gate = self.gate.enter(&owner).await;
        let ticket = self.manager.submit(request).await?;
        let task_id = ticket.task_id();

        if let Err(source) = self.local.apply_optimistic(ticket.task()).await {
            tracing::warn!(%owner, task_id = %task_id, error = %source, "optimistic apply failed");
            return Err(MutationError::LocalApply { task_id, source });
        }
        tracing::debug!(%owner, task_id = %task_id, kind = %ticket.task().kind(), "mutation accepted");
        Ok(MutationReceipt { ticket })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{EntitySnapshot, QueueError};
    use crate::impls::{InMemoryLocalStore, InMemoryQueueStore, SimulatedServer};
    use crate::ports::{SystemClock, UlidGenerator};
    use crate::queue::{RetryPolicy, TaskQueue};

    struct Fixture {
        facade: MutationFacade,
        manager: QueueManager,
        local: Arc<InMemoryLocalStore>,
    }

    fn fixture() -> Fixture {
        let server = Arc::new(SimulatedServer::new());
        let local = Arc::new(InMemoryLocalStore::new());
        let c1 = EntitySnapshot::new("alice".into(), "c1".into())
            .with_labels(["inbox"])
            .unread(true);
        server.seed(c1.clone());
        local.seed(c1);

        let clock = Arc::new(SystemClock);
        let queue = Arc::new(TaskQueue::new(
            Arc::new(InMemoryQueueStore::new()),
            Arc::new(UlidGenerator::new(clock.clone())),
            clock,
        ));
        let gate = Arc::new(WriteGate::new());
        let reconciler = Arc::new(Reconciler::new(server.clone(), local.clone(), gate.clone()));
        let manager = QueueManager::new(queue, server, reconciler.clone(), RetryPolicy::default());
        manager.set_online(false);
        let facade = MutationFacade::new(manager.clone(), local.clone(), reconciler, gate);
        Fixture {
            facade,
            manager,
            local,
        }
    }

    #[tokio::test]
    async fn mutation_is_visible_locally_before_the_server_answers() {
        let f = fixture();
        let receipt = f
            .facade
            .label(Selection::conversations("alice", ["c1"]), "starred")
            .await
            .unwrap();

        let c1 = f.local.get(&"alice".into(), &"c1".into()).unwrap();
        assert!(c1.has_label(&"starred".into()));
        let pending = f.manager.queue().pending(&"alice".into()).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id(), receipt.task_id());
    }

    #[tokio::test]
    async fn empty_selection_touches_nothing() {
        let f = fixture();
        let err = f
            .facade
            .mark_read(Selection::messages("alice", Vec::<EntityId>::new()))
            .await
            .unwrap_err();
        assert_eq!(err.task_error(), Some(&TaskError::EmptyTargetSet));
        assert!(f.manager.queue().pending(&"alice".into()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn local_failure_still_leaves_the_task_queued() {
        let f = fixture();
        f.local.set_unavailable(true);
        let err = f
            .facade
            .mark_read(Selection::messages("alice", ["c1"]))
            .await
            .unwrap_err();

        let MutationError::LocalApply { task_id, .. } = err else {
            panic!("expected LocalApply, got {err:?}");
        };
        let pending = f.manager.queue().pending(&"alice".into()).await.unwrap();
        assert_eq!(pending[0].id(), task_id);
    }

    #[tokio::test]
    async fn unknown_dependency_is_rejected() {
        let f = fixture();
        let bogus = TaskId::from_ulid(ulid::Ulid::new());
        let err = f
            .facade
            .mark_read(Selection::messages("alice", ["c1"]).after(bogus))
            .await
            .unwrap_err();
        assert!(matches!(err, MutationError::Queue(QueueError::UnknownDependency(id)) if id == bogus));
        let c1 = f.local.get(&"alice".into(), &"c1".into()).unwrap();
        assert!(c1.is_unread);
    }

    #[tokio::test]
    async fn refresh_entities_requires_ids() {
        let f = fixture();
        let err = f
            .facade
            .refresh_entities(&"alice".into(), &[])
            .await
            .unwrap_err();
        assert_eq!(err.task_error(), Some(&TaskError::EmptyTargetSet));
    }
}
