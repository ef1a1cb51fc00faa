//! Reconciler - ローカル状態をサーバーの正本に収束させる
//!
//! # フロー
//! 1. owner の cursor 以降の変更を EventStream から取得
//! 2. Upsert は overwrite（soft-delete も解除される）、Deleted は soft_delete
//! 3. 最後に削除が確定した ID を purge
//! 4. 全部書けたら cursor を進める（途中で失敗したら次回また同じ所から）
//!
//! 書き込みは WriteGate の中で行うので、Façade の楽観的 apply と交互に混ざりません。

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, PoisonError};

use crate::domain::{
    EntityChange, EntityId, EventCursor, EventStreamError, LabelId, OwnerId, ReconcileError,
};
use crate::ports::{EventStream, LocalStore};

use super::gate::WriteGate;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshReport {
    pub upserted: usize,
    pub deleted: usize,
    pub purged: usize,
    /// The stored cursor had expired and the log was read from its start.
    pub cursor_reset: bool,
}

pub struct Reconciler {
    events: Arc<dyn EventStream>,
    local: Arc<dyn LocalStore>,
    gate: Arc<WriteGate>,
    cursors: Mutex<HashMap<OwnerId, EventCursor>>,
}

impl Reconciler {
    pub fn new(events: Arc<dyn EventStream>, local: Arc<dyn LocalStore>, gate: Arc<WriteGate>) -> Self {
        Self {
            events,
            local,
            gate,
            cursors: Mutex::new(HashMap::new()),
        }
    }

    /// Applies every server change since the owner's cursor.
    ///
    /// `label_ids` only scopes the diagnostics; changes to other labels are
    /// applied too because the cursor moves past them.
    pub async fn refresh(
        &self,
        owner: &OwnerId,
        label_ids: &[LabelId],
    ) -> Result<RefreshReport, ReconcileError> {
        let _gate = self.gate.enter(owner).await;
        let mut report = RefreshReport::default();

        let cursor = self.cursor(owner);
        let batch = match self.events.fetch_since(owner, cursor.as_ref()).await {
            Err(EventStreamError::CursorExpired(_)) => {
                tracing::warn!(%owner, "event cursor expired, reading from the start of the log");
                report.cursor_reset = true;
                self.forget(owner);
                self.events.fetch_since(owner, None).await?
            }
            other => other?,
        };

        let mut deleted: BTreeSet<EntityId> = BTreeSet::new();
        for change in batch.changes {
            match change {
                EntityChange::Upsert { snapshot } => {
                    deleted.remove(&snapshot.id);
                    self.local.overwrite(snapshot).await?;
                    report.upserted += 1;
                }
                EntityChange::Deleted { id } => {
                    self.local
                        .soft_delete(owner, std::slice::from_ref(&id))
                        .await?;
                    deleted.insert(id);
                    report.deleted += 1;
                }
            }
        }
        if !deleted.is_empty() {
            let ids: Vec<EntityId> = deleted.into_iter().collect();
            report.purged = self.local.purge_soft_deleted(owner, &ids).await?;
        }

        self.cursors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(owner.clone(), batch.cursor);

        tracing::debug!(
            %owner,
            labels = ?label_ids,
            upserted = report.upserted,
            deleted = report.deleted,
            purged = report.purged,
            "refreshed from event stream"
        );
        Ok(report)
    }

    /// Authoritative re-fetch of specific entities: present ones are overwritten,
    /// missing ones are confirmed deleted and purged.
    pub async fn reconcile_targets(
        &self,
        owner: &OwnerId,
        ids: &[EntityId],
    ) -> Result<RefreshReport, ReconcileError> {
        let _gate = self.gate.enter(owner).await;
        let mut report = RefreshReport::default();

        let found = self.events.fetch_entities(owner, ids).await?;
        let present: BTreeSet<EntityId> = found.iter().map(|s| s.id.clone()).collect();
        for snapshot in found {
            self.local.overwrite(snapshot).await?;
            report.upserted += 1;
        }

        let gone: Vec<EntityId> = ids
            .iter()
            .filter(|id| !present.contains(*id))
            .cloned()
            .collect();
        if !gone.is_empty() {
            self.local.soft_delete(owner, &gone).await?;
            report.deleted = gone.len();
            report.purged = self.local.purge_soft_deleted(owner, &gone).await?;
        }

        tracing::debug!(
            %owner,
            targets = ids.len(),
            upserted = report.upserted,
            purged = report.purged,
            "reconciled targets"
        );
        Ok(report)
    }

    pub fn cursor(&self, owner: &OwnerId) -> Option<EventCursor> {
        self.cursors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(owner)
            .cloned()
    }

    /// Drops the owner's cursor (logout, or an expired cursor).
    pub fn forget(&self, owner: &OwnerId) {
        self.cursors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(owner);
    }
}
