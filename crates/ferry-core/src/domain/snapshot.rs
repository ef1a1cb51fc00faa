//! Local projection of a remote entity, and the change feed the server emits.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use super::ids::{EntityId, LabelId, OwnerId};
use super::task::TaskKind;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntitySnapshot {
    pub id: EntityId,
    pub owner: OwnerId,
    /// A message points at its conversation; conversations have no parent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<EntityId>,
    pub label_ids: BTreeSet<LabelId>,
    pub is_unread: bool,
    #[serde(default)]
    pub is_soft_deleted: bool,
}

impl EntitySnapshot {
    pub fn new(owner: OwnerId, id: EntityId) -> Self {
        Self {
            id,
            owner,
            parent: None,
            label_ids: BTreeSet::new(),
            is_unread: false,
            is_soft_deleted: false,
        }
    }

    pub fn with_parent(mut self, parent: EntityId) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn with_labels<I, L>(mut self, labels: I) -> Self
    where
        I: IntoIterator<Item = L>,
        L: Into<LabelId>,
    {
        self.label_ids = labels.into_iter().map(Into::into).collect();
        self
    }

    pub fn unread(mut self, is_unread: bool) -> Self {
        self.is_unread = is_unread;
        self
    }

    pub fn has_label(&self, label: &LabelId) -> bool {
        self.label_ids.contains(label)
    }

    /// Applies `kind` to this snapshot in place.
    ///
    /// Local store と simulated server が同じ意味論で書き換えるための共通実装。
    pub fn apply(&mut self, kind: &TaskKind) {
        match kind {
            TaskKind::MarkRead => self.is_unread = false,
            TaskKind::MarkUnread { .. } => self.is_unread = true,
            TaskKind::Label { label } => {
                self.label_ids.insert(label.clone());
            }
            TaskKind::Unlabel { label } => {
                self.label_ids.remove(label);
            }
            TaskKind::Move { from, to } => {
                self.label_ids.remove(from);
                self.label_ids.insert(to.clone());
            }
            TaskKind::Delete { .. } => self.is_soft_deleted = true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "change", rename_all = "snake_case")]
pub enum EntityChange {
    Upsert { snapshot: EntitySnapshot },
    Deleted { id: EntityId },
}

impl EntityChange {
    pub fn entity_id(&self) -> &EntityId {
        match self {
            EntityChange::Upsert { snapshot } => &snapshot.id,
            EntityChange::Deleted { id } => id,
        }
    }
}

/// Opaque position in an owner's server-side change log.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventCursor(String);

impl EventCursor {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventBatch {
    pub changes: Vec<EntityChange>,
    pub cursor: EventCursor,
}
