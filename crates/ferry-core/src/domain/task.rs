//! Task: one intended remote mutation plus its addressing metadata.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::errors::TaskError;
use super::ids::{EntityId, LabelId, OwnerId, TaskId};

/// What the remote side is asked to do.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskKind {
    MarkRead,
    /// `label` is the context the entity was viewed in; only the unread flag changes.
    MarkUnread { label: LabelId },
    Label { label: LabelId },
    Unlabel { label: LabelId },
    /// Unlabel `from` and label `to` as one remote step.
    Move { from: LabelId, to: LabelId },
    /// Delete from the `label` the caller is looking at.
    Delete { label: LabelId },
}

impl TaskKind {
    pub fn name(&self) -> &'static str {
        match self {
            TaskKind::MarkRead => "mark_read",
            TaskKind::MarkUnread { .. } => "mark_unread",
            TaskKind::Label { .. } => "label",
            TaskKind::Unlabel { .. } => "unlabel",
            TaskKind::Move { .. } => "move",
            TaskKind::Delete { .. } => "delete",
        }
    }

    /// Labels whose contents change when this task runs.
    pub fn affected_labels(&self) -> Vec<LabelId> {
        match self {
            TaskKind::MarkRead => Vec::new(),
            TaskKind::MarkUnread { label }
            | TaskKind::Label { label }
            | TaskKind::Unlabel { label }
            | TaskKind::Delete { label } => vec![label.clone()],
            TaskKind::Move { from, to } => vec![from.clone(), to.clone()],
        }
    }

    fn validate(&self) -> Result<(), TaskError> {
        let blank = match self {
            TaskKind::MarkRead => false,
            TaskKind::MarkUnread { label }
            | TaskKind::Label { label }
            | TaskKind::Unlabel { label }
            | TaskKind::Delete { label } => label.is_empty(),
            // 移動元は空でもよい（どこから来たか分からない一括アーカイブなど）
            TaskKind::Move { to, .. } => to.is_empty(),
        };
        if blank {
            Err(TaskError::EmptyLabel)
        } else {
            Ok(())
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskKind::MarkRead => f.write_str(self.name()),
            TaskKind::MarkUnread { label }
            | TaskKind::Label { label }
            | TaskKind::Unlabel { label }
            | TaskKind::Delete { label } => write!(f, "{}({label})", self.name()),
            TaskKind::Move { from, to } => write!(f, "move({from} -> {to})"),
        }
    }
}

/// A validated description of a task that has not been enqueued yet.
///
/// The queue turns it into a [`Task`] by assigning an id and a sequence number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskRequest {
    owner: OwnerId,
    kind: TaskKind,
    targets: BTreeSet<EntityId>,
    dependencies: Vec<TaskId>,
    is_bulk_entity: bool,
    is_swipe_action: bool,
}

impl TaskRequest {
    /// Rejects an empty target set and blank label ids.
    pub fn new(
        owner: OwnerId,
        kind: TaskKind,
        targets: impl IntoIterator<Item = EntityId>,
    ) -> Result<Self, TaskError> {
        let targets: BTreeSet<EntityId> = targets.into_iter().collect();
        if targets.is_empty() {
            return Err(TaskError::EmptyTargetSet);
        }
        kind.validate()?;
        Ok(Self {
            owner,
            kind,
            targets,
            dependencies: Vec::new(),
            is_bulk_entity: false,
            is_swipe_action: false,
        })
    }

    /// The task may only run after `task` reached a terminal state.
    pub fn depends_on(mut self, task: TaskId) -> Self {
        if !self.dependencies.contains(&task) {
            self.dependencies.push(task);
        }
        self
    }

    pub fn with_dependencies(self, tasks: impl IntoIterator<Item = TaskId>) -> Self {
        tasks.into_iter().fold(self, Self::depends_on)
    }

    /// Targets are aggregates (conversations) rather than leaves (messages).
    pub fn bulk_entity(mut self, is_bulk_entity: bool) -> Self {
        self.is_bulk_entity = is_bulk_entity;
        self
    }

    pub fn swipe_action(mut self, is_swipe_action: bool) -> Self {
        self.is_swipe_action = is_swipe_action;
        self
    }

    pub fn owner(&self) -> &OwnerId {
        &self.owner
    }

    pub fn kind(&self) -> &TaskKind {
        &self.kind
    }

    pub fn dependencies(&self) -> &[TaskId] {
        &self.dependencies
    }

    pub(crate) fn into_task(self, id: TaskId, created_at: u64, enqueued_at: DateTime<Utc>) -> Task {
        Task {
            id,
            owner: self.owner,
            kind: self.kind,
            targets: self.targets,
            dependencies: self.dependencies,
            is_bulk_entity: self.is_bulk_entity,
            is_swipe_action: self.is_swipe_action,
            created_at,
            enqueued_at,
        }
    }
}

/// An enqueued remote mutation. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    id: TaskId,
    owner: OwnerId,
    kind: TaskKind,
    targets: BTreeSet<EntityId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    dependencies: Vec<TaskId>,
    is_bulk_entity: bool,
    #[serde(default)]
    is_swipe_action: bool,
    /// Monotonic per-owner sequence number (FIFO tiebreak).
    created_at: u64,
    enqueued_at: DateTime<Utc>,
}

impl Task {
    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn owner(&self) -> &OwnerId {
        &self.owner
    }

    pub fn kind(&self) -> &TaskKind {
        &self.kind
    }

    pub fn targets(&self) -> &BTreeSet<EntityId> {
        &self.targets
    }

    pub fn dependencies(&self) -> &[TaskId] {
        &self.dependencies
    }

    pub fn is_bulk_entity(&self) -> bool {
        self.is_bulk_entity
    }

    pub fn is_swipe_action(&self) -> bool {
        self.is_swipe_action
    }

    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    pub fn enqueued_at(&self) -> DateTime<Utc> {
        self.enqueued_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use ulid::Ulid;

    fn owner() -> OwnerId {
        OwnerId::new("alice")
    }

    #[test]
    fn empty_target_set_is_rejected() {
        let err = TaskRequest::new(owner(), TaskKind::MarkRead, Vec::<EntityId>::new()).unwrap_err();
        assert_eq!(err, TaskError::EmptyTargetSet);
    }

    #[rstest]
    #[case::mark_unread(TaskKind::MarkUnread { label: LabelId::new("") })]
    #[case::label(TaskKind::Label { label: LabelId::new("") })]
    #[case::unlabel(TaskKind::Unlabel { label: LabelId::new(" ") })]
    #[case::delete(TaskKind::Delete { label: LabelId::new("") })]
    #[case::move_to_nowhere(TaskKind::Move { from: LabelId::new("inbox"), to: LabelId::new("") })]
    fn blank_labels_are_rejected(#[case] kind: TaskKind) {
        let err = TaskRequest::new(owner(), kind, [EntityId::new("a")]).unwrap_err();
        assert_eq!(err, TaskError::EmptyLabel);
    }

    #[test]
    fn move_from_unknown_folder_is_allowed() {
        let kind = TaskKind::Move {
            from: LabelId::new(""),
            to: LabelId::new("archive"),
        };
        assert!(TaskRequest::new(owner(), kind, [EntityId::new("a")]).is_ok());
    }

    #[test]
    fn duplicate_targets_and_dependencies_collapse() {
        let dep = TaskId::from_ulid(Ulid::new());
        let request = TaskRequest::new(
            owner(),
            TaskKind::MarkRead,
            [EntityId::new("a"), EntityId::new("a"), EntityId::new("b")],
        )
        .unwrap()
        .depends_on(dep)
        .depends_on(dep);

        let task = request.into_task(TaskId::from_ulid(Ulid::new()), 1, Utc::now());
        assert_eq!(task.targets().len(), 2);
        assert_eq!(task.dependencies(), &[dep]);
    }

    #[test]
    fn move_affects_both_labels() {
        let kind = TaskKind::Move {
            from: LabelId::new("inbox"),
            to: LabelId::new("archive"),
        };
        assert_eq!(
            kind.affected_labels(),
            vec![LabelId::new("inbox"), LabelId::new("archive")]
        );
        assert_eq!(kind.to_string(), "move(inbox -> archive)");
    }

    #[test]
    fn kind_is_tagged_in_json() {
        let kind = TaskKind::Label {
            label: LabelId::new("starred"),
        };
        let v = serde_json::to_value(&kind).unwrap();
        assert_eq!(v["type"], "label");
        assert_eq!(v["label"], "starred");
    }
}
