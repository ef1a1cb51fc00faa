//! InMemoryLocalStore - 楽観的ローカル状態の開発用実装
//!
//! UI が読む投影の代わり。bulk-entity（会話）への変更は子（メッセージ）にも波及させます。

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use crate::domain::{EntityId, EntitySnapshot, LocalStoreError, OwnerId, Task};
use crate::ports::LocalStore;

type Entities = HashMap<(OwnerId, EntityId), EntitySnapshot>;

#[derive(Debug, Default)]
pub struct InMemoryLocalStore {
    entities: Mutex<Entities>,
    unavailable: AtomicBool,
}

impl InMemoryLocalStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces an entity without any queue involvement.
    pub fn seed(&self, snapshot: EntitySnapshot) {
        self.lock()
            .insert((snapshot.owner.clone(), snapshot.id.clone()), snapshot);
    }

    pub fn get(&self, owner: &OwnerId, id: &EntityId) -> Option<EntitySnapshot> {
        self.lock().get(&(owner.clone(), id.clone())).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Makes every operation fail with `Unavailable` (e.g. the database is locked).
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), LocalStoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(LocalStoreError::Unavailable("local store is offline".into()))
        } else {
            Ok(())
        }
    }

    fn lock(&self) -> MutexGuard<'_, Entities> {
        self.entities.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl LocalStore for InMemoryLocalStore {
    async fn apply_optimistic(&self, task: &Task) -> Result<(), LocalStoreError> {
        self.check()?;
        let owner = task.owner();
        let mut entities = self.lock();

        let mut keys: Vec<(OwnerId, EntityId)> = task
            .targets()
            .iter()
            .map(|id| (owner.clone(), id.clone()))
            .collect();
        if task.is_bulk_entity() {
            keys.extend(
                entities
                    .values()
                    .filter(|e| &e.owner == owner)
                    .filter(|e| e.parent.as_ref().is_some_and(|p| task.targets().contains(p)))
                    .map(|e| (e.owner.clone(), e.id.clone())),
            );
        }

        let mut touched = 0usize;
        for key in keys {
            if let Some(entity) = entities.get_mut(&key) {
                entity.apply(task.kind());
                touched += 1;
            }
        }
        tracing::debug!(%owner, task_id = %task.id(), touched, "optimistic apply");
        Ok(())
    }

    async fn fetch_by_ids(
        &self,
        owner: &OwnerId,
        ids: &[EntityId],
    ) -> Result<Vec<EntitySnapshot>, LocalStoreError> {
        self.check()?;
        let entities = self.lock();
        Ok(ids
            .iter()
            .filter_map(|id| entities.get(&(owner.clone(), id.clone())))
            .filter(|e| !e.is_soft_deleted)
            .cloned()
            .collect())
    }

    async fn overwrite(&self, mut snapshot: EntitySnapshot) -> Result<(), LocalStoreError> {
        self.check()?;
        snapshot.is_soft_deleted = false;
        self.lock()
            .insert((snapshot.owner.clone(), snapshot.id.clone()), snapshot);
        Ok(())
    }

    async fn soft_delete(&self, owner: &OwnerId, ids: &[EntityId]) -> Result<(), LocalStoreError> {
        self.check()?;
        let mut entities = self.lock();
        for id in ids {
            if let Some(entity) = entities.get_mut(&(owner.clone(), id.clone())) {
                entity.is_soft_deleted = true;
            }
        }
        Ok(())
    }

    async fn purge_soft_deleted(
        &self,
        owner: &OwnerId,
        ids: &[EntityId],
    ) -> Result<usize, LocalStoreError> {
        self.check()?;
        let mut entities = self.lock();
        let mut purged = 0;
        for id in ids {
            let key = (owner.clone(), id.clone());
            if entities.get(&key).is_some_and(|e| e.is_soft_deleted) {
                entities.remove(&key);
                purged += 1;
            }
        }
        Ok(purged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{LabelId, TaskId, TaskKind, TaskRequest};
    use chrono::Utc;
    use ulid::Ulid;

    fn owner() -> OwnerId {
        OwnerId::new("alice")
    }

    fn task(kind: TaskKind, target: &str, bulk: bool) -> Task {
        TaskRequest::new(owner(), kind, [EntityId::new(target)])
            .unwrap()
            .bulk_entity(bulk)
            .into_task(TaskId::from_ulid(Ulid::new()), 1, Utc::now())
    }

    fn seeded() -> InMemoryLocalStore {
        let store = InMemoryLocalStore::new();
        store.seed(EntitySnapshot::new(owner(), "c1".into()).with_labels(["inbox"]));
        store.seed(
            EntitySnapshot::new(owner(), "m1".into())
                .with_parent("c1".into())
                .with_labels(["inbox"]),
        );
        store.seed(EntitySnapshot::new(OwnerId::new("bob"), "c1".into()).with_labels(["inbox"]));
        store
    }

    #[tokio::test]
    async fn bulk_mutation_fans_out_to_children() {
        let store = seeded();
        let starred = LabelId::new("starred");
        store
            .apply_optimistic(&task(TaskKind::Label { label: starred.clone() }, "c1", true))
            .await
            .unwrap();

        assert!(store.get(&owner(), &"c1".into()).unwrap().has_label(&starred));
        assert!(store.get(&owner(), &"m1".into()).unwrap().has_label(&starred));
        // 他の owner は触らない
        let bob = store.get(&OwnerId::new("bob"), &"c1".into()).unwrap();
        assert!(!bob.has_label(&starred));
    }

    #[tokio::test]
    async fn leaf_mutation_stays_on_the_leaf() {
        let store = seeded();
        let starred = LabelId::new("starred");
        store
            .apply_optimistic(&task(TaskKind::Label { label: starred.clone() }, "m1", false))
            .await
            .unwrap();

        assert!(store.get(&owner(), &"m1".into()).unwrap().has_label(&starred));
        assert!(!store.get(&owner(), &"c1".into()).unwrap().has_label(&starred));
    }

    #[tokio::test]
    async fn purge_only_removes_soft_deleted() {
        let store = seeded();
        let ids = [EntityId::new("c1"), EntityId::new("m1")];
        store.soft_delete(&owner(), &ids[..1]).await.unwrap();

        assert_eq!(store.purge_soft_deleted(&owner(), &ids).await.unwrap(), 1);
        assert!(store.get(&owner(), &"c1".into()).is_none());
        assert!(store.get(&owner(), &"m1".into()).is_some());
    }

    #[tokio::test]
    async fn soft_deleted_entities_are_hidden_from_fetch() {
        let store = seeded();
        let ids = [EntityId::new("c1"), EntityId::new("m1"), EntityId::new("nope")];
        store.soft_delete(&owner(), &ids[..1]).await.unwrap();

        let visible = store.fetch_by_ids(&owner(), &ids).await.unwrap();
        let visible: Vec<&str> = visible.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(visible, ["m1"]);

        store.overwrite(store.get(&owner(), &"c1".into()).unwrap()).await.unwrap();
        assert_eq!(store.fetch_by_ids(&owner(), &ids[..1]).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn overwrite_heals_soft_delete() {
        let store = seeded();
        store.soft_delete(&owner(), &["c1".into()]).await.unwrap();

        let mut server = store.get(&owner(), &"c1".into()).unwrap();
        assert!(server.is_soft_deleted);
        server.label_ids.clear();
        store.overwrite(server).await.unwrap();

        let healed = store.get(&owner(), &"c1".into()).unwrap();
        assert!(!healed.is_soft_deleted);
        assert!(healed.label_ids.is_empty());
    }

    #[tokio::test]
    async fn unavailable_store_rejects_writes() {
        let store = seeded();
        store.set_unavailable(true);
        let err = store
            .apply_optimistic(&task(TaskKind::MarkRead, "c1", false))
            .await
            .unwrap_err();
        assert!(matches!(err, LocalStoreError::Unavailable(_)));
    }
}
