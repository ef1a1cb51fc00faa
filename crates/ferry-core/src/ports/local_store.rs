//! LocalStore port - 楽観的ローカル状態（UI が読む投影）
//!
//! 実装は ID でインデックスされたコレクションと soft-delete フラグを持っていれば十分です。

use async_trait::async_trait;

use crate::domain::{EntityId, EntitySnapshot, LocalStoreError, OwnerId, Task};

#[async_trait]
pub trait LocalStore: Send + Sync {
    /// Applies the task's mutation to every target. For a bulk-entity task the
    /// mutation also fans out to the children of each target.
    async fn apply_optimistic(&self, task: &Task) -> Result<(), LocalStoreError>;

    /// Unknown and soft-deleted ids are skipped.
    async fn fetch_by_ids(
        &self,
        owner: &OwnerId,
        ids: &[EntityId],
    ) -> Result<Vec<EntitySnapshot>, LocalStoreError>;

    /// Last-writer-wins from the server. Clears the soft-delete flag.
    async fn overwrite(&self, snapshot: EntitySnapshot) -> Result<(), LocalStoreError>;

    async fn soft_delete(&self, owner: &OwnerId, ids: &[EntityId]) -> Result<(), LocalStoreError>;

    /// Removes the given ids if they are soft-deleted. Returns how many were removed.
    async fn purge_soft_deleted(
        &self,
        owner: &OwnerId,
        ids: &[EntityId],
    ) -> Result<usize, LocalStoreError>;
}
