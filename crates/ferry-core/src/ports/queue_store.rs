//! QueueStore port - キュー状態の永続化
//!
//! owner 単位で丸ごと保存・読み込みします。`save` が返った時点で永続化済みであること。

use async_trait::async_trait;

use crate::domain::{OwnerId, StoreError};
use crate::queue::QueueSnapshot;

#[async_trait]
pub trait QueueStore: Send + Sync {
    /// `None` when nothing was ever saved for the owner.
    async fn load(&self, owner: &OwnerId) -> Result<Option<QueueSnapshot>, StoreError>;

    async fn save(&self, owner: &OwnerId, snapshot: &QueueSnapshot) -> Result<(), StoreError>;

    /// Owners with persisted state.
    async fn owners(&self) -> Result<Vec<OwnerId>, StoreError>;
}
