//! InMemoryQueueStore - 開発用・テスト用のキュー永続化先
//!
//! プロセスが生きている間だけ保持します。`Arc` で共有すれば「再起動」をテストで再現できます。

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;

use crate::domain::{OwnerId, StoreError};
use crate::ports::QueueStore;
use crate::queue::QueueSnapshot;

#[derive(Debug, Default)]
pub struct InMemoryQueueStore {
    snapshots: Mutex<HashMap<OwnerId, QueueSnapshot>>,
}

impl InMemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl QueueStore for InMemoryQueueStore {
    async fn load(&self, owner: &OwnerId) -> Result<Option<QueueSnapshot>, StoreError> {
        let snapshots = self.snapshots.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(snapshots.get(owner).cloned())
    }

    async fn save(&self, owner: &OwnerId, snapshot: &QueueSnapshot) -> Result<(), StoreError> {
        let mut snapshots = self.snapshots.lock().unwrap_or_else(PoisonError::into_inner);
        snapshots.insert(owner.clone(), snapshot.clone());
        Ok(())
    }

    async fn owners(&self) -> Result<Vec<OwnerId>, StoreError> {
        let snapshots = self.snapshots.lock().unwrap_or_else(PoisonError::into_inner);
        let mut owners: Vec<OwnerId> = snapshots.keys().cloned().collect();
        owners.sort();
        Ok(owners)
    }
}
