//! WriteGate - owner ごとのローカル書き込みの直列化
//!
//! Façade の楽観的 apply と Reconciler の上書きが同じ owner で交互に混ざらないようにします。

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::domain::OwnerId;

#[derive(Debug, Default)]
pub struct WriteGate {
    lanes: Mutex<HashMap<OwnerId, Arc<AsyncMutex<()>>>>,
}

impl WriteGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Held until the returned guard is dropped. Different owners never wait on each other.
    pub async fn enter(&self, owner: &OwnerId) -> OwnedMutexGuard<()> {
        let lane = {
            let mut lanes = self.lanes.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(lanes.entry(owner.clone()).or_default())
        };
        lane.lock_owned().await
    }
}
