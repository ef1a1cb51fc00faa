//! RemoteExecutor port - サーバーへの実際の変更リクエスト
//!
//! タイムアウトは実装側の責務で、`RemoteError::Transient` として返します。

use async_trait::async_trait;

use crate::domain::{RemoteError, Task};

#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    async fn execute(&self, task: &Task) -> Result<(), RemoteError>;
}
