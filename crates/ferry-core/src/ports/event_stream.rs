//! EventStream port - サーバーの正本（変更ログ）

use async_trait::async_trait;

use crate::domain::{EntityId, EntitySnapshot, EventBatch, EventCursor, EventStreamError, OwnerId};

#[async_trait]
pub trait EventStream: Send + Sync {
    /// Changes after `cursor` (`None` = from the beginning of the retained log).
    async fn fetch_since(
        &self,
        owner: &OwnerId,
        cursor: Option<&EventCursor>,
    ) -> Result<EventBatch, EventStreamError>;

    /// Authoritative state of specific entities. Ids missing from the result
    /// no longer exist on the server.
    async fn fetch_entities(
        &self,
        owner: &OwnerId,
        ids: &[EntityId],
    ) -> Result<Vec<EntitySnapshot>, EventStreamError>;
}
