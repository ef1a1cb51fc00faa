//! Status - owner ごとのキュー状況（CLI や UI のインジケータ向け）

use serde::Serialize;

use crate::domain::OwnerId;
use crate::queue::QueueCounts;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionStatus {
    pub owner: OwnerId,
    pub online: bool,
    pub counts: QueueCounts,
}

impl SessionStatus {
    /// Nothing left to send for this owner.
    pub fn is_idle(&self) -> bool {
        self.counts.pending == 0 && self.counts.in_flight == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_for_display() {
        let status = SessionStatus {
            owner: OwnerId::new("alice"),
            online: true,
            counts: QueueCounts {
                pending: 2,
                in_flight: 1,
                succeeded: 5,
                failed: 0,
            },
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["owner"], "alice");
        assert_eq!(json["counts"]["pending"], 2);
        assert!(!status.is_idle());
    }
}
