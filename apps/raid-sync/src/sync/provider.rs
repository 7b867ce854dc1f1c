use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::error::SyncError;

/// Source of the authoritative room and listing views.
///
/// Implementations must return committed state. A missing room is `Ok(None)`;
/// `Err(SyncError::Store)` means the store could not be read right now.
#[async_trait]
pub trait RoomSnapshotProvider: Send + Sync {
    async fn get_room(&self, room_id: &str) -> Result<Option<Value>, SyncError>;
    async fn get_listing(&self) -> Result<Value, SyncError>;
}

/// Display details shown next to a user in presence lists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DisplayInfo {
    pub display_name: String,
    pub avatar_url: Option<String>,
}

#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn display_info(&self, user_id: &str) -> Result<Option<DisplayInfo>, SyncError>;
}
