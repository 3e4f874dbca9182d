//! Repository traits the hub depends on, and the records they exchange.

use chorus_core::{ClientId, Identity, RoomId};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// A persisted room.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomRecord {
    pub id: RoomId,
    pub name: String,
    pub private: bool,
    pub created_at: String,
}

/// A persisted user.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: ClientId,
    pub name: String,
    pub created_at: String,
}

impl Identity for UserRecord {
    fn id(&self) -> &str {
        self.id.as_str()
    }

    fn name(&self) -> &str {
        &self.name
    }
}

pub trait RoomRepository: Send + Sync {
    /// Persist a room. Adding a name that already exists is a no-op.
    fn add_room(&self, id: &RoomId, name: &str, private: bool) -> Result<(), StoreError>;

    fn find_room_by_name(&self, name: &str) -> Result<Option<RoomRecord>, StoreError>;
}

pub trait UserRepository: Send + Sync {
    /// Persist a user. Re-adding an existing id refreshes the name.
    fn add_user(&self, id: &ClientId, name: &str) -> Result<(), StoreError>;

    fn remove_user(&self, id: &ClientId) -> Result<(), StoreError>;

    fn find_user_by_id(&self, id: &ClientId) -> Result<Option<UserRecord>, StoreError>;

    fn get_all_users(&self) -> Result<Vec<UserRecord>, StoreError>;
}
