use chrono::Utc;
use rusqlite::OptionalExtension;
use tracing::instrument;

use chorus_core::RoomId;

use crate::database::Database;
use crate::error::StoreError;
use crate::repository::{RoomRecord, RoomRepository};

#[derive(Clone)]
pub struct RoomRepo {
    db: Database,
}

impl RoomRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

fn row_to_room(row: &rusqlite::Row<'_>) -> rusqlite::Result<RoomRecord> {
    Ok(RoomRecord {
        id: RoomId::from_raw(row.get::<_, String>(0)?),
        name: row.get(1)?,
        private: row.get(2)?,
        created_at: row.get(3)?,
    })
}

impl RoomRepository for RoomRepo {
    #[instrument(skip(self), fields(room_id = %id))]
    fn add_room(&self, id: &RoomId, name: &str, private: bool) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO rooms (id, name, private, created_at) VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![id.as_str(), name, private, Utc::now().to_rfc3339()],
            )?;
            Ok(())
        })
    }

    #[instrument(skip(self))]
    fn find_room_by_name(&self, name: &str) -> Result<Option<RoomRecord>, StoreError> {
        self.db.with_conn(|conn| {
            let room = conn
                .query_row(
                    "SELECT id, name, private, created_at FROM rooms WHERE name = ?1",
                    [name],
                    row_to_room,
                )
                .optional()?;
            Ok(room)
        })
    }
}
