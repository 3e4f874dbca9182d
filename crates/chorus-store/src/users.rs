use chrono::Utc;
use rusqlite::OptionalExtension;
use tracing::instrument;

use chorus_core::ClientId;

use crate::database::Database;
use crate::error::StoreError;
use crate::repository::{UserRecord, UserRepository};

#[derive(Clone)]
pub struct UserRepo {
    db: Database,
}

impl UserRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

fn row_to_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<UserRecord> {
    Ok(UserRecord {
        id: ClientId::from_raw(row.get::<_, String>(0)?),
        name: row.get(1)?,
        created_at: row.get(2)?,
    })
}

impl UserRepository for UserRepo {
    #[instrument(skip(self), fields(user_id = %id))]
    fn add_user(&self, id: &ClientId, name: &str) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO users (id, name, created_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(id) DO UPDATE SET name = excluded.name",
                rusqlite::params![id.as_str(), name, Utc::now().to_rfc3339()],
            )?;
            Ok(())
        })
    }

    #[instrument(skip(self), fields(user_id = %id))]
    fn remove_user(&self, id: &ClientId) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute("DELETE FROM users WHERE id = ?1", [id.as_str()])?;
            Ok(())
        })
    }

    #[instrument(skip(self), fields(user_id = %id))]
    fn find_user_by_id(&self, id: &ClientId) -> Result<Option<UserRecord>, StoreError> {
        self.db.with_conn(|conn| {
            let user = conn
                .query_row(
                    "SELECT id, name, created_at FROM users WHERE id = ?1",
                    [id.as_str()],
                    row_to_user,
                )
                .optional()?;
            Ok(user)
        })
    }

    #[instrument(skip(self))]
    fn get_all_users(&self) -> Result<Vec<UserRecord>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT id, name, created_at FROM users ORDER BY created_at ASC")?;
            let rows = stmt
                .query_map([], row_to_user)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }
}
