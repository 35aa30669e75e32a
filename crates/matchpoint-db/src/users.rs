//! Mirror of the platform's user directory. The directory is authoritative;
//! these rows exist so participant/message foreign keys resolve locally.

use rusqlite::{Connection, OptionalExtension, params};
use uuid::Uuid;

use matchpoint_types::models::User;

use crate::error::Result;
use crate::models::parse_uuid;
use crate::{Database, now_str, parse_dt};

impl Database {
    /// Refresh the mirror row for an authenticated user.
    pub fn upsert_user(&self, id: Uuid, display_name: &str) -> Result<()> {
        self.with_tx(|tx| {
            tx.execute(
                "INSERT INTO users (id, display_name, created_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(id) DO UPDATE SET display_name = excluded.display_name",
                params![id.to_string(), display_name, now_str()],
            )?;
            Ok(())
        })
    }

    pub fn get_user(&self, id: Uuid) -> Result<Option<User>> {
        self.with_conn(|conn| {
            let row: Option<(String, Option<String>, String)> = conn
                .query_row(
                    "SELECT id, display_name, created_at FROM users WHERE id = ?1",
                    params![id.to_string()],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )
                .optional()?;
            row.map(|(id, display_name, created_at)| {
                Ok(User {
                    id: parse_uuid(&id)?,
                    display_name,
                    created_at: parse_dt(&created_at)?,
                })
            })
            .transpose()
        })
    }
}

/// Insert a stub row for a user the directory has referenced but who has not
/// authenticated against this service yet. Their display name fills in on
/// first authenticated request.
pub(crate) fn ensure_user(conn: &Connection, id: Uuid) -> Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO users (id, display_name, created_at) VALUES (?1, NULL, ?2)",
        params![id.to_string(), now_str()],
    )?;
    Ok(())
}
