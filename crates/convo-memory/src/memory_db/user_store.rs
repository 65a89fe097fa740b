use crate::error::Result;
use crate::memory_db::schema::*;
use chrono::{DateTime, Utc};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, Row};
use std::sync::Arc;

fn user_from_row(row: &Row<'_>) -> rusqlite::Result<UserInfo> {
    let last_active: Option<String> = row.get(2)?;
    Ok(UserInfo {
        user_id: row.get(0)?,
        display_name: row.get(1)?,
        last_active: last_active.as_deref().map(parse_ts).transpose()?,
        free_text_data: row.get(3)?,
    })
}

/// Participant metadata. Message authors reference users weakly: a message
/// may name an author that has no row here.
pub struct UserStore {
    pool: Arc<Pool<SqliteConnectionManager>>,
}

impl UserStore {
    pub fn new(pool: Arc<Pool<SqliteConnectionManager>>) -> Self {
        Self { pool }
    }

    fn get_conn(&self) -> Result<r2d2::PooledConnection<SqliteConnectionManager>> {
        Ok(self.pool.get()?)
    }

    pub fn upsert_user(&self, user: &UserInfo) -> Result<()> {
        let conn = self.get_conn()?;
        conn.execute(
            "INSERT INTO users (user_id, display_name, last_active, free_text_data)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(user_id) DO UPDATE SET
                display_name = excluded.display_name,
                last_active = COALESCE(excluded.last_active, users.last_active),
                free_text_data = excluded.free_text_data",
            params![
                user.user_id,
                user.display_name,
                user.last_active.as_ref().map(format_ts),
                user.free_text_data
            ],
        )?;
        Ok(())
    }

    /// Records activity; unknown users get a row named after their id.
    pub fn touch_with_conn(conn: &Connection, user_id: &str, at: &DateTime<Utc>) -> Result<()> {
        let ts = format_ts(at);
        conn.execute(
            "INSERT INTO users (user_id, display_name, last_active) VALUES (?1, ?1, ?2)
             ON CONFLICT(user_id) DO UPDATE SET
                last_active = MAX(COALESCE(users.last_active, ''), excluded.last_active)",
            params![user_id, ts],
        )?;
        Ok(())
    }

    pub fn touch_user(&self, user_id: &str, at: &DateTime<Utc>) -> Result<()> {
        let conn = self.get_conn()?;
        Self::touch_with_conn(&conn, user_id, at)
    }

    /// Known users among `ids`, in the order requested.
    pub fn get_users(&self, ids: &[String]) -> Result<Vec<UserInfo>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.get_conn()?;
        let placeholders = vec!["?"; ids.len()].join(", ");
        let mut stmt = conn.prepare(&format!(
            "SELECT user_id, display_name, last_active, free_text_data
             FROM users WHERE user_id IN ({})",
            placeholders
        ))?;
        let found = stmt
            .query_map(rusqlite::params_from_iter(ids.iter()), user_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut ordered = Vec::with_capacity(found.len());
        for id in ids {
            if let Some(user) = found.iter().find(|u| &u.user_id == id) {
                if !ordered.iter().any(|u: &UserInfo| &u.user_id == id) {
                    ordered.push(user.clone());
                }
            }
        }
        Ok(ordered)
    }
}
