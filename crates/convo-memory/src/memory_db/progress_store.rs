//! Persisted re-embedding progress, one row per conversation.

use crate::error::Result;
use crate::memory_db::schema::*;
use chrono::Utc;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension, Row};
use std::sync::Arc;

fn progress_from_row(row: &Row<'_>) -> rusqlite::Result<MigrationProgress> {
    let status: String = row.get(2)?;
    let updated_at: String = row.get(4)?;
    Ok(MigrationProgress {
        conversation_id: row.get(0)?,
        model_id: row.get(1)?,
        status: status.parse().map_err(|e: crate::error::MemoryError| {
            rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e))
        })?,
        segments_migrated: row.get(3)?,
        updated_at: parse_ts(&updated_at)?,
    })
}

pub struct MigrationProgressStore {
    pool: Arc<Pool<SqliteConnectionManager>>,
}

impl MigrationProgressStore {
    pub fn new(pool: Arc<Pool<SqliteConnectionManager>>) -> Self {
        Self { pool }
    }

    fn get_conn(&self) -> Result<r2d2::PooledConnection<SqliteConnectionManager>> {
        Ok(self.pool.get()?)
    }

    pub fn get(&self, conversation_id: &str) -> Result<Option<MigrationProgress>> {
        let conn = self.get_conn()?;
        let progress = conn
            .query_row(
                "SELECT conversation_id, model_id, status, segments_migrated, updated_at
                 FROM migration_progress WHERE conversation_id = ?1",
                [conversation_id],
                progress_from_row,
            )
            .optional()?;
        Ok(progress)
    }

    /// Starts tracking `model_id` for a conversation. Progress recorded for
    /// the same model is kept so a restarted job resumes.
    pub fn begin(&self, conversation_id: &str, model_id: &str) -> Result<MigrationProgress> {
        let conn = self.get_conn()?;
        conn.execute(
            "INSERT INTO migration_progress
             (conversation_id, model_id, status, segments_migrated, updated_at)
             VALUES (?1, ?2, 'pending', 0, ?3)
             ON CONFLICT(conversation_id) DO UPDATE SET
                status = CASE WHEN migration_progress.model_id = excluded.model_id
                              THEN migration_progress.status ELSE 'pending' END,
                segments_migrated = CASE WHEN migration_progress.model_id = excluded.model_id
                              THEN migration_progress.segments_migrated ELSE 0 END,
                model_id = excluded.model_id,
                updated_at = excluded.updated_at",
            params![conversation_id, model_id, format_ts(&Utc::now())],
        )?;
        drop(conn);
        self.get(conversation_id)?
            .ok_or_else(|| crate::error::MemoryError::not_found("migration progress", conversation_id))
    }

    pub fn record(
        &self,
        conversation_id: &str,
        status: MigrationStatus,
        newly_migrated: i64,
    ) -> Result<()> {
        let conn = self.get_conn()?;
        conn.execute(
            "UPDATE migration_progress
             SET status = ?2, segments_migrated = segments_migrated + ?3, updated_at = ?4
             WHERE conversation_id = ?1",
            params![
                conversation_id,
                status.as_str(),
                newly_migrated,
                format_ts(&Utc::now())
            ],
        )?;
        Ok(())
    }

    /// Conversations not yet complete for `model_id`.
    pub fn incomplete(&self, model_id: &str) -> Result<Vec<MigrationProgress>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT conversation_id, model_id, status, segments_migrated, updated_at
             FROM migration_progress
             WHERE model_id = ?1 AND status != 'complete'
             ORDER BY conversation_id",
        )?;
        let rows = stmt
            .query_map([model_id], progress_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}
