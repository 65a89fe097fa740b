//! Segment embedding records, one per `(segment, model)`.
use crate::error::{MemoryError, Result};
use crate::memory_db::schema::*;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct EmbeddingStats {
    pub total_embeddings: usize,
    pub models: Vec<(String, usize)>,
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<EmbeddingRecord> {
    let bytes: Vec<u8> = row.get(2)?;
    let vector: Vec<f32> = bincode::deserialize(&bytes).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Blob, Box::new(e))
    })?;
    let dimension: i64 = row.get(4)?;
    let created_at: String = row.get(5)?;
    Ok(EmbeddingRecord {
        segment_id: row.get(0)?,
        conversation_id: row.get(1)?,
        vector,
        model_id: row.get(3)?,
        dimension: dimension as usize,
        created_at: parse_ts(&created_at)?,
    })
}

pub struct EmbeddingStore {
    pool: Arc<Pool<SqliteConnectionManager>>,
}

impl EmbeddingStore {
    pub fn new(pool: Arc<Pool<SqliteConnectionManager>>) -> Self {
        Self { pool }
    }

    fn get_conn(&self) -> Result<r2d2::PooledConnection<SqliteConnectionManager>> {
        Ok(self.pool.get()?)
    }

    pub fn store_with_conn(conn: &Connection, record: &EmbeddingRecord) -> Result<()> {
        if record.vector.len() != record.dimension {
            return Err(MemoryError::InvalidInput(format!(
                "vector has {} components, record says {}",
                record.vector.len(),
                record.dimension
            )));
        }
        let bytes = bincode::serialize(&record.vector)?;
        conn.execute(
            "INSERT OR REPLACE INTO embeddings
             (segment_id, conversation_id, vector, model_id, dimension, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                record.segment_id,
                record.conversation_id,
                bytes,
                record.model_id,
                record.dimension as i64,
                format_ts(&record.created_at)
            ],
        )?;
        Ok(())
    }

    pub fn store_embedding(&self, record: &EmbeddingRecord) -> Result<()> {
        let conn = self.get_conn()?;
        Self::store_with_conn(&conn, record)
    }

    pub fn get_embedding(&self, segment_id: SegmentId, model_id: &str) -> Result<Option<EmbeddingRecord>> {
        let conn = self.get_conn()?;
        let record = conn
            .query_row(
                "SELECT segment_id, conversation_id, vector, model_id, dimension, created_at
                 FROM embeddings WHERE segment_id = ?1 AND model_id = ?2",
                params![segment_id, model_id],
                record_from_row,
            )
            .optional()?;
        Ok(record)
    }

    /// All records of a conversation for one model, by segment id.
    pub fn get_embeddings(&self, conversation_id: &str, model_id: &str) -> Result<Vec<EmbeddingRecord>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT segment_id, conversation_id, vector, model_id, dimension, created_at
             FROM embeddings WHERE conversation_id = ?1 AND model_id = ?2
             ORDER BY segment_id",
        )?;
        let records = stmt
            .query_map(params![conversation_id, model_id], record_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    /// Drops records of any model other than `active_model_id`.
    pub fn delete_stale_embeddings(&self, conversation_id: &str, active_model_id: &str) -> Result<usize> {
        let conn = self.get_conn()?;
        let deleted = conn.execute(
            "DELETE FROM embeddings WHERE conversation_id = ?1 AND model_id != ?2",
            params![conversation_id, active_model_id],
        )?;
        if deleted > 0 {
            info!(
                "Removed {} stale embeddings from conversation {}",
                deleted, conversation_id
            );
        }
        Ok(deleted)
    }

    pub fn get_stats(&self) -> Result<EmbeddingStats> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT model_id, COUNT(*) FROM embeddings GROUP BY model_id ORDER BY model_id",
        )?;
        let models = stmt
            .query_map([], |row| {
                let count: i64 = row.get(1)?;
                Ok((row.get::<_, String>(0)?, count as usize))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(EmbeddingStats {
            total_embeddings: models.iter().map(|(_, c)| c).sum(),
            models,
        })
    }
}
