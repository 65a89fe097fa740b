//! Segment records and their membership rows.

use crate::error::{MemoryError, Result};
use crate::memory_db::schema::*;
use chrono::{DateTime, Utc};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::types::Value;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::sync::Arc;
use tracing::debug;

const SEGMENT_COLUMNS: &str = "s.id, s.conversation_id, s.summary_text, s.coherence_score, \
     s.created_at, s.start_time, s.end_time, s.embedding_pending";

fn segment_from_row(row: &Row<'_>) -> rusqlite::Result<Segment> {
    let created_at: String = row.get(4)?;
    let start_time: String = row.get(5)?;
    let end_time: String = row.get(6)?;
    Ok(Segment {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        member_message_ids: Vec::new(),
        summary_text: row.get(2)?,
        coherence_score: row.get(3)?,
        created_at: parse_ts(&created_at)?,
        start_time: parse_ts(&start_time)?,
        end_time: parse_ts(&end_time)?,
        embedding_pending: row.get(7)?,
    })
}

fn load_members(conn: &Connection, segment: &mut Segment) -> rusqlite::Result<()> {
    let mut stmt = conn.prepare_cached(
        "SELECT message_id FROM segment_members WHERE segment_id = ?1 ORDER BY position",
    )?;
    segment.member_message_ids = stmt
        .query_map([segment.id], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<String>>>()?;
    Ok(())
}

fn query_segments(conn: &Connection, sql: &str, values: Vec<Value>) -> Result<Vec<Segment>> {
    let mut stmt = conn.prepare(sql)?;
    let mut segments = stmt
        .query_map(rusqlite::params_from_iter(values), segment_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    for segment in &mut segments {
        load_members(conn, segment)?;
    }
    Ok(segments)
}

pub struct SegmentStore {
    pool: Arc<Pool<SqliteConnectionManager>>,
}

impl SegmentStore {
    pub fn new(pool: Arc<Pool<SqliteConnectionManager>>) -> Self {
        Self { pool }
    }

    fn get_conn(&self) -> Result<r2d2::PooledConnection<SqliteConnectionManager>> {
        Ok(self.pool.get()?)
    }

    /// Inserts, or replaces in place when `segment.id` is set. Fails when a
    /// member already belongs to a different segment.
    pub fn upsert_with_conn(
        conn: &Connection,
        segment: &NewSegment,
        created_at: &DateTime<Utc>,
    ) -> Result<SegmentId> {
        if segment.member_message_ids.is_empty() {
            return Err(MemoryError::InvalidInput("segment must have at least one member".into()));
        }

        for message_id in &segment.member_message_ids {
            let owner: Option<SegmentId> = conn
                .query_row(
                    "SELECT segment_id FROM segment_members WHERE message_id = ?1",
                    [message_id],
                    |row| row.get(0),
                )
                .optional()?;
            if let Some(owner) = owner {
                if Some(owner) != segment.id {
                    return Err(MemoryError::InvalidInput(format!(
                        "message {} already belongs to segment {}",
                        message_id, owner
                    )));
                }
            }
        }

        let segment_id = match segment.id {
            Some(id) => {
                let updated = conn.execute(
                    "UPDATE segments
                     SET summary_text = ?2, coherence_score = ?3, start_time = ?4,
                         end_time = ?5, embedding_pending = ?6
                     WHERE id = ?1 AND conversation_id = ?7",
                    params![
                        id,
                        segment.summary_text,
                        segment.coherence_score,
                        format_ts(&segment.start_time),
                        format_ts(&segment.end_time),
                        segment.embedding_pending,
                        segment.conversation_id,
                    ],
                )?;
                if updated == 0 {
                    return Err(MemoryError::not_found("segment", id.to_string()));
                }
                conn.execute("DELETE FROM segment_members WHERE segment_id = ?1", [id])?;
                id
            }
            None => {
                conn.execute(
                    "INSERT INTO segments
                     (conversation_id, summary_text, coherence_score, created_at,
                      start_time, end_time, embedding_pending)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        segment.conversation_id,
                        segment.summary_text,
                        segment.coherence_score,
                        format_ts(created_at),
                        format_ts(&segment.start_time),
                        format_ts(&segment.end_time),
                        segment.embedding_pending,
                    ],
                )?;
                conn.last_insert_rowid()
            }
        };

        let mut stmt = conn.prepare_cached(
            "INSERT INTO segment_members (message_id, segment_id, position) VALUES (?1, ?2, ?3)",
        )?;
        for (position, message_id) in segment.member_message_ids.iter().enumerate() {
            stmt.execute(params![message_id, segment_id, position as i64])?;
        }
        Ok(segment_id)
    }

    pub fn upsert_segment(&self, segment: &NewSegment) -> Result<SegmentId> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction()?;
        let id = Self::upsert_with_conn(&tx, segment, &Utc::now())?;
        tx.commit()?;
        debug!(
            "Upserted segment {} ({} members) in conversation {}",
            id,
            segment.member_message_ids.len(),
            segment.conversation_id
        );
        Ok(id)
    }

    /// Removes the segment with its membership and embedding rows.
    pub fn delete_with_conn(conn: &Connection, segment_id: SegmentId) -> Result<bool> {
        conn.execute("DELETE FROM embeddings WHERE segment_id = ?1", [segment_id])?;
        conn.execute("DELETE FROM segment_members WHERE segment_id = ?1", [segment_id])?;
        let deleted = conn.execute("DELETE FROM segments WHERE id = ?1", [segment_id])?;
        Ok(deleted > 0)
    }

    pub fn delete_segment(&self, segment_id: SegmentId) -> Result<bool> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction()?;
        let deleted = Self::delete_with_conn(&tx, segment_id)?;
        tx.commit()?;
        Ok(deleted)
    }

    pub fn set_embedding_pending_with_conn(
        conn: &Connection,
        segment_id: SegmentId,
        pending: bool,
    ) -> Result<()> {
        conn.execute(
            "UPDATE segments SET embedding_pending = ?2 WHERE id = ?1",
            params![segment_id, pending],
        )?;
        Ok(())
    }

    /// Ordered member ids, empty when the segment no longer exists.
    pub fn member_ids_with_conn(conn: &Connection, segment_id: SegmentId) -> Result<Vec<String>> {
        let mut stmt = conn.prepare_cached(
            "SELECT message_id FROM segment_members WHERE segment_id = ?1 ORDER BY position",
        )?;
        let ids = stmt
            .query_map([segment_id], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(ids)
    }

    pub fn get_segment(&self, segment_id: SegmentId) -> Result<Option<Segment>> {
        let conn = self.get_conn()?;
        let segment = conn
            .query_row(
                &format!("SELECT {} FROM segments s WHERE s.id = ?1", SEGMENT_COLUMNS),
                [segment_id],
                segment_from_row,
            )
            .optional()?;
        match segment {
            Some(mut segment) => {
                load_members(&conn, &mut segment)?;
                Ok(Some(segment))
            }
            None => Ok(None),
        }
    }

    /// Segments ordered by `(start_time, id)`, or newest first on request.
    pub fn get_segments(&self, conversation_id: &str, filter: &SegmentFilter) -> Result<Vec<Segment>> {
        let mut sql = format!(
            "SELECT {} FROM segments s WHERE s.conversation_id = ?",
            SEGMENT_COLUMNS
        );
        let mut values: Vec<Value> = vec![Value::Text(conversation_id.to_string())];
        if let Some(since) = &filter.since {
            sql.push_str(" AND s.end_time >= ?");
            values.push(Value::Text(format_ts(since)));
        }
        if let Some(until) = &filter.until {
            sql.push_str(" AND s.start_time <= ?");
            values.push(Value::Text(format_ts(until)));
        }
        if let Some(pending) = filter.embedding_pending {
            sql.push_str(" AND s.embedding_pending = ?");
            values.push(Value::Integer(pending as i64));
        }
        if filter.newest_first {
            sql.push_str(" ORDER BY s.end_time DESC, s.id DESC LIMIT ?");
        } else {
            sql.push_str(" ORDER BY s.start_time, s.id LIMIT ?");
        }
        values.push(Value::Integer(filter.limit.map(|l| l as i64).unwrap_or(-1)));

        let conn = self.get_conn()?;
        query_segments(&conn, &sql, values)
    }

    pub fn get_segments_by_ids(&self, ids: &[SegmentId]) -> Result<Vec<Segment>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; ids.len()].join(", ");
        let sql = format!(
            "SELECT {} FROM segments s WHERE s.id IN ({}) ORDER BY s.start_time, s.id",
            SEGMENT_COLUMNS, placeholders
        );
        let values = ids.iter().map(|id| Value::Integer(*id)).collect();
        let conn = self.get_conn()?;
        query_segments(&conn, &sql, values)
    }

    /// The most recent segment of a conversation, if any.
    pub fn latest_segment(&self, conversation_id: &str) -> Result<Option<Segment>> {
        let sql = format!(
            "SELECT {} FROM segments s WHERE s.conversation_id = ?
             ORDER BY s.end_time DESC, s.id DESC LIMIT 1",
            SEGMENT_COLUMNS
        );
        let conn = self.get_conn()?;
        let segments = query_segments(&conn, &sql, vec![Value::Text(conversation_id.to_string())])?;
        Ok(segments.into_iter().next())
    }

    /// Segments with no embedding record for `model_id`, oldest first.
    pub fn segments_missing_embedding(
        &self,
        conversation_id: &str,
        model_id: &str,
        limit: usize,
    ) -> Result<Vec<Segment>> {
        let sql = format!(
            "SELECT {} FROM segments s
             WHERE s.conversation_id = ?
               AND NOT EXISTS (
                   SELECT 1 FROM embeddings e WHERE e.segment_id = s.id AND e.model_id = ?
               )
             ORDER BY s.start_time, s.id LIMIT ?",
            SEGMENT_COLUMNS
        );
        let values = vec![
            Value::Text(conversation_id.to_string()),
            Value::Text(model_id.to_string()),
            Value::Integer(limit as i64),
        ];
        let conn = self.get_conn()?;
        query_segments(&conn, &sql, values)
    }

    /// Segments flagged `embedding_pending` across all conversations.
    pub fn pending_segments(&self, limit: usize) -> Result<Vec<Segment>> {
        let sql = format!(
            "SELECT {} FROM segments s WHERE s.embedding_pending = 1
             ORDER BY s.created_at, s.id LIMIT ?",
            SEGMENT_COLUMNS
        );
        let conn = self.get_conn()?;
        query_segments(&conn, &sql, vec![Value::Integer(limit as i64)])
    }

    /// Deletes every segment of a conversation. Messages are kept.
    pub fn delete_for_conversation_with_conn(conn: &Connection, conversation_id: &str) -> Result<usize> {
        conn.execute("DELETE FROM embeddings WHERE conversation_id = ?1", [conversation_id])?;
        conn.execute(
            "DELETE FROM segment_members WHERE segment_id IN
                (SELECT id FROM segments WHERE conversation_id = ?1)",
            [conversation_id],
        )?;
        let deleted = conn.execute("DELETE FROM segments WHERE conversation_id = ?1", [conversation_id])?;
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use crate::config::IndexProfile;
    use crate::error::MemoryError;
    use crate::memory_db::test_support::open_test_db;
    use crate::memory_db::*;
    use chrono::{Duration, TimeZone, Utc};

    fn seed(db: &MemoryDatabase, ids: &[&str]) -> chrono::DateTime<Utc> {
        let base = Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap();
        for (i, id) in ids.iter().enumerate() {
            let m = NewMessage::human(*id, "alice", format!("message {}", id), base + Duration::minutes(i as i64));
            db.conversations.append_message("c1", &m, &IndexProfile::default()).unwrap();
        }
        base
    }

    fn new_segment(ids: &[&str], base: chrono::DateTime<Utc>) -> NewSegment {
        NewSegment {
            id: None,
            conversation_id: "c1".into(),
            member_message_ids: ids.iter().map(|s| s.to_string()).collect(),
            summary_text: Some("summary".into()),
            coherence_score: 0.8,
            start_time: base,
            end_time: base + Duration::minutes(ids.len() as i64),
            embedding_pending: true,
        }
    }

    #[test]
    fn membership_is_a_partition() {
        let (_dir, db) = open_test_db();
        let base = seed(&db, &["a", "b", "c"]);

        let first = db.segments.upsert_segment(&new_segment(&["a", "b"], base)).unwrap();
        let err = db.segments.upsert_segment(&new_segment(&["b", "c"], base)).unwrap_err();
        assert!(matches!(err, MemoryError::InvalidInput(_)));

        // Replacing in place may keep its own members.
        let mut grown = new_segment(&["a", "b", "c"], base);
        grown.id = Some(first);
        assert_eq!(db.segments.upsert_segment(&grown).unwrap(), first);

        let segment = db.segments.get_segment(first).unwrap().unwrap();
        assert_eq!(segment.member_message_ids, vec!["a", "b", "c"]);
        assert!(db.conversations.get_unsegmented_messages("c1").unwrap().is_empty());
    }

    #[test]
    fn filters_and_missing_embeddings() {
        let (_dir, db) = open_test_db();
        let base = seed(&db, &["a", "b", "c", "d"]);
        let s1 = db.segments.upsert_segment(&new_segment(&["a", "b"], base)).unwrap();
        let mut later = new_segment(&["c", "d"], base + Duration::hours(1));
        later.embedding_pending = false;
        let s2 = db.segments.upsert_segment(&later).unwrap();

        let pending = db
            .segments
            .get_segments("c1", &SegmentFilter { embedding_pending: Some(true), ..Default::default() })
            .unwrap();
        assert_eq!(pending.iter().map(|s| s.id).collect::<Vec<_>>(), vec![s1]);

        let missing = db.segments.segments_missing_embedding("c1", "m-1", 10).unwrap();
        assert_eq!(missing.len(), 2);
        assert_eq!(db.segments.latest_segment("c1").unwrap().unwrap().id, s2);

        assert!(db.segments.delete_segment(s1).unwrap());
        assert!(db.segments.get_segment(s1).unwrap().is_none());
        assert_eq!(db.conversations.get_unsegmented_messages("c1").unwrap().len(), 2);
    }

    #[test]
    fn empty_segment_rejected() {
        let (_dir, db) = open_test_db();
        let base = seed(&db, &["a"]);
        let err = db.segments.upsert_segment(&new_segment(&[], base)).unwrap_err();
        assert!(matches!(err, MemoryError::InvalidInput(_)));
    }
}
