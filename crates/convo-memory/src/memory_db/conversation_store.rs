//! Conversation metadata, the append-only message log, and keyword lookup.

use crate::config::IndexProfile;
use crate::error::{MemoryError, Result};
use crate::memory_db::schema::*;
use crate::utils::TextUtils;
use chrono::{DateTime, Utc};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::types::Value;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::sync::Arc;
use tracing::debug;

const MESSAGE_COLUMNS: &str =
    "m.seq, m.id, m.conversation_id, m.author_id, m.content, m.normalized_content, m.timestamp, m.kind";

pub(crate) fn message_from_row(row: &Row<'_>) -> rusqlite::Result<StoredMessage> {
    let timestamp: String = row.get(6)?;
    let kind: String = row.get(7)?;
    Ok(StoredMessage {
        seq: row.get(0)?,
        id: row.get(1)?,
        conversation_id: row.get(2)?,
        author_id: row.get(3)?,
        content: row.get(4)?,
        normalized_content: row.get(5)?,
        timestamp: parse_ts(&timestamp)?,
        kind: kind.parse().map_err(|e: MemoryError| {
            rusqlite::Error::FromSqlConversionFailure(7, rusqlite::types::Type::Text, Box::new(e))
        })?,
    })
}

fn conversation_from_row(row: &Row<'_>) -> rusqlite::Result<Conversation> {
    let created_at: String = row.get(1)?;
    let last_active: String = row.get(2)?;
    let profile_json: String = row.get(5)?;
    let index_profile: IndexProfile = serde_json::from_str(&profile_json).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(5, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(Conversation {
        id: row.get(0)?,
        created_at: parse_ts(&created_at)?,
        last_active: parse_ts(&last_active)?,
        message_count: row.get(3)?,
        vector_enabled: row.get(4)?,
        index_profile,
        archived: row.get(6)?,
    })
}

pub struct ConversationStore {
    pool: Arc<Pool<SqliteConnectionManager>>,
}

impl ConversationStore {
    pub fn new(pool: Arc<Pool<SqliteConnectionManager>>) -> Self {
        Self { pool }
    }

    fn get_conn(&self) -> Result<r2d2::PooledConnection<SqliteConnectionManager>> {
        Ok(self.pool.get()?)
    }

    /// Creates the conversation row when missing. Returns whether it was created.
    pub fn ensure_conversation_with_conn(
        conn: &Connection,
        conversation_id: &str,
        at: &DateTime<Utc>,
        profile: &IndexProfile,
    ) -> Result<bool> {
        let ts = format_ts(at);
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO conversations
             (id, created_at, last_active, message_count, vector_enabled, index_profile)
             VALUES (?1, ?2, ?2, 0, ?3, ?4)",
            params![
                conversation_id,
                ts,
                profile.vector_enabled,
                serde_json::to_string(profile)?
            ],
        )?;
        Ok(inserted > 0)
    }

    /// Appends a message and bumps the conversation's counters in one
    /// transaction. An existing id yields `DuplicateWrite` and changes nothing.
    pub fn append_message(
        &self,
        conversation_id: &str,
        message: &NewMessage,
        default_profile: &IndexProfile,
    ) -> Result<StoredMessage> {
        if message.id.trim().is_empty() {
            return Err(MemoryError::InvalidInput("message id must not be empty".into()));
        }

        let mut conn = self.get_conn()?;
        let tx = conn.transaction()?;

        let existing: Option<String> = tx
            .query_row(
                "SELECT conversation_id FROM messages WHERE id = ?1",
                [&message.id],
                |row| row.get(0),
            )
            .optional()?;
        if existing.is_some() {
            return Err(MemoryError::DuplicateWrite(message.id.clone()));
        }

        Self::ensure_conversation_with_conn(&tx, conversation_id, &message.timestamp, default_profile)?;

        let normalized = TextUtils::normalize_content(&message.content);
        let ts = format_ts(&message.timestamp);
        tx.execute(
            "INSERT INTO messages
             (id, conversation_id, author_id, content, normalized_content, timestamp, kind)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                message.id,
                conversation_id,
                message.author_id,
                message.content,
                normalized,
                ts,
                message.kind.as_str()
            ],
        )?;
        let seq = tx.last_insert_rowid();

        tx.execute(
            "UPDATE conversations
             SET message_count = message_count + 1,
                 last_active = MAX(last_active, ?2),
                 archived = 0,
                 archived_at = NULL
             WHERE id = ?1",
            params![conversation_id, ts],
        )?;
        tx.commit()?;

        debug!("Stored message {} in conversation {}", message.id, conversation_id);
        Ok(StoredMessage {
            seq,
            id: message.id.clone(),
            conversation_id: conversation_id.to_string(),
            author_id: message.author_id.clone(),
            content: message.content.clone(),
            normalized_content: normalized,
            timestamp: message.timestamp,
            kind: message.kind,
        })
    }

    pub fn get_conversation(&self, conversation_id: &str) -> Result<Option<Conversation>> {
        let conn = self.get_conn()?;
        let conversation = conn
            .query_row(
                "SELECT id, created_at, last_active, message_count, vector_enabled,
                        index_profile, archived
                 FROM conversations WHERE id = ?1",
                [conversation_id],
                conversation_from_row,
            )
            .optional()?;
        Ok(conversation)
    }

    /// Creates or updates the conversation's index profile.
    pub fn set_profile(&self, conversation_id: &str, profile: &IndexProfile) -> Result<()> {
        let conn = self.get_conn()?;
        Self::ensure_conversation_with_conn(&conn, conversation_id, &Utc::now(), profile)?;
        conn.execute(
            "UPDATE conversations SET vector_enabled = ?2, index_profile = ?3 WHERE id = ?1",
            params![
                conversation_id,
                profile.vector_enabled,
                serde_json::to_string(profile)?
            ],
        )?;
        Ok(())
    }

    pub fn list_conversation_ids(&self, include_archived: bool) -> Result<Vec<String>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id FROM conversations WHERE archived = 0 OR ?1 ORDER BY created_at, id",
        )?;
        let ids = stmt
            .query_map([include_archived], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(ids)
    }

    /// Messages ordered by `(timestamp, seq)`.
    pub fn get_messages(
        &self,
        conversation_id: &str,
        range: &MessageRange,
    ) -> Result<Vec<StoredMessage>> {
        let conn = self.get_conn()?;
        let mut sql = format!(
            "SELECT {} FROM messages m WHERE m.conversation_id = ?",
            MESSAGE_COLUMNS
        );
        let mut values: Vec<Value> = vec![Value::Text(conversation_id.to_string())];
        if let Some(since) = &range.since {
            sql.push_str(" AND m.timestamp >= ?");
            values.push(Value::Text(format_ts(since)));
        }
        if let Some(until) = &range.until {
            sql.push_str(" AND m.timestamp <= ?");
            values.push(Value::Text(format_ts(until)));
        }
        sql.push_str(" ORDER BY m.timestamp, m.seq LIMIT ? OFFSET ?");
        values.push(Value::Integer(range.limit.map(|l| l as i64).unwrap_or(-1)));
        values.push(Value::Integer(range.offset as i64));

        let mut stmt = conn.prepare(&sql)?;
        let messages = stmt
            .query_map(rusqlite::params_from_iter(values), message_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(messages)
    }

    /// Messages by id, ordered by `(timestamp, seq)`. Unknown ids are skipped.
    pub fn get_messages_by_ids(&self, ids: &[String]) -> Result<Vec<StoredMessage>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.get_conn()?;
        let placeholders = vec!["?"; ids.len()].join(", ");
        let sql = format!(
            "SELECT {} FROM messages m WHERE m.id IN ({}) ORDER BY m.timestamp, m.seq",
            MESSAGE_COLUMNS, placeholders
        );
        let mut stmt = conn.prepare(&sql)?;
        let messages = stmt
            .query_map(rusqlite::params_from_iter(ids.iter()), message_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(messages)
    }

    /// Messages that belong to no segment; after a restart these form the
    /// open segment.
    pub fn get_unsegmented_messages(&self, conversation_id: &str) -> Result<Vec<StoredMessage>> {
        let conn = self.get_conn()?;
        let sql = format!(
            "SELECT {} FROM messages m
             LEFT JOIN segment_members sm ON sm.message_id = m.id
             WHERE m.conversation_id = ?1 AND sm.message_id IS NULL
             ORDER BY m.timestamp, m.seq",
            MESSAGE_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let messages = stmt
            .query_map([conversation_id], message_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(messages)
    }

    /// Case-insensitive token match over `normalized_content`. Newest first.
    pub fn keyword_search(
        &self,
        conversation_id: &str,
        query: &KeywordQuery,
    ) -> Result<Vec<KeywordMatch>> {
        if query.terms.is_empty() || query.limit == 0 {
            return Ok(Vec::new());
        }

        let mut sql = format!(
            "SELECT {}, sm.segment_id FROM messages m
             LEFT JOIN segment_members sm ON sm.message_id = m.id
             WHERE m.conversation_id = ?",
            MESSAGE_COLUMNS
        );
        let mut values: Vec<Value> = vec![Value::Text(conversation_id.to_string())];

        // LIKE narrows cheaply; has_token keeps only whole-word hits so the
        // LIMIT below counts real matches.
        let clauses = vec![
            "(m.normalized_content LIKE ? AND has_token(m.normalized_content, ?))";
            query.terms.len()
        ]
        .join(" OR ");
        sql.push_str(&format!(" AND ({})", clauses));
        for term in &query.terms {
            let term = term.to_lowercase();
            values.push(Value::Text(format!("%{}%", term)));
            values.push(Value::Text(term));
        }
        if !query.author_ids.is_empty() {
            let placeholders = vec!["?"; query.author_ids.len()].join(", ");
            sql.push_str(&format!(" AND m.author_id IN ({})", placeholders));
            values.extend(query.author_ids.iter().cloned().map(Value::Text));
        }
        if let Some(since) = &query.since {
            sql.push_str(" AND m.timestamp >= ?");
            values.push(Value::Text(format_ts(since)));
        }
        if let Some(until) = &query.until {
            sql.push_str(" AND m.timestamp <= ?");
            values.push(Value::Text(format_ts(until)));
        }
        if let Some(kind) = query.kind {
            sql.push_str(" AND m.kind = ?");
            values.push(Value::Text(kind.as_str().to_string()));
        }
        sql.push_str(" ORDER BY m.timestamp DESC, m.seq DESC LIMIT ?");
        values.push(Value::Integer(query.limit as i64));

        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(values), |row| {
                Ok((message_from_row(row)?, row.get::<_, Option<SegmentId>>(8)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut matches = Vec::new();
        for (message, segment_id) in rows {
            let positions: Vec<(String, usize)> = query
                .terms
                .iter()
                .flat_map(|term| {
                    let term = term.to_lowercase();
                    TextUtils::match_positions(&message.normalized_content, &term)
                        .into_iter()
                        .map(move |pos| (term.clone(), pos))
                })
                .collect();
            if positions.is_empty() {
                continue;
            }
            matches.push(KeywordMatch {
                message,
                segment_id,
                positions,
            });
            if matches.len() >= query.limit {
                break;
            }
        }
        debug!(
            "Keyword search in {} for {:?}: {} matches",
            conversation_id,
            query.terms,
            matches.len()
        );
        Ok(matches)
    }

    pub fn archive_conversation(&self, conversation_id: &str) -> Result<()> {
        let conn = self.get_conn()?;
        let updated = conn.execute(
            "UPDATE conversations SET archived = 1, archived_at = ?2 WHERE id = ?1",
            params![conversation_id, format_ts(&Utc::now())],
        )?;
        if updated == 0 {
            return Err(MemoryError::not_found("conversation", conversation_id));
        }
        Ok(())
    }

    /// Archived conversations whose last activity precedes `cutoff`.
    pub fn archived_before(&self, cutoff: &DateTime<Utc>) -> Result<Vec<String>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id FROM conversations WHERE archived = 1 AND last_active < ?1 ORDER BY id",
        )?;
        let ids = stmt
            .query_map([format_ts(cutoff)], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(ids)
    }
}
