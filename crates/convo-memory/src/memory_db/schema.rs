//! Row types and the base schema of the memory database.

use crate::config::IndexProfile;
use crate::error::{MemoryError, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub type SegmentId = i64;

/// Fixed-width RFC 3339 so that lexical order in SQLite equals time order.
pub fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn parse_ts(raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Human,
    System,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Human => "human",
            MessageKind::System => "system",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageKind {
    type Err = MemoryError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "human" => Ok(MessageKind::Human),
            "system" => Ok(MessageKind::System),
            other => Err(MemoryError::InvalidInput(format!("unknown message kind '{}'", other))),
        }
    }
}

/// A conversation's metadata row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
    pub message_count: i64,
    pub vector_enabled: bool,
    pub index_profile: IndexProfile,
    pub archived: bool,
}

/// An inbound message as handed over by the connector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewMessage {
    pub id: String,
    pub author_id: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub kind: MessageKind,
}

impl NewMessage {
    pub fn human(
        id: impl Into<String>,
        author_id: impl Into<String>,
        content: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            author_id: author_id.into(),
            content: content.into(),
            timestamp,
            kind: MessageKind::Human,
        }
    }
}

/// Immutable stored message. `seq` is the insertion order and breaks
/// timestamp ties.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub seq: i64,
    pub id: String,
    pub conversation_id: String,
    pub author_id: String,
    pub content: String,
    pub normalized_content: String,
    pub timestamp: DateTime<Utc>,
    pub kind: MessageKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub id: SegmentId,
    pub conversation_id: String,
    /// Ordered by message time; never empty.
    pub member_message_ids: Vec<String>,
    pub summary_text: Option<String>,
    pub coherence_score: f32,
    pub created_at: DateTime<Utc>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub embedding_pending: bool,
}

/// Segment write. `id = Some` replaces an existing segment in place.
#[derive(Debug, Clone)]
pub struct NewSegment {
    pub id: Option<SegmentId>,
    pub conversation_id: String,
    pub member_message_ids: Vec<String>,
    pub summary_text: Option<String>,
    pub coherence_score: f32,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub embedding_pending: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingRecord {
    pub segment_id: SegmentId,
    pub conversation_id: String,
    pub vector: Vec<f32>,
    pub model_id: String,
    pub dimension: usize,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserInfo {
    pub user_id: String,
    pub display_name: String,
    pub last_active: Option<DateTime<Utc>>,
    pub free_text_data: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationStatus {
    Pending,
    InProgress,
    Complete,
}

impl MigrationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MigrationStatus::Pending => "pending",
            MigrationStatus::InProgress => "in_progress",
            MigrationStatus::Complete => "complete",
        }
    }
}

impl FromStr for MigrationStatus {
    type Err = MemoryError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(MigrationStatus::Pending),
            "in_progress" => Ok(MigrationStatus::InProgress),
            "complete" => Ok(MigrationStatus::Complete),
            other => Err(MemoryError::InvalidInput(format!("unknown migration status '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationProgress {
    pub conversation_id: String,
    pub model_id: String,
    pub status: MigrationStatus,
    pub segments_migrated: i64,
    pub updated_at: DateTime<Utc>,
}

/// Time and paging bounds for `get_messages`.
#[derive(Debug, Clone, Default)]
pub struct MessageRange {
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub offset: usize,
    pub limit: Option<usize>,
}

impl MessageRange {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn between(since: DateTime<Utc>, until: DateTime<Utc>) -> Self {
        Self {
            since: Some(since),
            until: Some(until),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SegmentFilter {
    /// Segments ending at or after this instant.
    pub since: Option<DateTime<Utc>>,
    /// Segments starting at or before this instant.
    pub until: Option<DateTime<Utc>>,
    pub embedding_pending: Option<bool>,
    pub limit: Option<usize>,
    /// Order by `(end_time, id)` descending instead.
    pub newest_first: bool,
}

/// Keyword lookup parameters; all filters are conjunctive.
#[derive(Debug, Clone, Default)]
pub struct KeywordQuery {
    pub terms: Vec<String>,
    pub author_ids: Vec<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub kind: Option<MessageKind>,
    pub limit: usize,
}

/// A message that matched at least one query term.
#[derive(Debug, Clone)]
pub struct KeywordMatch {
    pub message: StoredMessage,
    /// `None` while the message still sits in the open segment.
    pub segment_id: Option<SegmentId>,
    /// `(term, byte offset)` into `normalized_content`.
    pub positions: Vec<(String, usize)>,
}

impl KeywordMatch {
    pub fn distinct_terms(&self) -> usize {
        let mut terms: Vec<&str> = self.positions.iter().map(|(t, _)| t.as_str()).collect();
        terms.sort_unstable();
        terms.dedup();
        terms.len()
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DatabaseStats {
    pub total_conversations: i64,
    pub total_messages: i64,
    pub total_segments: i64,
    pub total_embeddings: i64,
    pub total_users: i64,
    pub pending_segments: i64,
    pub database_size_bytes: i64,
}

pub const SCHEMA_SQL: &str = "
-- Conversations
CREATE TABLE IF NOT EXISTS conversations (
    id TEXT PRIMARY KEY,
    created_at TEXT NOT NULL,
    last_active TEXT NOT NULL,
    message_count INTEGER NOT NULL DEFAULT 0,
    vector_enabled INTEGER NOT NULL DEFAULT 1,
    index_profile TEXT NOT NULL,
    archived INTEGER NOT NULL DEFAULT 0,
    archived_at TEXT
);
-- Messages (append-only)
CREATE TABLE IF NOT EXISTS messages (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL UNIQUE,
    conversation_id TEXT NOT NULL,
    author_id TEXT NOT NULL,
    content TEXT NOT NULL,
    normalized_content TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    kind TEXT NOT NULL,
    FOREIGN KEY (conversation_id) REFERENCES conversations(id)
);
-- Segments
CREATE TABLE IF NOT EXISTS segments (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    conversation_id TEXT NOT NULL,
    summary_text TEXT,
    coherence_score REAL NOT NULL,
    created_at TEXT NOT NULL,
    start_time TEXT NOT NULL,
    end_time TEXT NOT NULL,
    embedding_pending INTEGER NOT NULL DEFAULT 0,
    FOREIGN KEY (conversation_id) REFERENCES conversations(id)
);
-- Segment membership; the primary key keeps membership a partition
CREATE TABLE IF NOT EXISTS segment_members (
    message_id TEXT PRIMARY KEY,
    segment_id INTEGER NOT NULL,
    position INTEGER NOT NULL,
    FOREIGN KEY (segment_id) REFERENCES segments(id) ON DELETE CASCADE,
    FOREIGN KEY (message_id) REFERENCES messages(id)
);
-- Segment embeddings, one per model
CREATE TABLE IF NOT EXISTS embeddings (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    segment_id INTEGER NOT NULL,
    conversation_id TEXT NOT NULL,
    vector BLOB NOT NULL,
    model_id TEXT NOT NULL,
    dimension INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    FOREIGN KEY (segment_id) REFERENCES segments(id) ON DELETE CASCADE,
    UNIQUE(segment_id, model_id)
);
-- Participants
CREATE TABLE IF NOT EXISTS users (
    user_id TEXT PRIMARY KEY,
    display_name TEXT NOT NULL,
    last_active TEXT,
    free_text_data TEXT
);
CREATE INDEX IF NOT EXISTS idx_messages_conversation ON messages (conversation_id, timestamp, seq);
CREATE INDEX IF NOT EXISTS idx_messages_author ON messages (author_id);
CREATE INDEX IF NOT EXISTS idx_segments_conversation ON segments (conversation_id, start_time);
CREATE INDEX IF NOT EXISTS idx_segment_members_segment ON segment_members (segment_id, position);
CREATE INDEX IF NOT EXISTS idx_embeddings_conversation ON embeddings (conversation_id, model_id);
";
