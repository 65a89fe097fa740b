//! Memory database module - SQLite storage for conversations, messages,
//! segments, embeddings, users and migration progress.
pub mod conversation_store;
pub mod embedding_store;
pub mod migration;
pub mod progress_store;
pub mod schema;
pub mod segment_store;
pub mod user_store;

pub use conversation_store::ConversationStore;
pub use embedding_store::{EmbeddingStats, EmbeddingStore};
pub use migration::MigrationManager;
pub use progress_store::MigrationProgressStore;
pub use schema::*;
pub use segment_store::SegmentStore;
pub use user_store::UserStore;

use crate::error::Result;
use crate::utils::TextUtils;
use chrono::{DateTime, Duration, Utc};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::functions::FunctionFlags;
use rusqlite::Connection;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Vector to persist alongside a segment write.
#[derive(Debug, Clone)]
pub struct SegmentVector {
    pub model_id: String,
    pub vector: Vec<f32>,
}

/// SQL helpers available on every pooled connection.
///
/// `has_token(normalized_content, term)` is true when `term` occurs as a whole
/// word token, using the same tokenizer as the Rust side.
fn register_functions(conn: &Connection) -> rusqlite::Result<()> {
    conn.create_scalar_function(
        "has_token",
        2,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        |ctx| {
            let haystack: String = ctx.get(0)?;
            let term: String = ctx.get(1)?;
            Ok(!TextUtils::match_positions(&haystack, &term).is_empty())
        },
    )
}

/// Single owner of the connection pool; the stores share it.
pub struct MemoryDatabase {
    pub conversations: ConversationStore,
    pub segments: SegmentStore,
    pub embeddings: EmbeddingStore,
    pub users: UserStore,
    pub migrations: MigrationProgressStore,
    pool: Arc<Pool<SqliteConnectionManager>>,
}

impl MemoryDatabase {
    pub fn new(db_path: &Path) -> Result<Self> {
        info!("Opening memory database at: {}", db_path.display());
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let manager = SqliteConnectionManager::file(db_path)
            .with_flags(
                rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                    | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
                    | rusqlite::OpenFlags::SQLITE_OPEN_FULL_MUTEX,
            )
            .with_init(|conn| {
                conn.execute_batch(
                    "PRAGMA foreign_keys = ON;
                     PRAGMA busy_timeout = 5000;
                     PRAGMA synchronous = NORMAL;",
                )?;
                register_functions(conn)
            });
        let pool = Pool::builder().max_size(10).build(manager)?;

        {
            let mut conn = pool.get()?;
            conn.execute_batch("PRAGMA journal_mode = WAL;")?;
            let mut migrator = MigrationManager::new(&mut conn);
            migrator.initialize_database()?;
        }

        let pool = Arc::new(pool);
        info!("Memory database initialized successfully");
        Ok(Self {
            conversations: ConversationStore::new(Arc::clone(&pool)),
            segments: SegmentStore::new(Arc::clone(&pool)),
            embeddings: EmbeddingStore::new(Arc::clone(&pool)),
            users: UserStore::new(Arc::clone(&pool)),
            migrations: MigrationProgressStore::new(Arc::clone(&pool)),
            pool,
        })
    }

    /// Runs `f` inside one transaction; commits on `Ok`, rolls back otherwise.
    pub fn with_transaction<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&rusqlite::Transaction<'_>) -> Result<T>,
    {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
        let result = f(&tx)?;
        tx.commit()?;
        Ok(result)
    }

    /// Atomically deletes `removed` and writes `writes` (segments plus their
    /// optional vectors). Rewritten segments lose vectors of every model.
    pub fn rewrite_segments(
        &self,
        removed: &[SegmentId],
        writes: &[(NewSegment, Option<SegmentVector>)],
    ) -> Result<Vec<SegmentId>> {
        let now = Utc::now();
        self.with_transaction(|tx| {
            for segment_id in removed {
                SegmentStore::delete_with_conn(tx, *segment_id)?;
            }
            let mut ids = Vec::with_capacity(writes.len());
            for (segment, vector) in writes {
                if let Some(existing) = segment.id {
                    tx.execute("DELETE FROM embeddings WHERE segment_id = ?1", [existing])?;
                }
                let segment_id = SegmentStore::upsert_with_conn(tx, segment, &now)?;
                if let Some(v) = vector {
                    EmbeddingStore::store_with_conn(
                        tx,
                        &EmbeddingRecord {
                            segment_id,
                            conversation_id: segment.conversation_id.clone(),
                            dimension: v.vector.len(),
                            vector: v.vector.clone(),
                            model_id: v.model_id.clone(),
                            created_at: now,
                        },
                    )?;
                }
                ids.push(segment_id);
            }
            Ok(ids)
        })
    }

    /// Stores a vector for an existing segment and clears its pending flag,
    /// but only while the segment still has exactly `expected_members`. A
    /// segment merged, split or deleted since its text was read keeps what it
    /// has; returns `false`.
    pub fn attach_embedding_for(&self, record: &EmbeddingRecord, expected_members: &[String]) -> Result<bool> {
        self.with_transaction(|tx| {
            let current = SegmentStore::member_ids_with_conn(tx, record.segment_id)?;
            if current.is_empty() || current != expected_members {
                return Ok(false);
            }
            EmbeddingStore::store_with_conn(tx, record)?;
            SegmentStore::set_embedding_pending_with_conn(tx, record.segment_id, false)?;
            Ok(true)
        })
    }

    /// Appends a message, then records the author's activity.
    pub fn ingest_message(
        &self,
        conversation_id: &str,
        message: &NewMessage,
        default_profile: &crate::config::IndexProfile,
    ) -> Result<StoredMessage> {
        let stored = self
            .conversations
            .append_message(conversation_id, message, default_profile)?;
        self.users.touch_user(&message.author_id, &message.timestamp)?;
        Ok(stored)
    }

    pub fn get_stats(&self) -> Result<DatabaseStats> {
        let conn = self.pool.get()?;
        Ok(migration::get_database_stats(&conn)?)
    }

    /// Deletes segments and embeddings of conversations archived with no
    /// activity for `older_than_days`. Messages stay.
    pub fn cleanup_archived(&self, older_than_days: i64) -> Result<Vec<String>> {
        let cutoff: DateTime<Utc> = Utc::now() - Duration::days(older_than_days);
        let conversations = self.conversations.archived_before(&cutoff)?;
        let mut total = 0;
        for conversation_id in &conversations {
            total += self.with_transaction(|tx| {
                SegmentStore::delete_for_conversation_with_conn(tx, conversation_id)
            })?;
        }
        info!(
            "Cleaned up {} segments across {} archived conversations",
            total,
            conversations.len()
        );
        Ok(conversations)
    }

    pub fn run_maintenance(&self) -> Result<()> {
        info!("Running database maintenance...");
        let conn = self.pool.get()?;
        conn.execute_batch("ANALYZE; PRAGMA optimize;")?;
        info!("Database maintenance completed");
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::MemoryDatabase;
    use tempfile::TempDir;

    pub(crate) fn open_test_db() -> (TempDir, MemoryDatabase) {
        let dir = tempfile::tempdir().unwrap();
        let db = MemoryDatabase::new(&dir.path().join("memory.db")).unwrap();
        (dir, db)
    }
}
