//! Re-embedding after a model change.
//!
//! Conversations are processed from an explicit queue. Each one embeds its
//! segments that lack a record for the active model, in batches, then swaps
//! in an index built only from active-model records and finally deletes the
//! stale records. Progress is persisted, and because the work list is "segments
//! missing a current record", a restarted job never redoes finished segments.

use crate::embedding::EmbeddingService;
use crate::error::{MemoryError, Result};
use crate::memory_db::{EmbeddingRecord, MemoryDatabase, MigrationStatus};
use crate::metrics::EngineCounters;
use crate::segmentation::segment_text;
use crate::vector_index::VectorIndexManager;
use chrono::Utc;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MigrationReport {
    pub completed: Vec<String>,
    pub segments_migrated: usize,
    pub remaining: usize,
    pub cancelled: bool,
}

pub struct MigrationRunner {
    db: Arc<MemoryDatabase>,
    embeddings: Arc<EmbeddingService>,
    indexes: Arc<VectorIndexManager>,
    counters: Arc<EngineCounters>,
    queue: Mutex<VecDeque<String>>,
    cancelled: AtomicBool,
    batch_size: usize,
}

impl MigrationRunner {
    pub fn new(
        db: Arc<MemoryDatabase>,
        embeddings: Arc<EmbeddingService>,
        indexes: Arc<VectorIndexManager>,
        counters: Arc<EngineCounters>,
        batch_size: usize,
    ) -> Self {
        Self {
            db,
            embeddings,
            indexes,
            counters,
            queue: Mutex::new(VecDeque::new()),
            cancelled: AtomicBool::new(false),
            batch_size: batch_size.max(1),
        }
    }

    pub async fn enqueue<I>(&self, conversation_ids: I)
    where
        I: IntoIterator<Item = String>,
    {
        let mut queue = self.queue.lock().await;
        for id in conversation_ids {
            if !queue.contains(&id) {
                queue.push_back(id);
            }
        }
    }

    pub async fn pending(&self) -> usize {
        self.queue.lock().await.len()
    }

    /// Stops claiming new work; the batch in flight finishes.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Runs queued conversations until the queue drains, `max_conversations`
    /// are done, or the job is cancelled. Clears a previous cancellation.
    pub async fn run(&self, max_conversations: Option<usize>) -> Result<MigrationReport> {
        self.cancelled.store(false, Ordering::SeqCst);
        let mut report = MigrationReport::default();

        loop {
            if self.is_cancelled() {
                report.cancelled = true;
                break;
            }
            if max_conversations.is_some_and(|max| report.completed.len() >= max) {
                break;
            }
            let Some(conversation_id) = self.queue.lock().await.pop_front() else {
                break;
            };

            match self.migrate_conversation(&conversation_id).await {
                Ok((migrated, true)) => {
                    report.segments_migrated += migrated;
                    report.completed.push(conversation_id);
                }
                Ok((migrated, false)) => {
                    report.segments_migrated += migrated;
                    report.cancelled = true;
                    self.queue.lock().await.push_front(conversation_id);
                    break;
                }
                Err(e) => {
                    warn!("Migration of {} stopped: {}", conversation_id, e);
                    self.queue.lock().await.push_front(conversation_id);
                    report.remaining = self.pending().await;
                    return Err(e);
                }
            }
        }

        report.remaining = self.pending().await;
        if !report.completed.is_empty() || report.cancelled {
            info!(
                "Migration pass: {} conversations done, {} segments embedded, {} queued{}",
                report.completed.len(),
                report.segments_migrated,
                report.remaining,
                if report.cancelled { " (cancelled)" } else { "" }
            );
        }
        Ok(report)
    }

    /// Returns `(segments embedded, finished)`.
    async fn migrate_conversation(&self, conversation_id: &str) -> Result<(usize, bool)> {
        let active = self
            .embeddings
            .active_model()
            .ok_or_else(|| MemoryError::ProviderUnavailable("no active embedding model".into()))?;
        self.db.migrations.begin(conversation_id, &active.model_id)?;
        self.db
            .migrations
            .record(conversation_id, MigrationStatus::InProgress, 0)?;

        let mut migrated = 0usize;
        loop {
            let segments = self.db.segments.segments_missing_embedding(
                conversation_id,
                &active.model_id,
                self.batch_size,
            )?;
            if segments.is_empty() {
                break;
            }

            let mut texts = Vec::with_capacity(segments.len());
            for segment in &segments {
                let messages = self.db.conversations.get_messages_by_ids(&segment.member_message_ids)?;
                texts.push(segment_text(&messages));
            }
            let vectors = self.embeddings.embed_batch(&texts).await?;
            if vectors.iter().any(|v| v.model_id != active.model_id) {
                return Err(MemoryError::ProviderUnavailable(
                    "active model changed during migration".into(),
                ));
            }

            let now = Utc::now();
            let mut attached = 0usize;
            {
                // Held so a concurrent segment close cannot change membership
                // between the check and the write.
                let _slot = self.indexes.write(conversation_id).await;
                for (segment, embedding) in segments.iter().zip(vectors) {
                    let record = EmbeddingRecord {
                        segment_id: segment.id,
                        conversation_id: conversation_id.to_string(),
                        dimension: embedding.vector.len(),
                        vector: embedding.vector,
                        model_id: embedding.model_id,
                        created_at: now,
                    };
                    if self.db.attach_embedding_for(&record, &segment.member_message_ids)? {
                        attached += 1;
                    } else {
                        debug!("Segment {} changed while re-embedding; left to its writer", segment.id);
                    }
                }
            }
            migrated += attached;
            EngineCounters::add(&self.counters.segments_migrated, attached as u64);
            self.db.migrations.record(
                conversation_id,
                MigrationStatus::InProgress,
                attached as i64,
            )?;

            if self.is_cancelled() {
                return Ok((migrated, false));
            }
        }

        {
            let mut slot = self.indexes.write(conversation_id).await;
            slot.index = Some(self.indexes.build_from_store(conversation_id, &active)?);
        }
        self.db
            .embeddings
            .delete_stale_embeddings(conversation_id, &active.model_id)?;
        self.db
            .migrations
            .record(conversation_id, MigrationStatus::Complete, 0)?;
        info!(
            "Conversation {} migrated to {} ({} segments embedded)",
            conversation_id, active.model_id, migrated
        );
        Ok((migrated, true))
    }
}
