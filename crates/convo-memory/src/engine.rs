//! The memory engine façade used by connectors.
//!
//! Each conversation gets one [`ConversationHandle`]; its mutex serialises
//! ingest, flush and idle ticks for that conversation, while searches only
//! touch the index slot's read guard and never wait on it.

use crate::config::{IndexProfile, MemoryConfig};
use crate::context_engine::ContextAssembler;
use crate::embedding::{EmbeddingProvider, EmbeddingService};
use crate::error::{MemoryError, Result};
use crate::memory_db::{DatabaseStats, MemoryDatabase, NewMessage, SegmentId, UserInfo};
use crate::metrics::{CounterSnapshot, EngineCounters};
use crate::search::{HybridSearcher, SearchCache, SearchFilters, SearchResponse};
use crate::segmentation::{ConversationSegmenter, SegmentDraft, SegmentFinalizer};
use crate::vector_index::{MigrationReport, MigrationRunner, VectorIndexManager};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutcome {
    Stored {
        seq: i64,
        /// Segments written because this message closed the open one.
        closed_segments: Vec<SegmentId>,
    },
    /// The message id was already stored; nothing changed.
    Duplicate,
}

struct HandleState {
    segmenter: ConversationSegmenter,
    profile: IndexProfile,
    loaded: bool,
    halted: Option<String>,
}

/// Single-writer state of one conversation.
pub struct ConversationHandle {
    state: Mutex<HandleState>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub database: DatabaseStats,
    pub counters: CounterSnapshot,
    pub active_model: Option<String>,
    pub loaded_indexes: usize,
    pub open_conversations: usize,
    pub queued_migrations: usize,
}

pub struct MemoryEngine {
    config: MemoryConfig,
    db: Arc<MemoryDatabase>,
    embeddings: Arc<EmbeddingService>,
    indexes: Arc<VectorIndexManager>,
    cache: Arc<SearchCache>,
    counters: Arc<EngineCounters>,
    finalizer: SegmentFinalizer,
    searcher: HybridSearcher,
    migration: MigrationRunner,
    assembler: ContextAssembler,
    handles: DashMap<String, Arc<ConversationHandle>>,
    recovered: AtomicBool,
}

impl MemoryEngine {
    /// Opens the database and builds the provider named by the config.
    pub fn open(config: MemoryConfig) -> Result<Self> {
        let provider = EmbeddingProvider::from_config(&config.embedding, config.timeouts.embed())?;
        Self::with_provider(config, provider)
    }

    pub fn with_provider(config: MemoryConfig, provider: EmbeddingProvider) -> Result<Self> {
        let db = Arc::new(MemoryDatabase::new(&config.database_path)?);
        let counters = Arc::new(EngineCounters::new()?);
        let embeddings = Arc::new(EmbeddingService::new(
            provider,
            &config.embedding,
            config.timeouts.embed(),
            Arc::clone(&counters),
        ));
        let indexes = Arc::new(VectorIndexManager::new(
            config.index.clone(),
            config.timeouts.persist(),
            Arc::clone(&db),
        ));
        let cache = Arc::new(SearchCache::new(&config.cache));
        let finalizer = SegmentFinalizer::new(
            Arc::clone(&db),
            Arc::clone(&embeddings),
            Arc::clone(&indexes),
            Arc::clone(&counters),
            config.segmentation.clone(),
        );
        let searcher = HybridSearcher::new(
            Arc::clone(&db),
            Arc::clone(&embeddings),
            Arc::clone(&indexes),
            Arc::clone(&cache),
            Arc::clone(&counters),
            config.search.clone(),
        );
        let migration = MigrationRunner::new(
            Arc::clone(&db),
            Arc::clone(&embeddings),
            Arc::clone(&indexes),
            Arc::clone(&counters),
            config.background.migration_batch_size,
        );

        info!(
            "Memory engine ready (model: {:?})",
            embeddings.active_model_id()
        );
        Ok(Self {
            config,
            db,
            embeddings,
            indexes,
            cache,
            counters,
            finalizer,
            searcher,
            migration,
            assembler: ContextAssembler::default(),
            handles: DashMap::new(),
            recovered: AtomicBool::new(false),
        })
    }

    pub fn database(&self) -> &Arc<MemoryDatabase> {
        &self.db
    }

    pub fn counters(&self) -> CounterSnapshot {
        self.counters.snapshot()
    }

    fn handle(&self, conversation_id: &str) -> Arc<ConversationHandle> {
        self.handles
            .entry(conversation_id.to_string())
            .or_insert_with(|| {
                Arc::new(ConversationHandle {
                    state: Mutex::new(HandleState {
                        segmenter: ConversationSegmenter::new(
                            conversation_id,
                            self.config.segmentation.clone(),
                        ),
                        profile: self.config.default_profile.clone(),
                        loaded: false,
                        halted: None,
                    }),
                })
            })
            .value()
            .clone()
    }

    async fn lock<'a>(
        &self,
        conversation_id: &str,
        handle: &'a ConversationHandle,
    ) -> Result<MutexGuard<'a, HandleState>> {
        let timeout = self.config.timeouts.ingest_lock();
        let mut state = tokio::time::timeout(timeout, handle.state.lock())
            .await
            .map_err(|_| MemoryError::timeout("conversation lock", timeout))?;
        if !state.loaded {
            self.load_state(conversation_id, &mut state)?;
        }
        Ok(state)
    }

    /// Profile and open segment come back from the store on first use.
    fn load_state(&self, conversation_id: &str, state: &mut HandleState) -> Result<()> {
        if let Some(conversation) = self.db.conversations.get_conversation(conversation_id)? {
            state.profile = conversation.index_profile;
        }
        state.segmenter.set_max_messages(state.profile.max_segment_messages);
        let unsegmented = self.db.conversations.get_unsegmented_messages(conversation_id)?;
        if !unsegmented.is_empty() {
            debug!(
                "Restored open segment of {} with {} messages",
                conversation_id,
                unsegmented.len()
            );
        }
        state.segmenter.restore(&unsegmented);
        state.loaded = true;
        Ok(())
    }

    fn check_writable(conversation_id: &str, state: &HandleState) -> Result<()> {
        match &state.halted {
            Some(reason) => Err(MemoryError::StorageFailure(format!(
                "writes to {} halted: {}",
                conversation_id, reason
            ))),
            None => Ok(()),
        }
    }

    fn note_failure(&self, conversation_id: &str, state: &mut HandleState, err: MemoryError) -> MemoryError {
        if err.is_storage_failure() {
            error!("Halting writes to {}: {}", conversation_id, err);
            state.halted = Some(err.to_string());
        }
        err
    }

    /// Stores one message and runs the segmentation triggers. Re-delivering
    /// a stored message id is a no-op reported as [`IngestOutcome::Duplicate`].
    pub async fn ingest(&self, conversation_id: &str, message: NewMessage) -> Result<IngestOutcome> {
        let handle = self.handle(conversation_id);
        let mut state = self.lock(conversation_id, &handle).await?;
        Self::check_writable(conversation_id, &state)?;

        let stored = match self
            .db
            .ingest_message(conversation_id, &message, &self.config.default_profile)
        {
            Ok(stored) => stored,
            Err(MemoryError::DuplicateWrite(id)) => {
                EngineCounters::inc(&self.counters.duplicate_writes);
                debug!("Ignoring duplicate message {} in {}", id, conversation_id);
                return Ok(IngestOutcome::Duplicate);
            }
            Err(e) => return Err(self.note_failure(conversation_id, &mut state, e)),
        };
        EngineCounters::inc(&self.counters.messages_ingested);
        self.cache.bump(conversation_id);

        let active = self.embeddings.active_model();
        let vector = match (&active, state.profile.vector_enabled && self.embeddings.is_available()) {
            (Some(active), true) => match self.embeddings.embed(&stored.content).await {
                Ok(e) if e.model_id == active.model_id => Some(e.vector),
                Ok(_) => None,
                Err(e) => {
                    debug!("Message embedding unavailable, drift check skipped: {}", e);
                    None
                }
            },
            _ => None,
        };
        let model = vector.as_ref().and(active.as_ref());
        let drafts = state.segmenter.observe(&stored, vector, model);
        let closed_segments = self.finalize_drafts(conversation_id, &mut state, drafts).await?;

        Ok(IngestOutcome::Stored {
            seq: stored.seq,
            closed_segments,
        })
    }

    /// Persists drafts in order. A failed draft goes back into the open
    /// segment together with the ones after it.
    async fn finalize_drafts(
        &self,
        conversation_id: &str,
        state: &mut HandleState,
        drafts: Vec<SegmentDraft>,
    ) -> Result<Vec<SegmentId>> {
        let mut written = Vec::new();
        let mut drafts = drafts.into_iter();
        while let Some(draft) = drafts.next() {
            match self.finalizer.finalize(&draft, &state.profile).await {
                Ok(outcome) => {
                    written.extend(outcome.segment_ids);
                    self.cache.bump(conversation_id);
                }
                Err(e) => {
                    let rest: Vec<SegmentDraft> = std::iter::once(draft).chain(drafts).collect();
                    for failed in rest.into_iter().rev() {
                        state.segmenter.reopen(failed);
                    }
                    if e.is_storage_failure() {
                        return Err(self.note_failure(conversation_id, state, e));
                    }
                    warn!("Segment close for {} deferred: {}", conversation_id, e);
                    break;
                }
            }
        }
        Ok(written)
    }

    /// Sets the conversation's index profile. Turning vectors on queues the
    /// conversation for embedding under the active model.
    pub async fn configure(&self, conversation_id: &str, profile: IndexProfile) -> Result<()> {
        let handle = self.handle(conversation_id);
        let mut state = self.lock(conversation_id, &handle).await?;
        Self::check_writable(conversation_id, &state)?;

        let was_enabled = state.profile.vector_enabled;
        if let Err(e) = self.db.conversations.set_profile(conversation_id, &profile) {
            return Err(self.note_failure(conversation_id, &mut state, e));
        }
        state.segmenter.set_max_messages(profile.max_segment_messages);

        if !profile.vector_enabled {
            self.indexes.discard(conversation_id).await?;
        } else if let Some(max) = profile.max_index_entries {
            let mut slot = self.indexes.write(conversation_id).await;
            if let Some(index) = slot.index.as_mut() {
                index.evict_to(max);
            }
        }
        if profile.vector_enabled && !was_enabled {
            if let Some(model) = self.embeddings.active_model_id() {
                self.db.migrations.begin(conversation_id, &model)?;
                self.migration.enqueue([conversation_id.to_string()]).await;
            }
        }

        info!("Configured {} with profile '{}'", conversation_id, profile.name);
        state.profile = profile;
        self.cache.bump(conversation_id);
        Ok(())
    }

    pub async fn search(
        &self,
        conversation_id: &str,
        query_text: &str,
        participant_ids: &[String],
        limit: usize,
    ) -> Result<SearchResponse> {
        self.searcher
            .search(conversation_id, query_text, participant_ids, &SearchFilters::default(), limit)
            .await
    }

    pub async fn search_with_filters(
        &self,
        conversation_id: &str,
        query_text: &str,
        participant_ids: &[String],
        filters: &SearchFilters,
        limit: usize,
    ) -> Result<SearchResponse> {
        self.searcher
            .search(conversation_id, query_text, participant_ids, filters, limit)
            .await
    }

    /// Search plus rendering into a prompt block of at most `max_tokens`.
    pub async fn build_context(
        &self,
        conversation_id: &str,
        query_text: &str,
        participant_ids: &[String],
        limit: usize,
        max_tokens: usize,
    ) -> Result<String> {
        let response = self.search(conversation_id, query_text, participant_ids, limit).await?;
        let mut authors: Vec<String> = response
            .hits
            .iter()
            .flat_map(|h| h.messages.iter().map(|m| m.author_id.clone()))
            .collect();
        authors.sort();
        authors.dedup();
        let users = self.get_participant_info(&authors)?;
        Ok(self.assembler.assemble(&response, &users, max_tokens))
    }

    pub fn get_participant_info(&self, user_ids: &[String]) -> Result<Vec<UserInfo>> {
        self.db.users.get_users(user_ids)
    }

    pub fn upsert_user(&self, user: &UserInfo) -> Result<()> {
        self.db.users.upsert_user(user)
    }

    /// Force-closes the open segment.
    pub async fn flush(&self, conversation_id: &str) -> Result<Vec<SegmentId>> {
        let handle = self.handle(conversation_id);
        let mut state = self.lock(conversation_id, &handle).await?;
        Self::check_writable(conversation_id, &state)?;
        let drafts: Vec<SegmentDraft> = state.segmenter.flush().into_iter().collect();
        self.finalize_drafts(conversation_id, &mut state, drafts).await
    }

    /// Closes open segments whose interval elapsed at `now`. Conversations
    /// busy with an ingest are skipped until the next tick.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<Vec<SegmentId>> {
        if !self.recovered.swap(true, Ordering::SeqCst) {
            for conversation_id in self.db.conversations.list_conversation_ids(false)? {
                self.handle(&conversation_id);
            }
        }

        let handles: Vec<(String, Arc<ConversationHandle>)> = self
            .handles
            .iter()
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect();
        let mut closed = Vec::new();
        for (conversation_id, handle) in handles {
            let Ok(mut state) = handle.state.try_lock() else {
                continue;
            };
            if state.halted.is_some() {
                continue;
            }
            if !state.loaded {
                self.load_state(&conversation_id, &mut state)?;
            }
            let drafts: Vec<SegmentDraft> = state.segmenter.tick(now).into_iter().collect();
            if drafts.is_empty() {
                continue;
            }
            match self.finalize_drafts(&conversation_id, &mut state, drafts).await {
                Ok(ids) => closed.extend(ids),
                Err(e) => warn!("Idle close for {} failed: {}", conversation_id, e),
            }
        }
        Ok(closed)
    }

    /// Installs a provider. When the active model changes every index goes
    /// stale and all vector-enabled conversations are queued for
    /// re-embedding. Returns whether the model changed.
    pub async fn set_embedding_provider(&self, provider: EmbeddingProvider) -> Result<bool> {
        let changed = self.embeddings.set_provider(provider);
        self.cache.clear();
        if !changed {
            return Ok(false);
        }
        let Some(model) = self.embeddings.active_model_id() else {
            return Ok(true);
        };
        self.indexes.mark_all_stale().await;

        let mut queued = Vec::new();
        for conversation_id in self.db.conversations.list_conversation_ids(false)? {
            let vector_enabled = self
                .db
                .conversations
                .get_conversation(&conversation_id)?
                .is_some_and(|c| c.vector_enabled);
            if vector_enabled {
                self.db.migrations.begin(&conversation_id, &model)?;
                queued.push(conversation_id);
            }
        }
        info!("Queued {} conversations for re-embedding with {}", queued.len(), model);
        self.migration.enqueue(queued).await;
        Ok(true)
    }

    /// Runs queued re-embedding, including work left over from before a
    /// restart.
    pub async fn run_migration(&self, max_conversations: Option<usize>) -> Result<MigrationReport> {
        if let Some(model) = self.embeddings.active_model_id() {
            let leftover = self.db.migrations.incomplete(&model)?;
            self.migration
                .enqueue(leftover.into_iter().map(|p| p.conversation_id))
                .await;
        }
        let report = self.migration.run(max_conversations).await?;
        for conversation_id in &report.completed {
            self.cache.bump(conversation_id);
        }
        Ok(report)
    }

    pub fn cancel_migration(&self) {
        info!("Migration cancellation requested");
        self.migration.cancel();
    }

    pub async fn retry_pending_embeddings(&self, limit: usize) -> Result<usize> {
        let done = self.finalizer.retry_pending(limit).await?;
        for (conversation_id, _) in &done {
            self.cache.bump(conversation_id);
        }
        Ok(done.len())
    }

    pub async fn archive_conversation(&self, conversation_id: &str) -> Result<()> {
        self.db.conversations.archive_conversation(conversation_id)?;
        self.cache.bump(conversation_id);
        Ok(())
    }

    /// Drops segments, vectors and index artifacts of conversations archived
    /// for longer than `older_than_days`.
    pub async fn cleanup_archived(&self, older_than_days: i64) -> Result<Vec<String>> {
        let cleaned = self.db.cleanup_archived(older_than_days)?;
        for conversation_id in &cleaned {
            self.indexes.discard(conversation_id).await?;
            self.handles.remove(conversation_id);
            self.cache.bump(conversation_id);
        }
        Ok(cleaned)
    }

    /// Lifts a halt caused by a storage failure.
    pub async fn resume_writes(&self, conversation_id: &str) -> Result<()> {
        let handle = self.handle(conversation_id);
        let timeout = self.config.timeouts.ingest_lock();
        let mut state = tokio::time::timeout(timeout, handle.state.lock())
            .await
            .map_err(|_| MemoryError::timeout("conversation lock", timeout))?;
        if state.halted.take().is_some() {
            info!("Writes to {} resumed", conversation_id);
        }
        // Reload the open segment from the store on next use.
        state.loaded = false;
        Ok(())
    }

    pub async fn stats(&self) -> Result<EngineStats> {
        let queued_migrations = self.migration.pending().await;
        self.refresh_gauges(queued_migrations);
        Ok(EngineStats {
            database: self.db.get_stats()?,
            counters: self.counters.snapshot(),
            active_model: self.embeddings.active_model_id(),
            loaded_indexes: self.indexes.loaded_conversations(),
            open_conversations: self.handles.len(),
            queued_migrations,
        })
    }

    /// Prometheus text exposition of this engine's metrics.
    pub async fn metrics_text(&self) -> Result<String> {
        self.refresh_gauges(self.migration.pending().await);
        self.counters.encode_text()
    }

    fn refresh_gauges(&self, queued_migrations: usize) {
        self.counters.open_conversations.set(self.handles.len() as i64);
        self.counters.queued_migrations.set(queued_migrations as i64);
    }

    pub async fn persist_indexes(&self) -> usize {
        self.indexes.persist_dirty().await
    }

    async fn maintenance_pass(&self, pass: u64) {
        if let Err(e) = self.tick(Utc::now()).await {
            warn!("Idle segment tick failed: {}", e);
        }
        if let Err(e) = self
            .retry_pending_embeddings(self.config.background.pending_retry_limit)
            .await
        {
            warn!("Pending embedding retry failed: {}", e);
        }
        if self.embeddings.is_available() {
            if let Err(e) = self.run_migration(Some(1)).await {
                warn!("Migration step failed: {}", e);
            }
        }
        self.persist_indexes().await;

        let every = u64::from(self.config.background.db_maintenance_every);
        if every > 0 && pass % every == 0 {
            let db = Arc::clone(&self.db);
            match tokio::task::spawn_blocking(move || db.run_maintenance()).await {
                Ok(Err(e)) => warn!("Database maintenance failed: {}", e),
                Err(e) => warn!("Database maintenance task failed: {}", e),
                Ok(Ok(())) => {}
            }
        }
    }

    /// Periodic maintenance until [`BackgroundWorker::shutdown`].
    pub fn spawn_background(self: &Arc<Self>) -> BackgroundWorker {
        let running = Arc::new(AtomicBool::new(true));
        let wake = Arc::new(Notify::new());
        let period = Duration::from_secs(self.config.background.tick_interval_secs.max(1));
        let engine = Arc::clone(self);
        let (running_loop, wake_loop) = (Arc::clone(&running), Arc::clone(&wake));

        let handle = tokio::spawn(async move {
            info!("Background maintenance started (every {:?})", period);
            let mut pass = 0u64;
            while running_loop.load(Ordering::Relaxed) {
                tokio::select! {
                    _ = tokio::time::sleep(period) => {
                        pass += 1;
                        engine.maintenance_pass(pass).await;
                    }
                    _ = wake_loop.notified() => {}
                }
            }
            engine.persist_indexes().await;
            info!("Background maintenance stopped");
        });

        BackgroundWorker {
            running,
            wake,
            handle: Some(handle),
        }
    }
}

pub struct BackgroundWorker {
    running: Arc<AtomicBool>,
    wake: Arc<Notify>,
    handle: Option<JoinHandle<()>>,
}

impl BackgroundWorker {
    /// Stops the loop after the pass in flight and waits for it.
    pub async fn shutdown(mut self) {
        self.running.store(false, Ordering::Relaxed);
        self.wake.notify_one();
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                error!("Background maintenance task failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SegmentationConfig;
    use crate::embedding::HashingEmbeddingProvider;
    use chrono::{Duration as ChronoDuration, TimeZone};
    use tempfile::TempDir;

    fn engine(provider: EmbeddingProvider) -> (TempDir, MemoryEngine) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = MemoryConfig::with_data_dir(dir.path());
        config.segmentation = SegmentationConfig {
            max_messages: 3,
            ..Default::default()
        };
        let engine = MemoryEngine::with_provider(config, provider).unwrap();
        (dir, engine)
    }

    fn hashing() -> EmbeddingProvider {
        EmbeddingProvider::Hashing(HashingEmbeddingProvider::new(11, 64))
    }

    fn at(minute: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 7, 1, 8, 0, 0).unwrap() + ChronoDuration::minutes(minute)
    }

    #[tokio::test]
    async fn duplicate_ingest_is_a_no_op() {
        let (_dir, engine) = engine(hashing());
        let msg = NewMessage::human("m1", "alice", "hello there", at(0));
        assert!(matches!(
            engine.ingest("c1", msg.clone()).await.unwrap(),
            IngestOutcome::Stored { .. }
        ));
        assert_eq!(engine.ingest("c1", msg).await.unwrap(), IngestOutcome::Duplicate);
        let conversation = engine.database().conversations.get_conversation("c1").unwrap().unwrap();
        assert_eq!(conversation.message_count, 1);
        assert_eq!(engine.counters().duplicate_writes, 1);
    }

    #[tokio::test]
    async fn count_trigger_writes_a_segment() {
        let (_dir, engine) = engine(hashing());
        let mut closed = Vec::new();
        for i in 0..3 {
            let msg = NewMessage::human(format!("m{}", i), "alice", format!("planning item {}", i), at(i));
            if let IngestOutcome::Stored { closed_segments, .. } = engine.ingest("c1", msg).await.unwrap() {
                closed.extend(closed_segments);
            }
        }
        assert_eq!(closed.len(), 1);
        let segment = engine.database().segments.get_segment(closed[0]).unwrap().unwrap();
        assert_eq!(segment.member_message_ids, vec!["m0", "m1", "m2"]);
    }

    #[tokio::test]
    async fn open_segment_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let config = MemoryConfig::with_data_dir(dir.path());
        {
            let engine = MemoryEngine::with_provider(config.clone(), hashing()).unwrap();
            engine
                .ingest("c1", NewMessage::human("m1", "alice", "before restart", at(0)))
                .await
                .unwrap();
        }
        let engine = MemoryEngine::with_provider(config, hashing()).unwrap();
        engine
            .ingest("c1", NewMessage::human("m2", "alice", "after restart", at(1)))
            .await
            .unwrap();
        let ids = engine.flush("c1").await.unwrap();
        let segment = engine.database().segments.get_segment(ids[0]).unwrap().unwrap();
        assert_eq!(segment.member_message_ids, vec!["m1", "m2"]);
    }

    #[tokio::test]
    async fn configure_profile_applies_segment_size() {
        let (_dir, engine) = engine(hashing());
        engine
            .configure(
                "c1",
                IndexProfile {
                    name: "tight".into(),
                    max_segment_messages: Some(2),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        engine.ingest("c1", NewMessage::human("m1", "a", "one", at(0))).await.unwrap();
        let outcome = engine.ingest("c1", NewMessage::human("m2", "a", "two", at(1))).await.unwrap();
        match outcome {
            IngestOutcome::Stored { closed_segments, .. } => assert_eq!(closed_segments.len(), 1),
            other => panic!("unexpected {:?}", other),
        }
        let conversation = engine.database().conversations.get_conversation("c1").unwrap().unwrap();
        assert_eq!(conversation.index_profile.name, "tight");
    }

    #[tokio::test]
    async fn build_context_uses_display_names() {
        let (_dir, engine) = engine(hashing());
        engine
            .upsert_user(&UserInfo {
                user_id: "alice".into(),
                display_name: "Alice A.".into(),
                last_active: None,
                free_text_data: None,
            })
            .unwrap();
        for i in 0..3 {
            engine
                .ingest("c1", NewMessage::human(format!("m{}", i), "alice", "quarterly budget review", at(i)))
                .await
                .unwrap();
        }
        let text = engine.build_context("c1", "budget", &[], 5, 500).await.unwrap();
        assert!(text.contains("Alice A.: quarterly budget review"));
    }

    #[tokio::test]
    async fn ingest_gives_up_on_a_held_conversation_lock() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = MemoryConfig::with_data_dir(dir.path());
        config.timeouts.ingest_lock_timeout_ms = 30;
        let engine = MemoryEngine::with_provider(config, hashing()).unwrap();

        let handle = engine.handle("c1");
        let held = handle.state.lock().await;
        let err = engine
            .ingest("c1", NewMessage::human("m1", "alice", "blocked", at(0)))
            .await
            .unwrap_err();
        assert!(matches!(err, MemoryError::Timeout { operation: "conversation lock", .. }));
        assert!(engine.database().conversations.get_conversation("c1").unwrap().is_none());

        drop(held);
        engine
            .ingest("c1", NewMessage::human("m1", "alice", "blocked", at(0)))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn metrics_text_reports_live_handles() {
        let (_dir, engine) = engine(hashing());
        engine.ingest("c1", NewMessage::human("m1", "a", "one", at(0))).await.unwrap();
        engine.ingest("c2", NewMessage::human("m2", "b", "two", at(0))).await.unwrap();
        let text = engine.metrics_text().await.unwrap();
        assert!(text.contains("convo_memory_messages_ingested_total 2"));
        assert!(text.contains("convo_memory_open_conversations 2"));
    }

    #[tokio::test]
    async fn maintenance_pass_analyzes_on_schedule() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = MemoryConfig::with_data_dir(dir.path());
        config.background.db_maintenance_every = 2;
        let engine = MemoryEngine::with_provider(config, hashing()).unwrap();
        engine.ingest("c1", NewMessage::human("m1", "a", "one", at(0))).await.unwrap();

        let analyzed = |engine: &MemoryEngine| {
            engine
                .database()
                .with_transaction(|tx| {
                    Ok(tx.query_row(
                        "SELECT COUNT(*) FROM sqlite_master WHERE name = 'sqlite_stat1'",
                        [],
                        |row| row.get::<_, i64>(0),
                    )?)
                })
                .unwrap()
        };
        engine.maintenance_pass(1).await;
        assert_eq!(analyzed(&engine), 0);
        engine.maintenance_pass(2).await;
        assert_eq!(analyzed(&engine), 1);
    }

    #[tokio::test]
    async fn background_worker_shuts_down() {
        let (_dir, engine) = engine(hashing());
        let engine = Arc::new(engine);
        let worker = engine.spawn_background();
        worker.shutdown().await;
    }
}
