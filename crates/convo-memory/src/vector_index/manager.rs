//! Per-conversation index slots with lazy activation and persistence.

use super::artifact::IndexArtifact;
use super::index::{ConversationIndex, HnswSettings};
use crate::config::IndexConfig;
use crate::embedding::ActiveModel;
use crate::error::{MemoryError, Result};
use crate::memory_db::{MemoryDatabase, SegmentId};
use dashmap::DashMap;
use futures::future::join_all;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use tracing::{debug, info, warn};

/// Guarded holder of a conversation's index. `index` stays `None` until the
/// first access activates it.
#[derive(Default)]
pub struct IndexSlot {
    pub index: Option<ConversationIndex>,
}

impl IndexSlot {
    /// Usable for semantic search under `active`.
    pub fn is_ready(&self, active: Option<&ActiveModel>) -> bool {
        match (&self.index, active) {
            (Some(index), Some(active)) => !index.stale && index.model_id() == active.model_id,
            _ => false,
        }
    }
}

pub struct VectorIndexManager {
    config: IndexConfig,
    settings: HnswSettings,
    persist_timeout: Duration,
    db: Arc<MemoryDatabase>,
    slots: DashMap<String, Arc<RwLock<IndexSlot>>>,
}

impl VectorIndexManager {
    pub fn new(config: IndexConfig, persist_timeout: Duration, db: Arc<MemoryDatabase>) -> Self {
        Self {
            settings: HnswSettings::from(&config),
            config,
            persist_timeout,
            db,
            slots: DashMap::new(),
        }
    }

    fn slot(&self, conversation_id: &str) -> Arc<RwLock<IndexSlot>> {
        self.slots
            .entry(conversation_id.to_string())
            .or_default()
            .value()
            .clone()
    }

    pub async fn read(&self, conversation_id: &str) -> OwnedRwLockReadGuard<IndexSlot> {
        self.slot(conversation_id).read_owned().await
    }

    pub async fn write(&self, conversation_id: &str) -> OwnedRwLockWriteGuard<IndexSlot> {
        self.slot(conversation_id).write_owned().await
    }

    /// Loads the slot for `active` if it is empty or built for another model.
    /// A readable artifact for the same model is reconciled with the store's
    /// embedding records; anything else is rebuilt from them.
    pub async fn activate(
        &self,
        slot: &mut IndexSlot,
        conversation_id: &str,
        active: &ActiveModel,
    ) -> Result<()> {
        if let Some(index) = &slot.index {
            if index.model_id() == active.model_id {
                return Ok(());
            }
        }

        let path = IndexArtifact::path_for(&self.config.index_dir, conversation_id);
        let conv = conversation_id.to_string();
        let loaded = tokio::time::timeout(
            self.persist_timeout,
            tokio::task::spawn_blocking(move || IndexArtifact::read_from(&path, &conv)),
        )
        .await
        .map_err(|_| MemoryError::timeout("index load", self.persist_timeout))?
        .map_err(|e| MemoryError::StorageFailure(format!("index load task failed: {}", e)))?;

        match loaded {
            Ok(Some(artifact))
                if artifact.model_id == active.model_id && artifact.dimension == active.dimension =>
            {
                let mut index = ConversationIndex::from_entries(
                    conversation_id,
                    artifact.model_id,
                    artifact.dimension,
                    self.settings,
                    artifact.entries,
                )?;
                let changes = self.reconcile(&mut index, active)?;
                debug!(
                    "Loaded index for {} with {} entries ({} reconciled with the store)",
                    conversation_id,
                    index.len(),
                    changes
                );
                slot.index = Some(index);
                return Ok(());
            }
            Ok(Some(artifact)) => {
                info!(
                    "Index artifact for {} was built with model {}; rebuilding for {}",
                    conversation_id, artifact.model_id, active.model_id
                );
            }
            Ok(None) => {}
            Err(e @ MemoryError::CorruptIndexArtifact { .. }) => {
                warn!("{}; rebuilding from stored embeddings", e);
            }
            Err(e) => return Err(e),
        }

        slot.index = Some(self.build_from_store(conversation_id, active)?);
        Ok(())
    }

    /// Vectors the index of `conversation_id` should hold under `active`:
    /// the store's records for that model, newest `max_index_entries` only.
    fn store_entries(&self, conversation_id: &str, active: &ActiveModel) -> Result<BTreeMap<SegmentId, Vec<f32>>> {
        let mut entries: BTreeMap<SegmentId, Vec<f32>> = self
            .db
            .embeddings
            .get_embeddings(conversation_id, &active.model_id)?
            .into_iter()
            .filter(|r| r.dimension == active.dimension)
            .map(|r| (r.segment_id, r.vector))
            .collect();
        let max_entries = self
            .db
            .conversations
            .get_conversation(conversation_id)?
            .and_then(|c| c.index_profile.max_index_entries);
        if let Some(max) = max_entries {
            while entries.len() > max {
                entries.pop_first();
            }
        }
        Ok(entries)
    }

    /// Settled segments that still lack a record for `model_id`.
    fn unmigrated(&self, conversation_id: &str, model_id: &str) -> Result<usize> {
        Ok(self
            .db
            .segments
            .segments_missing_embedding(conversation_id, model_id, usize::MAX >> 1)?
            .into_iter()
            .filter(|s| !s.embedding_pending)
            .count())
    }

    /// Brings an index loaded from disk in line with the store: drops ids the
    /// store no longer has, adds missing ones and replaces changed vectors.
    /// Returns the number of entries touched.
    fn reconcile(&self, index: &mut ConversationIndex, active: &ActiveModel) -> Result<usize> {
        let conversation_id = index.conversation_id().to_string();
        let current = self.store_entries(&conversation_id, active)?;

        let gone: Vec<SegmentId> = index
            .entries()
            .map(|(id, _)| *id)
            .filter(|id| !current.contains_key(id))
            .collect();
        let mut changes = gone.len();
        for segment_id in gone {
            index.remove(segment_id);
        }
        for (segment_id, vector) in current {
            if index.vector(segment_id) != Some(&vector) {
                index.insert(segment_id, vector)?;
                changes += 1;
            }
        }

        index.stale = self.unmigrated(&conversation_id, &active.model_id)? > 0;
        index.dirty = changes > 0;
        if changes > 0 {
            info!(
                "Index artifact for {} was behind the store; {} entries reconciled",
                conversation_id, changes
            );
        }
        Ok(changes)
    }

    /// Fresh index from the embedding records of `active`. It is stale when
    /// some settled segment still lacks a record for that model.
    pub fn build_from_store(&self, conversation_id: &str, active: &ActiveModel) -> Result<ConversationIndex> {
        let mut index = ConversationIndex::from_entries(
            conversation_id,
            active.model_id.clone(),
            active.dimension,
            self.settings,
            self.store_entries(conversation_id, active)?,
        )?;

        let unmigrated = self.unmigrated(conversation_id, &active.model_id)?;
        index.stale = unmigrated > 0;
        index.dirty = true;
        debug!(
            "Built index for {} from store: {} entries, {} segments awaiting migration",
            conversation_id,
            index.len(),
            unmigrated
        );
        Ok(index)
    }

    pub async fn insert(
        &self,
        conversation_id: &str,
        segment_id: SegmentId,
        vector: Vec<f32>,
        active: &ActiveModel,
    ) -> Result<()> {
        let mut slot = self.write(conversation_id).await;
        self.activate(&mut slot, conversation_id, active).await?;
        if let Some(index) = slot.index.as_mut() {
            index.insert(segment_id, vector)?;
        }
        Ok(())
    }

    pub async fn remove(&self, conversation_id: &str, segment_id: SegmentId) -> bool {
        let mut slot = self.write(conversation_id).await;
        slot.index
            .as_mut()
            .map(|index| index.remove(segment_id))
            .unwrap_or(false)
    }

    pub async fn search(
        &self,
        conversation_id: &str,
        query: &[f32],
        k: usize,
        active: &ActiveModel,
    ) -> Result<Vec<(SegmentId, f32)>> {
        {
            let slot = self.read(conversation_id).await;
            if let Some(index) = slot.index.as_ref().filter(|i| i.model_id() == active.model_id) {
                return index.search(query, k);
            }
        }
        let mut slot = self.write(conversation_id).await;
        self.activate(&mut slot, conversation_id, active).await?;
        match slot.index.as_ref() {
            Some(index) => index.search(query, k),
            None => Ok(Vec::new()),
        }
    }

    /// Marks every loaded index stale and drops artifacts from memory for
    /// reload under the new model.
    pub async fn mark_all_stale(&self) {
        let slots: Vec<Arc<RwLock<IndexSlot>>> =
            self.slots.iter().map(|entry| entry.value().clone()).collect();
        for slot in slots {
            let mut guard = slot.write().await;
            if let Some(index) = guard.index.as_mut() {
                index.stale = true;
            }
        }
    }

    /// Writes the artifact of one conversation if it changed.
    pub async fn persist(&self, conversation_id: &str) -> Result<bool> {
        let artifact = {
            let mut slot = self.write(conversation_id).await;
            let Some(index) = slot.index.as_mut() else {
                return Ok(false);
            };
            if !index.dirty {
                return Ok(false);
            }
            index.dirty = false;
            IndexArtifact::new(
                conversation_id,
                index.model_id(),
                index.dimension(),
                index.entries().map(|(id, v)| (*id, v.clone())).collect(),
            )?
        };

        let path = IndexArtifact::path_for(&self.config.index_dir, conversation_id);
        let outcome = tokio::time::timeout(
            self.persist_timeout,
            tokio::task::spawn_blocking(move || artifact.write_to(&path)),
        )
        .await;

        let result = match outcome {
            Ok(Ok(Ok(()))) => Ok(true),
            Ok(Ok(Err(e))) => Err(e),
            Ok(Err(join)) => Err(MemoryError::StorageFailure(format!("persist task failed: {}", join))),
            Err(_) => Err(MemoryError::timeout("index persist", self.persist_timeout)),
        };
        if result.is_err() {
            if let Some(index) = self.write(conversation_id).await.index.as_mut() {
                index.dirty = true;
            }
        }
        result
    }

    /// Persists every dirty index; failures are logged and retried later.
    pub async fn persist_dirty(&self) -> usize {
        let ids: Vec<String> = self.slots.iter().map(|e| e.key().clone()).collect();
        let outcomes = join_all(ids.iter().map(|id| self.persist(id))).await;
        let mut written = 0;
        for (conversation_id, outcome) in ids.iter().zip(outcomes) {
            match outcome {
                Ok(true) => written += 1,
                Ok(false) => {}
                Err(e) => warn!("Failed to persist index for {}: {}", conversation_id, e),
            }
        }
        if written > 0 {
            debug!("Persisted {} index artifacts", written);
        }
        written
    }

    /// Drops the in-memory index and its artifact.
    pub async fn discard(&self, conversation_id: &str) -> Result<()> {
        let mut slot = self.write(conversation_id).await;
        slot.index = None;
        let path = IndexArtifact::path_for(&self.config.index_dir, conversation_id);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn loaded_conversations(&self) -> usize {
        self.slots.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{IndexConfig, IndexProfile};
    use crate::memory_db::test_support::open_test_db;
    use crate::memory_db::{NewMessage, NewSegment, SegmentVector};
    use chrono::Utc;

    fn active(model: &str) -> ActiveModel {
        ActiveModel {
            model_id: model.into(),
            dimension: 2,
        }
    }

    fn manager(db: Arc<MemoryDatabase>, dir: &std::path::Path) -> VectorIndexManager {
        let config = IndexConfig {
            index_dir: dir.join("indexes"),
            ..Default::default()
        };
        VectorIndexManager::new(config, Duration::from_secs(5), db)
    }

    fn seed_segment(db: &MemoryDatabase, message_id: &str, vector: Option<SegmentVector>) -> SegmentId {
        let now = Utc::now();
        db.ingest_message("c1", &NewMessage::human(message_id, "a", "text", now), &IndexProfile::default())
            .unwrap();
        let segment = NewSegment {
            id: None,
            conversation_id: "c1".into(),
            member_message_ids: vec![message_id.to_string()],
            summary_text: None,
            coherence_score: 1.0,
            start_time: now,
            end_time: now,
            embedding_pending: false,
        };
        db.rewrite_segments(&[], &[(segment, vector)]).unwrap()[0]
    }

    fn vector(model: &str, v: [f32; 2]) -> Option<SegmentVector> {
        Some(SegmentVector { model_id: model.into(), vector: v.to_vec() })
    }

    #[tokio::test]
    async fn persist_and_reload() {
        let (dir, db) = open_test_db();
        let db = Arc::new(db);
        let sid = seed_segment(&db, "m1", vector("m1", [0.6, 0.8]));
        let mgr = manager(Arc::clone(&db), dir.path());
        let model = active("m1");

        mgr.insert("c1", sid, vec![0.6, 0.8], &model).await.unwrap();
        assert!(mgr.persist("c1").await.unwrap());
        assert!(!mgr.persist("c1").await.unwrap());

        let fresh = manager(db, dir.path());
        let hits = fresh.search("c1", &[0.6, 0.8], 1, &model).await.unwrap();
        assert_eq!(hits[0].0, sid);
        assert!(hits[0].1.abs() < 1e-6);
        let slot = fresh.read("c1").await;
        assert!(slot.is_ready(Some(&model)));
        assert!(!slot.index.as_ref().unwrap().dirty);
    }

    #[tokio::test]
    async fn reloaded_artifact_catches_up_with_the_store() {
        let (dir, db) = open_test_db();
        let db = Arc::new(db);
        let model = active("m1");
        let kept = seed_segment(&db, "m1", vector("m1", [1.0, 0.0]));
        let changed = seed_segment(&db, "m2", vector("m1", [0.0, 1.0]));
        {
            let mgr = manager(Arc::clone(&db), dir.path());
            mgr.insert("c1", kept, vec![1.0, 0.0], &model).await.unwrap();
            mgr.insert("c1", changed, vec![0.0, 1.0], &model).await.unwrap();
            // An entry whose segment is gone from the store.
            mgr.insert("c1", 999, vec![0.6, 0.8], &model).await.unwrap();
            assert!(mgr.persist("c1").await.unwrap());
        }

        // Closed after the artifact was written.
        let late = seed_segment(&db, "m3", vector("m1", [-1.0, 0.0]));
        db.embeddings
            .store_embedding(&crate::memory_db::EmbeddingRecord {
                segment_id: changed,
                conversation_id: "c1".into(),
                vector: vec![0.0, -1.0],
                model_id: "m1".into(),
                dimension: 2,
                created_at: Utc::now(),
            })
            .unwrap();

        let fresh = manager(db, dir.path());
        let hits = fresh.search("c1", &[-1.0, 0.0], 1, &model).await.unwrap();
        assert_eq!(hits[0].0, late);
        assert!(hits[0].1.abs() < 1e-6);
        let hits = fresh.search("c1", &[0.0, -1.0], 1, &model).await.unwrap();
        assert_eq!(hits[0].0, changed);
        assert!(hits[0].1.abs() < 1e-6);

        let slot = fresh.read("c1").await;
        let index = slot.index.as_ref().unwrap();
        assert!(!index.contains(999));
        assert_eq!(index.len(), 3);
        assert!(index.dirty);
        assert!(slot.is_ready(Some(&model)));
    }

    #[tokio::test]
    async fn corrupt_artifact_rebuilds_from_store() {
        let (dir, db) = open_test_db();
        let db = Arc::new(db);
        let sid = seed_segment(
            &db,
            "m1",
            Some(SegmentVector { model_id: "m1".into(), vector: vec![1.0, 0.0] }),
        );
        let mgr = manager(Arc::clone(&db), dir.path());
        let path = IndexArtifact::path_for(&dir.path().join("indexes"), "c1");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"garbage").unwrap();

        let hits = mgr.search("c1", &[1.0, 0.0], 3, &active("m1")).await.unwrap();
        assert_eq!(hits.iter().map(|h| h.0).collect::<Vec<_>>(), vec![sid]);
        assert!(mgr.read("c1").await.is_ready(Some(&active("m1"))));
    }

    #[tokio::test]
    async fn missing_current_model_records_mark_stale() {
        let (dir, db) = open_test_db();
        let db = Arc::new(db);
        seed_segment(
            &db,
            "m1",
            Some(SegmentVector { model_id: "old".into(), vector: vec![1.0, 0.0] }),
        );
        let mgr = manager(db, dir.path());
        let model = active("new");
        let hits = mgr.search("c1", &[1.0, 0.0], 3, &model).await.unwrap();
        assert!(hits.is_empty());
        assert!(!mgr.read("c1").await.is_ready(Some(&model)));
    }
}
