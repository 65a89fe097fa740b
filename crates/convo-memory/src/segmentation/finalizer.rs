//! Persists closed segments: quality pass, summary, embedding and index
//! update.

use super::quality::{coherence, plan_split};
use super::{segment_text, SegmentDraft};
use crate::config::{IndexProfile, SegmentationConfig};
use crate::embedding::{ActiveModel, EmbeddingService};
use crate::error::{MemoryError, Result};
use crate::memory_db::{
    EmbeddingRecord, MemoryDatabase, NewSegment, Segment, SegmentId, SegmentVector, StoredMessage,
};
use crate::metrics::EngineCounters;
use crate::utils::TopicExtractor;
use crate::vector_index::{IndexSlot, VectorIndexManager};
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FinalizeOutcome {
    pub segment_ids: Vec<SegmentId>,
    pub merged_into: Option<SegmentId>,
    pub split: bool,
    pub embedding_pending: bool,
}

/// One segment about to be written.
struct PlannedSegment {
    id: Option<SegmentId>,
    messages: Vec<StoredMessage>,
    coherence: f32,
}

pub struct SegmentFinalizer {
    db: Arc<MemoryDatabase>,
    embeddings: Arc<EmbeddingService>,
    indexes: Arc<VectorIndexManager>,
    counters: Arc<EngineCounters>,
    config: SegmentationConfig,
    topics: TopicExtractor,
}

impl SegmentFinalizer {
    pub fn new(
        db: Arc<MemoryDatabase>,
        embeddings: Arc<EmbeddingService>,
        indexes: Arc<VectorIndexManager>,
        counters: Arc<EngineCounters>,
        config: SegmentationConfig,
    ) -> Self {
        Self {
            db,
            embeddings,
            indexes,
            counters,
            config,
            topics: TopicExtractor::default(),
        }
    }

    fn plan(&self, draft: &SegmentDraft, messages: Vec<StoredMessage>) -> Result<(Vec<PlannedSegment>, Option<Segment>)> {
        let active_id = self.embeddings.active_model_id();
        let vectors: HashMap<&str, &[f32]> = if draft.vector_model.is_some() && draft.vector_model == active_id {
            draft
                .members
                .iter()
                .filter_map(|m| m.vector.as_deref().map(|v| (m.message_id.as_str(), v)))
                .collect()
        } else {
            HashMap::new()
        };
        let member_vectors: Vec<Option<&[f32]>> =
            messages.iter().map(|m| vectors.get(m.id.as_str()).copied()).collect();
        let known: Vec<&[f32]> = member_vectors.iter().flatten().copied().collect();
        let draft_coherence = coherence(&known);

        if !self.config.quality_pass_enabled {
            return Ok((
                vec![PlannedSegment { id: None, messages, coherence: draft_coherence }],
                None,
            ));
        }

        if messages.len() < self.config.min_segment_messages {
            if let Some(previous) = self.db.segments.latest_segment(&draft.conversation_id)? {
                let first_new = messages.first().map(|m| m.timestamp);
                if first_new.is_some_and(|ts| previous.end_time <= ts) {
                    let mut merged = self.db.conversations.get_messages_by_ids(&previous.member_message_ids)?;
                    let prev_len = merged.len() as f32;
                    let new_len = messages.len() as f32;
                    let coherence = (previous.coherence_score * prev_len + draft_coherence * new_len)
                        / (prev_len + new_len).max(1.0);
                    merged.extend(messages);
                    debug!(
                        "Merging short segment into {} of {}",
                        previous.id, draft.conversation_id
                    );
                    return Ok((
                        vec![PlannedSegment { id: Some(previous.id), messages: merged, coherence }],
                        Some(previous),
                    ));
                }
            }
        }

        if let Some(at) = plan_split(
            &member_vectors,
            self.config.min_segment_messages,
            self.config.split_threshold,
        ) {
            let mut first = messages;
            let second = first.split_off(at);
            let left = coherence(&member_vectors[..at].iter().flatten().copied().collect::<Vec<_>>());
            let right = coherence(&member_vectors[at..].iter().flatten().copied().collect::<Vec<_>>());
            debug!(
                "Splitting segment of {} at {} (coherence {:.3})",
                draft.conversation_id, at, draft_coherence
            );
            return Ok((
                vec![
                    PlannedSegment { id: None, messages: first, coherence: left },
                    PlannedSegment { id: None, messages: second, coherence: right },
                ],
                None,
            ));
        }

        Ok((
            vec![PlannedSegment { id: None, messages, coherence: draft_coherence }],
            None,
        ))
    }

    /// Writes a closed draft. Fails without side effects when the store
    /// rejects the write, so the caller can put the draft back.
    pub async fn finalize(&self, draft: &SegmentDraft, profile: &IndexProfile) -> Result<FinalizeOutcome> {
        let conversation_id = draft.conversation_id.as_str();
        let messages = self.db.conversations.get_messages_by_ids(&draft.message_ids())?;
        if messages.is_empty() {
            return Err(MemoryError::InvalidInput(format!(
                "segment draft for {} has no stored messages",
                conversation_id
            )));
        }

        let (planned, merged) = self.plan(draft, messages)?;
        let texts: Vec<String> = planned.iter().map(|p| segment_text(&p.messages)).collect();

        let active = self.embeddings.active_model();
        let vectors = match (&active, profile.vector_enabled) {
            (Some(_), true) => match self.embeddings.embed_batch(&texts).await {
                Ok(vectors) => Some(vectors),
                Err(e) => {
                    warn!(
                        "Embedding segment of {} failed, marking pending: {}",
                        conversation_id, e
                    );
                    None
                }
            },
            _ => None,
        };
        let pending = profile.vector_enabled && vectors.is_none();

        let writes: Vec<(NewSegment, Option<SegmentVector>)> = planned
            .iter()
            .enumerate()
            .map(|(i, p)| {
                let contents: Vec<&str> = p.messages.iter().map(|m| m.content.as_str()).collect();
                let segment = NewSegment {
                    id: p.id,
                    conversation_id: conversation_id.to_string(),
                    member_message_ids: p.messages.iter().map(|m| m.id.clone()).collect(),
                    summary_text: self.topics.summarize(contents),
                    coherence_score: p.coherence,
                    start_time: p.messages.first().map(|m| m.timestamp).unwrap_or_else(Utc::now),
                    end_time: p.messages.last().map(|m| m.timestamp).unwrap_or_else(Utc::now),
                    embedding_pending: pending,
                };
                let vector = vectors.as_ref().and_then(|v| v.get(i)).map(|e| SegmentVector {
                    model_id: e.model_id.clone(),
                    vector: e.vector.clone(),
                });
                (segment, vector)
            })
            .collect();

        let mut slot = self.indexes.write(conversation_id).await;
        let ids = self.db.rewrite_segments(&[], &writes)?;

        if let Some(previous) = &merged {
            if let Some(index) = slot.index.as_mut() {
                index.remove(previous.id);
            }
        }
        if let (Some(active), Some(_)) = (&active, &vectors) {
            let entries = ids
                .iter()
                .zip(&writes)
                .filter_map(|(id, (_, v))| v.as_ref().map(|v| (*id, v.vector.clone())));
            self.index_entries(&mut slot, conversation_id, active, entries, profile)
                .await;
        }
        drop(slot);

        EngineCounters::add(&self.counters.segments_closed, ids.len() as u64);
        if merged.is_some() {
            EngineCounters::inc(&self.counters.segments_merged);
        }
        if planned.len() > 1 {
            EngineCounters::inc(&self.counters.segments_split);
        }
        debug!(
            "Finalized {} segment(s) for {} ({:?}, pending: {})",
            ids.len(),
            conversation_id,
            draft.reason,
            pending
        );

        Ok(FinalizeOutcome {
            merged_into: merged.map(|s| s.id),
            split: planned.len() > 1,
            embedding_pending: pending,
            segment_ids: ids,
        })
    }

    /// Adds freshly stored vectors to an activated index. The store is the
    /// source of truth, so an index that cannot be activated is left for the
    /// next access to rebuild.
    async fn index_entries<I>(
        &self,
        slot: &mut IndexSlot,
        conversation_id: &str,
        active: &ActiveModel,
        entries: I,
        profile: &IndexProfile,
    ) where
        I: IntoIterator<Item = (SegmentId, Vec<f32>)>,
    {
        if let Err(e) = self.indexes.activate(slot, conversation_id, active).await {
            warn!("Index for {} unavailable: {}", conversation_id, e);
            return;
        }
        let Some(index) = slot.index.as_mut() else {
            return;
        };
        for (segment_id, vector) in entries {
            if let Err(e) = index.insert(segment_id, vector) {
                warn!("Index insert of segment {} failed: {}", segment_id, e);
                index.stale = true;
            }
        }
        if let Some(max) = profile.max_index_entries {
            let evicted = index.evict_to(max);
            if !evicted.is_empty() {
                debug!("Evicted {} segments from index of {}", evicted.len(), conversation_id);
            }
        }
    }

    /// Embeds up to `limit` segments left pending by earlier failures.
    /// Returns the ids that now carry a vector for the active model.
    pub async fn retry_pending(&self, limit: usize) -> Result<Vec<(String, SegmentId)>> {
        let Some(active) = self.embeddings.active_model() else {
            return Ok(Vec::new());
        };
        if !self.embeddings.is_available() {
            return Ok(Vec::new());
        }
        let pending = self.db.segments.pending_segments(limit)?;
        if pending.is_empty() {
            return Ok(Vec::new());
        }

        let mut by_conversation: BTreeMap<String, Vec<Segment>> = BTreeMap::new();
        for segment in pending {
            by_conversation
                .entry(segment.conversation_id.clone())
                .or_default()
                .push(segment);
        }

        let mut done = Vec::new();
        for (conversation_id, segments) in by_conversation {
            let profile = self
                .db
                .conversations
                .get_conversation(&conversation_id)?
                .map(|c| c.index_profile)
                .unwrap_or_default();

            let mut texts = Vec::with_capacity(segments.len());
            for segment in &segments {
                let messages = self.db.conversations.get_messages_by_ids(&segment.member_message_ids)?;
                texts.push(segment_text(&messages));
            }
            let vectors = match self.embeddings.embed_batch(&texts).await {
                Ok(vectors) => vectors,
                Err(e) => {
                    warn!("Pending embedding retry for {} failed: {}", conversation_id, e);
                    break;
                }
            };

            // Segment closes rewrite under this guard, so the membership check
            // in attach_embedding_for cannot race a merge or split.
            let mut slot = self.indexes.write(&conversation_id).await;
            let now = Utc::now();
            let mut entries = Vec::with_capacity(segments.len());
            for (segment, embedding) in segments.iter().zip(vectors) {
                let record = EmbeddingRecord {
                    segment_id: segment.id,
                    conversation_id: conversation_id.clone(),
                    dimension: embedding.vector.len(),
                    model_id: embedding.model_id,
                    vector: embedding.vector,
                    created_at: now,
                };
                if !self.db.attach_embedding_for(&record, &segment.member_message_ids)? {
                    debug!("Segment {} changed while embedding; retry skipped", segment.id);
                    continue;
                }
                entries.push((segment.id, record.vector));
                done.push((conversation_id.clone(), segment.id));
            }
            self.index_entries(&mut slot, &conversation_id, &active, entries, &profile)
                .await;
        }

        if !done.is_empty() {
            info!("Embedded {} pending segments", done.len());
        }
        Ok(done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EmbeddingConfig;
    use crate::embedding::{EmbeddingProvider, HashingEmbeddingProvider};
    use crate::memory_db::test_support::open_test_db;
    use crate::memory_db::{NewMessage, SegmentFilter};
    use crate::segmentation::{CloseReason, OpenMember};
    use crate::config::IndexConfig;
    use chrono::{DateTime, Duration as ChronoDuration, TimeZone};
    use std::time::Duration;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        db: Arc<MemoryDatabase>,
        embeddings: Arc<EmbeddingService>,
        indexes: Arc<VectorIndexManager>,
        finalizer: SegmentFinalizer,
    }

    fn fixture(provider: EmbeddingProvider, config: SegmentationConfig) -> Fixture {
        let (dir, db) = open_test_db();
        let db = Arc::new(db);
        let counters = Arc::new(EngineCounters::new().unwrap());
        let embeddings = Arc::new(EmbeddingService::new(
            provider,
            &EmbeddingConfig::default(),
            Duration::from_secs(2),
            Arc::clone(&counters),
        ));
        let indexes = Arc::new(VectorIndexManager::new(
            IndexConfig {
                index_dir: dir.path().join("indexes"),
                ..Default::default()
            },
            Duration::from_secs(5),
            Arc::clone(&db),
        ));
        let finalizer = SegmentFinalizer::new(
            Arc::clone(&db),
            Arc::clone(&embeddings),
            Arc::clone(&indexes),
            counters,
            config,
        );
        Fixture { _dir: dir, db, embeddings, indexes, finalizer }
    }

    fn hashing() -> EmbeddingProvider {
        EmbeddingProvider::Hashing(HashingEmbeddingProvider::new(7, 64))
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap()
    }

    fn store(db: &MemoryDatabase, id: &str, content: &str, minute: i64) {
        db.ingest_message(
            "c1",
            &NewMessage::human(id, "alice", content, t0() + ChronoDuration::minutes(minute)),
            &IndexProfile::default(),
        )
        .unwrap();
    }

    fn draft(ids: &[&str]) -> SegmentDraft {
        SegmentDraft {
            conversation_id: "c1".into(),
            members: ids
                .iter()
                .enumerate()
                .map(|(i, id)| OpenMember {
                    message_id: id.to_string(),
                    timestamp: t0() + ChronoDuration::minutes(i as i64),
                    vector: None,
                })
                .collect(),
            reason: CloseReason::Flush,
            vector_model: None,
        }
    }

    #[tokio::test]
    async fn finalize_embeds_and_indexes() {
        let fx = fixture(hashing(), SegmentationConfig::default());
        store(&fx.db, "m1", "release deadline is friday", 0);
        store(&fx.db, "m2", "we should ship the release notes", 1);

        let outcome = fx
            .finalizer
            .finalize(&draft(&["m1", "m2"]), &IndexProfile::default())
            .await
            .unwrap();
        assert_eq!(outcome.segment_ids.len(), 1);
        assert!(!outcome.embedding_pending);

        let segment = fx.db.segments.get_segment(outcome.segment_ids[0]).unwrap().unwrap();
        assert_eq!(segment.member_message_ids, vec!["m1", "m2"]);
        assert!(segment.summary_text.unwrap().contains("release"));

        let active = fx.embeddings.active_model().unwrap();
        let query = fx.embeddings.embed("release deadline is friday\nwe should ship the release notes").await.unwrap();
        let hits = fx.indexes.search("c1", &query.vector, 1, &active).await.unwrap();
        assert_eq!(hits[0].0, outcome.segment_ids[0]);
        assert!(hits[0].1 < 1e-4);
    }

    #[tokio::test]
    async fn short_segment_merges_into_previous() {
        let fx = fixture(hashing(), SegmentationConfig::default());
        store(&fx.db, "m1", "alpha", 0);
        store(&fx.db, "m2", "beta", 1);
        store(&fx.db, "m3", "gamma", 2);
        let first = fx
            .finalizer
            .finalize(&draft(&["m1", "m2"]), &IndexProfile::default())
            .await
            .unwrap();
        let second = fx
            .finalizer
            .finalize(&draft(&["m3"]), &IndexProfile::default())
            .await
            .unwrap();
        assert_eq!(second.merged_into, Some(first.segment_ids[0]));

        let segments = fx.db.segments.get_segments("c1", &SegmentFilter::default()).unwrap();
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].member_message_ids, vec!["m1", "m2", "m3"]);

        let active = fx.embeddings.active_model().unwrap();
        let records = fx.db.embeddings.get_embeddings("c1", &active.model_id).unwrap();
        assert_eq!(records.len(), 1);
    }

    #[tokio::test]
    async fn disabled_provider_marks_pending_then_retry_fills_it() {
        let fx = fixture(EmbeddingProvider::Disabled, SegmentationConfig::default());
        store(&fx.db, "m1", "first topic", 0);
        store(&fx.db, "m2", "more on the first topic", 1);
        let outcome = fx
            .finalizer
            .finalize(&draft(&["m1", "m2"]), &IndexProfile::default())
            .await
            .unwrap();
        assert!(outcome.embedding_pending);
        // No active model yet, nothing to retry with.
        assert!(fx.finalizer.retry_pending(10).await.unwrap().is_empty());

        fx.embeddings.set_provider(hashing());
        let done = fx.finalizer.retry_pending(10).await.unwrap();
        assert_eq!(done, vec![("c1".to_string(), outcome.segment_ids[0])]);
        let segment = fx.db.segments.get_segment(outcome.segment_ids[0]).unwrap().unwrap();
        assert!(!segment.embedding_pending);
    }

    #[tokio::test]
    async fn vector_disabled_profile_skips_embedding() {
        let fx = fixture(hashing(), SegmentationConfig::default());
        store(&fx.db, "m1", "one", 0);
        store(&fx.db, "m2", "two", 1);
        let profile = IndexProfile {
            vector_enabled: false,
            ..Default::default()
        };
        let outcome = fx.finalizer.finalize(&draft(&["m1", "m2"]), &profile).await.unwrap();
        assert!(!outcome.embedding_pending);
        let active = fx.embeddings.active_model().unwrap();
        assert!(fx.db.embeddings.get_embeddings("c1", &active.model_id).unwrap().is_empty());
    }

    #[tokio::test]
    async fn incoherent_segment_is_split() {
        let config = SegmentationConfig {
            min_segment_messages: 2,
            split_threshold: 0.5,
            ..Default::default()
        };
        let fx = fixture(hashing(), config);
        for (i, id) in ["m1", "m2", "m3", "m4"].iter().enumerate() {
            store(&fx.db, id, &format!("text {}", i), i as i64);
        }
        let model = fx.embeddings.active_model_id();
        let mut d = draft(&["m1", "m2", "m3", "m4"]);
        d.vector_model = model;
        let vectors = [[1.0f32, 0.0], [1.0, 0.0], [-1.0, 0.0], [-1.0, 0.0]];
        for (member, v) in d.members.iter_mut().zip(vectors) {
            member.vector = Some(v.to_vec());
        }

        let outcome = fx.finalizer.finalize(&d, &IndexProfile::default()).await.unwrap();
        assert!(outcome.split);
        let segments = fx.db.segments.get_segments("c1", &SegmentFilter::default()).unwrap();
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].member_message_ids, vec!["m1", "m2"]);
        assert_eq!(segments[1].member_message_ids, vec!["m3", "m4"]);
    }
}
