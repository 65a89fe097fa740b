//! The hybrid search path.
//!
//! Keyword matches and nearest-neighbour hits are gathered under one read
//! guard of the conversation's index slot, so a segment close (which holds
//! the write guard across its commit and index insert) is either fully
//! visible or not at all. Provider, index and timeout failures degrade the
//! response to keyword and recency ranking instead of failing it.

use super::cache::SearchCache;
use super::scoring::{combined_score, compare_hits, keyword_strength, normalize, recency_score};
use super::{SearchFilters, SearchHit, SearchResponse};
use crate::config::SearchConfig;
use crate::embedding::{ActiveModel, EmbeddingService};
use crate::error::Result;
use crate::memory_db::{
    KeywordMatch, KeywordQuery, MemoryDatabase, Segment, SegmentFilter, SegmentId, StoredMessage,
};
use crate::metrics::EngineCounters;
use crate::utils::TextUtils;
use crate::vector_index::{IndexSlot, VectorIndexManager};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use tokio::sync::OwnedRwLockReadGuard;
use tracing::{debug, warn};

#[derive(Default)]
struct Candidate {
    semantic: f32,
    terms: BTreeSet<String>,
    occurrences: usize,
}

impl Candidate {
    fn absorb(&mut self, m: &KeywordMatch) {
        self.terms.extend(m.positions.iter().map(|(t, _)| t.clone()));
        self.occurrences += m.positions.len();
    }

    fn keyword(&self) -> f32 {
        if self.terms.is_empty() {
            0.0
        } else {
            keyword_strength(self.terms.len(), self.occurrences)
        }
    }
}

/// A hit before normalisation.
struct RawHit {
    segment_id: Option<SegmentId>,
    summary: Option<String>,
    messages: Vec<StoredMessage>,
    start_time: DateTime<Utc>,
    end_time: DateTime<Utc>,
    semantic: f32,
    keyword: f32,
}

fn message_passes(filters: &SearchFilters, m: &StoredMessage) -> bool {
    (filters.author_ids.is_empty() || filters.author_ids.contains(&m.author_id))
        && filters.since.map_or(true, |since| m.timestamp >= since)
        && filters.until.map_or(true, |until| m.timestamp <= until)
        && filters.kind.map_or(true, |kind| m.kind == kind)
}

fn segment_passes(filters: &SearchFilters, segment: &Segment, messages: &[StoredMessage]) -> bool {
    filters.since.map_or(true, |since| segment.end_time >= since)
        && filters.until.map_or(true, |until| segment.start_time <= until)
        && (filters.author_ids.is_empty()
            || messages.iter().any(|m| filters.author_ids.contains(&m.author_id)))
        && filters.kind.map_or(true, |kind| messages.iter().any(|m| m.kind == kind))
}

pub struct HybridSearcher {
    db: Arc<MemoryDatabase>,
    embeddings: Arc<EmbeddingService>,
    indexes: Arc<VectorIndexManager>,
    cache: Arc<SearchCache>,
    counters: Arc<EngineCounters>,
    config: SearchConfig,
}

impl HybridSearcher {
    pub fn new(
        db: Arc<MemoryDatabase>,
        embeddings: Arc<EmbeddingService>,
        indexes: Arc<VectorIndexManager>,
        cache: Arc<SearchCache>,
        counters: Arc<EngineCounters>,
        config: SearchConfig,
    ) -> Self {
        Self {
            db,
            embeddings,
            indexes,
            cache,
            counters,
            config,
        }
    }

    fn effective_limit(&self, limit: usize) -> usize {
        if limit == 0 {
            self.config.default_limit
        } else {
            limit.min(self.config.max_limit)
        }
    }

    /// Ranked hits for `query`. Cached responses are returned as is; a
    /// conversation that does not exist yields an empty response.
    pub async fn search(
        &self,
        conversation_id: &str,
        query: &str,
        participants: &[String],
        filters: &SearchFilters,
        limit: usize,
    ) -> Result<SearchResponse> {
        let limit = self.effective_limit(limit);
        let key = self.cache.key(conversation_id, query, participants, filters, limit);
        if let Some(cached) = self.cache.get(&key) {
            EngineCounters::inc(&self.counters.cache_hits);
            debug!("Search cache hit for {}", conversation_id);
            return Ok((*cached).clone());
        }
        EngineCounters::inc(&self.counters.cache_misses);

        let response = self
            .search_uncached(conversation_id, query, participants, filters, limit)
            .await?;
        if response.degraded {
            EngineCounters::inc(&self.counters.degraded_searches);
        } else {
            self.cache.insert(key, Arc::new(response.clone()));
        }
        Ok(response)
    }

    /// Read guard over an index slot activated for `active`. Activation
    /// failures leave the slot unready, which the caller treats as degraded.
    async fn activated_slot(&self, conversation_id: &str, active: &ActiveModel) -> OwnedRwLockReadGuard<IndexSlot> {
        let slot = self.indexes.read(conversation_id).await;
        if slot.index.as_ref().is_some_and(|i| i.model_id() == active.model_id) {
            return slot;
        }
        drop(slot);
        let mut slot = self.indexes.write(conversation_id).await;
        if let Err(e) = self.indexes.activate(&mut slot, conversation_id, active).await {
            warn!("Index for {} could not be activated: {}", conversation_id, e);
        }
        slot.downgrade()
    }

    async fn search_uncached(
        &self,
        conversation_id: &str,
        query: &str,
        participants: &[String],
        filters: &SearchFilters,
        limit: usize,
    ) -> Result<SearchResponse> {
        let Some(conversation) = self.db.conversations.get_conversation(conversation_id)? else {
            return Ok(SearchResponse::default());
        };
        let as_of = filters.as_of.unwrap_or_else(Utc::now);
        let query_text = query.trim();
        let terms = TextUtils::keyword_terms(query_text);
        let k = limit.saturating_mul(self.config.candidate_multiplier.max(1));

        let mut degraded = false;
        let mut query_vector: Option<(ActiveModel, Vec<f32>)> = None;
        if conversation.vector_enabled && !query_text.is_empty() {
            match self.embeddings.active_model() {
                None => degraded = true,
                Some(active) => match self.embeddings.embed(query_text).await {
                    Ok(e) if e.model_id == active.model_id => query_vector = Some((active, e.vector)),
                    Ok(_) => degraded = true,
                    Err(e) => {
                        debug!("Query embedding for {} failed: {}", conversation_id, e);
                        degraded = true;
                    }
                },
            }
        }

        let slot = match &query_vector {
            Some((active, _)) => self.activated_slot(conversation_id, active).await,
            None => self.indexes.read(conversation_id).await,
        };

        let semantic_hits = match &query_vector {
            Some((active, vector)) if slot.is_ready(Some(active)) => {
                EngineCounters::inc(&self.counters.index_lookups);
                match slot.index.as_ref().map(|index| index.search(vector, k)) {
                    Some(Ok(hits)) => hits,
                    Some(Err(e)) => {
                        warn!("Vector search in {} failed: {}", conversation_id, e);
                        degraded = true;
                        Vec::new()
                    }
                    None => Vec::new(),
                }
            }
            Some(_) => {
                debug!("Index for {} not ready, keyword-only search", conversation_id);
                degraded = true;
                Vec::new()
            }
            None => Vec::new(),
        };

        let mut candidates: BTreeMap<SegmentId, Candidate> = BTreeMap::new();
        let mut open_matches: Vec<KeywordMatch> = Vec::new();
        let mut recent_open: Vec<StoredMessage> = Vec::new();

        if terms.is_empty() {
            let recent = self.db.segments.get_segments(
                conversation_id,
                &SegmentFilter {
                    since: filters.since,
                    until: filters.until,
                    limit: Some(k),
                    newest_first: true,
                    ..Default::default()
                },
            )?;
            for segment in recent {
                candidates.entry(segment.id).or_default();
            }
            recent_open = self
                .db
                .conversations
                .get_unsegmented_messages(conversation_id)?
                .into_iter()
                .filter(|m| message_passes(filters, m))
                .collect();
        } else {
            EngineCounters::inc(&self.counters.keyword_lookups);
            let matches = self.db.conversations.keyword_search(
                conversation_id,
                &KeywordQuery {
                    terms,
                    author_ids: filters.author_ids.clone(),
                    since: filters.since,
                    until: filters.until,
                    kind: filters.kind,
                    limit: self.config.keyword_candidate_limit,
                },
            )?;
            for m in matches {
                match m.segment_id {
                    Some(id) => candidates.entry(id).or_default().absorb(&m),
                    None => open_matches.push(m),
                }
            }
        }
        for (segment_id, distance) in semantic_hits {
            candidates.entry(segment_id).or_default().semantic = (1.0 - distance).max(0.0);
        }
        drop(slot);

        let mut raw = self.load_segment_hits(filters, &candidates)?;
        if let Some(hit) = Self::provisional_hit(open_matches, recent_open) {
            raw.push(hit);
        }

        let mut semantic: Vec<f32> = raw.iter().map(|h| h.semantic).collect();
        let mut keyword: Vec<f32> = raw.iter().map(|h| h.keyword).collect();
        let mut recency: Vec<f32> = raw
            .iter()
            .map(|h| recency_score(h.end_time, as_of, self.config.recency_half_life_secs))
            .collect();
        normalize(&mut semantic);
        normalize(&mut keyword);
        normalize(&mut recency);

        let participants: HashSet<&str> = participants.iter().map(String::as_str).collect();
        let weights = &self.config.weights;
        let mut hits: Vec<SearchHit> = raw
            .into_iter()
            .enumerate()
            .map(|(i, h)| {
                let participant_match = h
                    .messages
                    .iter()
                    .any(|m| participants.contains(m.author_id.as_str()));
                SearchHit {
                    score: combined_score(weights, semantic[i], keyword[i], recency[i], participant_match),
                    semantic: semantic[i],
                    keyword: keyword[i],
                    recency: recency[i],
                    participant_match,
                    segment_id: h.segment_id,
                    summary: h.summary,
                    start_time: h.start_time,
                    end_time: h.end_time,
                    messages: h.messages,
                }
            })
            .collect();
        hits.sort_by(compare_hits);
        hits.truncate(limit);

        debug!(
            "Search in {} returned {} hits (degraded: {})",
            conversation_id,
            hits.len(),
            degraded
        );
        Ok(SearchResponse { hits, degraded })
    }

    fn load_segment_hits(
        &self,
        filters: &SearchFilters,
        candidates: &BTreeMap<SegmentId, Candidate>,
    ) -> Result<Vec<RawHit>> {
        let ids: Vec<SegmentId> = candidates.keys().copied().collect();
        let mut hits = Vec::with_capacity(ids.len());
        for segment in self.db.segments.get_segments_by_ids(&ids)? {
            let Some(candidate) = candidates.get(&segment.id) else {
                continue;
            };
            let messages = self.db.conversations.get_messages_by_ids(&segment.member_message_ids)?;
            if !segment_passes(filters, &segment, &messages) {
                continue;
            }
            hits.push(RawHit {
                segment_id: Some(segment.id),
                summary: segment.summary_text,
                start_time: segment.start_time,
                end_time: segment.end_time,
                semantic: candidate.semantic,
                keyword: candidate.keyword(),
                messages,
            });
        }
        Ok(hits)
    }

    /// One hit standing in for the open segment: its keyword matches, or
    /// its filtered messages for an empty query.
    fn provisional_hit(matches: Vec<KeywordMatch>, recent: Vec<StoredMessage>) -> Option<RawHit> {
        let mut candidate = Candidate::default();
        let mut messages: Vec<StoredMessage> = recent;
        for m in matches {
            candidate.absorb(&m);
            if !messages.iter().any(|existing| existing.id == m.message.id) {
                messages.push(m.message);
            }
        }
        messages.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.seq.cmp(&b.seq)));
        let start_time = messages.first()?.timestamp;
        let end_time = messages.last()?.timestamp;
        Some(RawHit {
            segment_id: None,
            summary: None,
            messages,
            start_time,
            end_time,
            semantic: 0.0,
            keyword: candidate.keyword(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CacheConfig, EmbeddingConfig, IndexConfig, IndexProfile};
    use crate::embedding::{EmbeddingProvider, HashingEmbeddingProvider};
    use crate::memory_db::test_support::open_test_db;
    use crate::memory_db::{NewMessage, NewSegment, SegmentVector};
    use chrono::{Duration as ChronoDuration, TimeZone};
    use std::time::Duration;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        db: Arc<MemoryDatabase>,
        embeddings: Arc<EmbeddingService>,
        counters: Arc<EngineCounters>,
        cache: Arc<SearchCache>,
        searcher: HybridSearcher,
    }

    fn fixture(provider: EmbeddingProvider) -> Fixture {
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
        let cache = Arc::new(SearchCache::new(&CacheConfig::default()));
        let searcher = HybridSearcher::new(
            Arc::clone(&db),
            Arc::clone(&embeddings),
            indexes,
            Arc::clone(&cache),
            Arc::clone(&counters),
            SearchConfig::default(),
        );
        Fixture { _dir: dir, db, embeddings, counters, cache, searcher }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    async fn seed_segment(fx: &Fixture, ids: &[(&str, &str, &str)], minute: i64) -> SegmentId {
        let mut member_ids = Vec::new();
        for (i, (id, author, content)) in ids.iter().enumerate() {
            let at = t0() + ChronoDuration::minutes(minute + i as i64);
            fx.db
                .ingest_message("c1", &NewMessage::human(*id, *author, *content, at), &IndexProfile::default())
                .unwrap();
            member_ids.push(id.to_string());
        }
        let messages = fx.db.conversations.get_messages_by_ids(&member_ids).unwrap();
        let text = crate::segmentation::segment_text(&messages);
        let vector = match fx.embeddings.embed(&text).await {
            Ok(e) => Some(SegmentVector { model_id: e.model_id, vector: e.vector }),
            Err(_) => None,
        };
        let segment = NewSegment {
            id: None,
            conversation_id: "c1".into(),
            member_message_ids: member_ids,
            summary_text: None,
            coherence_score: 1.0,
            start_time: messages.first().unwrap().timestamp,
            end_time: messages.last().unwrap().timestamp,
            embedding_pending: vector.is_none(),
        };
        fx.db.rewrite_segments(&[], &[(segment, vector)]).unwrap()[0]
    }

    fn hashing() -> EmbeddingProvider {
        EmbeddingProvider::Hashing(HashingEmbeddingProvider::new(3, 128))
    }

    #[tokio::test]
    async fn unknown_conversation_is_empty() {
        let fx = fixture(hashing());
        let response = fx
            .searcher
            .search("nope", "anything", &[], &SearchFilters::default(), 5)
            .await
            .unwrap();
        assert!(response.hits.is_empty());
        assert!(!response.degraded);
    }

    #[tokio::test]
    async fn keyword_and_semantic_signals_combine() {
        let fx = fixture(hashing());
        let release = seed_segment(&fx, &[("m1", "alice", "the release deadline moved to friday")], 0).await;
        let lunch = seed_segment(&fx, &[("m2", "bob", "lunch at the taco place")], 10).await;

        let response = fx
            .searcher
            .search("c1", "release deadline", &[], &SearchFilters::default(), 5)
            .await
            .unwrap();
        assert!(!response.degraded);
        assert_eq!(response.hits[0].segment_id, Some(release));
        assert!(response.hits[0].keyword > 0.99);
        assert!(response.hits.iter().all(|h| h.segment_id != Some(lunch) || h.keyword == 0.0));
        assert_eq!(fx.counters.snapshot().index_lookups, 1);
    }

    #[tokio::test]
    async fn provisional_hit_for_open_messages() {
        let fx = fixture(hashing());
        seed_segment(&fx, &[("m1", "alice", "budget review")], 0).await;
        fx.db
            .ingest_message(
                "c1",
                &NewMessage::human("m2", "bob", "budget numbers are in", t0() + ChronoDuration::hours(1)),
                &IndexProfile::default(),
            )
            .unwrap();

        let response = fx
            .searcher
            .search("c1", "budget", &["bob".to_string()], &SearchFilters::default(), 5)
            .await
            .unwrap();
        let provisional = response.hits.iter().find(|h| h.is_provisional()).unwrap();
        assert_eq!(provisional.messages[0].id, "m2");
        assert!(provisional.participant_match);
    }

    #[tokio::test]
    async fn disabled_provider_degrades_to_keyword_only() {
        let fx = fixture(EmbeddingProvider::Disabled);
        let id = seed_segment(&fx, &[("m1", "alice", "deploy window tonight")], 0).await;
        let response = fx
            .searcher
            .search("c1", "deploy", &[], &SearchFilters::default(), 5)
            .await
            .unwrap();
        assert!(response.degraded);
        assert_eq!(response.segment_ids(), vec![Some(id)]);
        assert_eq!(response.hits[0].semantic, 0.0);
        assert_eq!(fx.counters.snapshot().degraded_searches, 1);
    }

    #[tokio::test]
    async fn author_filter_excludes_other_segments() {
        let fx = fixture(hashing());
        seed_segment(&fx, &[("m1", "alice", "shipping plan")], 0).await;
        let bob = seed_segment(&fx, &[("m2", "bob", "shipping costs")], 5).await;
        let filters = SearchFilters {
            author_ids: vec!["bob".into()],
            ..Default::default()
        };
        let response = fx.searcher.search("c1", "shipping", &[], &filters, 5).await.unwrap();
        assert_eq!(response.segment_ids(), vec![Some(bob)]);
    }

    #[tokio::test]
    async fn empty_query_ranks_by_recency() {
        let fx = fixture(hashing());
        let old = seed_segment(&fx, &[("m1", "alice", "first")], 0).await;
        let new = seed_segment(&fx, &[("m2", "alice", "second")], 60).await;
        let filters = SearchFilters {
            as_of: Some(t0() + ChronoDuration::hours(2)),
            ..Default::default()
        };
        let response = fx.searcher.search("c1", "   ", &[], &filters, 5).await.unwrap();
        assert!(!response.degraded);
        assert_eq!(response.segment_ids(), vec![Some(new), Some(old)]);
    }

    #[tokio::test]
    async fn second_identical_search_is_served_from_cache() {
        let fx = fixture(hashing());
        seed_segment(&fx, &[("m1", "alice", "cache me if you can")], 0).await;
        let first = fx.searcher.search("c1", "cache", &[], &SearchFilters::default(), 5).await.unwrap();
        let second = fx.searcher.search("c1", "cache", &[], &SearchFilters::default(), 5).await.unwrap();
        assert_eq!(first, second);
        let counters = fx.counters.snapshot();
        assert_eq!(counters.index_lookups, 1);
        assert_eq!(counters.cache_hits, 1);

        fx.cache.bump("c1");
        fx.searcher.search("c1", "cache", &[], &SearchFilters::default(), 5).await.unwrap();
        assert_eq!(fx.counters.snapshot().index_lookups, 2);
    }
}
