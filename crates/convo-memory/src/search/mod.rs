//! Hybrid retrieval over a conversation's segments: keyword matches,
//! nearest-neighbour similarity and recency folded into one ranked list.

pub mod cache;
pub mod hybrid;
pub mod scoring;

pub use cache::{SearchCache, SearchCacheKey};
pub use hybrid::HybridSearcher;

use crate::memory_db::{MessageKind, SegmentId, StoredMessage};
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Conjunctive restrictions on what a search may return.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SearchFilters {
    /// Only messages written by these authors.
    pub author_ids: Vec<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub kind: Option<MessageKind>,
    /// Reference instant for recency; `now` when unset.
    pub as_of: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    /// `None` for the provisional hit built from the still-open segment.
    pub segment_id: Option<SegmentId>,
    pub score: f32,
    pub semantic: f32,
    pub keyword: f32,
    pub recency: f32,
    pub participant_match: bool,
    pub summary: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub messages: Vec<StoredMessage>,
}

impl SearchHit {
    pub fn is_provisional(&self) -> bool {
        self.segment_id.is_none()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchResponse {
    pub hits: Vec<SearchHit>,
    /// Semantic ranking was unavailable; hits are keyword and recency only.
    pub degraded: bool,
}

impl SearchResponse {
    pub fn segment_ids(&self) -> Vec<Option<SegmentId>> {
        self.hits.iter().map(|h| h.segment_id).collect()
    }
}
