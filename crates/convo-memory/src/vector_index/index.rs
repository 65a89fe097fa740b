//! One conversation's nearest-neighbour structure.
//!
//! Live vectors are kept in an exact map. Above `linear_scan_limit` entries an
//! HNSW snapshot proposes candidates; inserts since the snapshot sit in a
//! pending set that is always scanned, and removals are tombstoned until the
//! next rebuild. Final distances are always computed exactly from the map.

use crate::config::IndexConfig;
use crate::embedding::cosine_similarity;
use crate::error::{MemoryError, Result};
use crate::memory_db::SegmentId;
use hora::core::ann_index::ANNIndex;
use hora::core::metrics::Metric;
use hora::index::hnsw_idx::HNSWIndex;
use hora::index::hnsw_params::HNSWParams;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy)]
pub struct HnswSettings {
    pub linear_scan_limit: usize,
    pub rebuild_threshold: usize,
    pub n_neighbor: usize,
    pub ef_build: usize,
    pub ef_search: usize,
}

impl From<&IndexConfig> for HnswSettings {
    fn from(config: &IndexConfig) -> Self {
        Self {
            linear_scan_limit: config.linear_scan_limit,
            rebuild_threshold: config.rebuild_threshold.max(1),
            n_neighbor: config.hnsw_neighbors,
            ef_build: config.hnsw_ef_build,
            ef_search: config.hnsw_ef_search,
        }
    }
}

/// Cosine distance, `1 - cos`, in `[0, 2]`.
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    1.0 - cosine_similarity(a, b)
}

pub struct ConversationIndex {
    conversation_id: String,
    model_id: String,
    dimension: usize,
    settings: HnswSettings,
    entries: BTreeMap<SegmentId, Vec<f32>>,
    hnsw: Option<HNSWIndex<f32, i64>>,
    snapshot_ids: HashSet<SegmentId>,
    pending: BTreeSet<SegmentId>,
    tombstones: HashSet<SegmentId>,
    /// Built for a model or a record set that is not (yet) current.
    pub stale: bool,
    /// Changed since the last persisted artifact.
    pub dirty: bool,
}

impl ConversationIndex {
    pub fn new(
        conversation_id: impl Into<String>,
        model_id: impl Into<String>,
        dimension: usize,
        settings: HnswSettings,
    ) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            model_id: model_id.into(),
            dimension,
            settings,
            entries: BTreeMap::new(),
            hnsw: None,
            snapshot_ids: HashSet::new(),
            pending: BTreeSet::new(),
            tombstones: HashSet::new(),
            stale: false,
            dirty: false,
        }
    }

    /// Bulk construction; the snapshot is built once at the end.
    pub fn from_entries<I>(
        conversation_id: impl Into<String>,
        model_id: impl Into<String>,
        dimension: usize,
        settings: HnswSettings,
        entries: I,
    ) -> Result<Self>
    where
        I: IntoIterator<Item = (SegmentId, Vec<f32>)>,
    {
        let mut index = Self::new(conversation_id, model_id, dimension, settings);
        for (segment_id, vector) in entries {
            index.check_dimension(&vector)?;
            index.entries.insert(segment_id, vector);
        }
        index.rebuild();
        Ok(index)
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, segment_id: SegmentId) -> bool {
        self.entries.contains_key(&segment_id)
    }

    pub fn has_snapshot(&self) -> bool {
        self.hnsw.is_some()
    }

    pub fn entries(&self) -> impl Iterator<Item = (&SegmentId, &Vec<f32>)> {
        self.entries.iter()
    }

    pub fn vector(&self, segment_id: SegmentId) -> Option<&Vec<f32>> {
        self.entries.get(&segment_id)
    }

    fn check_dimension(&self, vector: &[f32]) -> Result<()> {
        if vector.len() != self.dimension {
            return Err(MemoryError::InvalidInput(format!(
                "vector dimension {} does not match index dimension {}",
                vector.len(),
                self.dimension
            )));
        }
        Ok(())
    }

    /// Adds or replaces the vector of `segment_id`.
    pub fn insert(&mut self, segment_id: SegmentId, vector: Vec<f32>) -> Result<()> {
        self.check_dimension(&vector)?;
        self.entries.insert(segment_id, vector);
        self.tombstones.remove(&segment_id);
        if self.hnsw.is_some() {
            self.pending.insert(segment_id);
        }
        self.dirty = true;
        self.maybe_rebuild();
        Ok(())
    }

    pub fn remove(&mut self, segment_id: SegmentId) -> bool {
        if self.entries.remove(&segment_id).is_none() {
            return false;
        }
        self.pending.remove(&segment_id);
        if self.snapshot_ids.contains(&segment_id) {
            self.tombstones.insert(segment_id);
        }
        self.dirty = true;
        self.maybe_rebuild();
        true
    }

    /// Drops the oldest entries until at most `max_entries` remain.
    pub fn evict_to(&mut self, max_entries: usize) -> Vec<SegmentId> {
        let mut evicted = Vec::new();
        while self.entries.len() > max_entries {
            let Some(oldest) = self.entries.keys().next().copied() else {
                break;
            };
            self.remove(oldest);
            evicted.push(oldest);
        }
        if !evicted.is_empty() {
            debug!(
                "Evicted {} entries from index of conversation {}",
                evicted.len(),
                self.conversation_id
            );
        }
        evicted
    }

    fn maybe_rebuild(&mut self) {
        let over_limit = self.entries.len() > self.settings.linear_scan_limit;
        let delta = self.pending.len() + self.tombstones.len();
        if (over_limit && self.hnsw.is_none()) || delta > self.settings.rebuild_threshold {
            self.rebuild();
        }
    }

    /// Rebuilds the HNSW snapshot from the live entries, or drops it when the
    /// index is small enough to scan.
    pub fn rebuild(&mut self) {
        self.pending.clear();
        self.tombstones.clear();
        self.snapshot_ids.clear();
        self.hnsw = None;

        if self.entries.len() <= self.settings.linear_scan_limit {
            return;
        }

        let params = HNSWParams {
            n_neighbor: self.settings.n_neighbor,
            ef_build: self.settings.ef_build,
            ef_search: self.settings.ef_search,
            ..Default::default()
        };
        let mut index = HNSWIndex::<f32, i64>::new(self.dimension, &params);
        for (segment_id, vector) in &self.entries {
            if let Err(e) = index.add(vector, *segment_id) {
                warn!("HNSW add failed for segment {}: {}", segment_id, e);
                return;
            }
        }
        if let Err(e) = index.build(Metric::CosineSimilarity) {
            warn!(
                "HNSW build failed for conversation {}: {}; falling back to linear scan",
                self.conversation_id, e
            );
            return;
        }
        self.snapshot_ids = self.entries.keys().copied().collect();
        self.hnsw = Some(index);
        debug!(
            "Rebuilt HNSW snapshot for conversation {} with {} entries",
            self.conversation_id,
            self.entries.len()
        );
    }

    /// `k` nearest live segments as `(segment_id, distance)`, ascending by
    /// distance then id.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<(SegmentId, f32)>> {
        self.check_dimension(query)?;
        if k == 0 || self.entries.is_empty() {
            return Ok(Vec::new());
        }

        let candidates: Vec<SegmentId> = match &self.hnsw {
            Some(hnsw) => {
                let fetch = k + self.tombstones.len();
                let mut ids: Vec<SegmentId> = hnsw
                    .search(query, fetch)
                    .into_iter()
                    .filter(|id| !self.tombstones.contains(id))
                    .collect();
                ids.extend(self.pending.iter().copied());
                ids.sort_unstable();
                ids.dedup();
                ids
            }
            None => self.entries.keys().copied().collect(),
        };

        let mut scored: Vec<(SegmentId, f32)> = candidates
            .into_iter()
            .filter_map(|id| {
                self.entries
                    .get(&id)
                    .map(|vector| (id, cosine_distance(query, vector)))
            })
            .collect();
        scored.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
        scored.truncate(k);
        Ok(scored)
    }
}
