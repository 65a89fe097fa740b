//! Prometheus instrumentation for one engine.
//!
//! Every engine owns its own [`Registry`], so several engines in one process
//! (tests, multi-tenant hosts) never collide on metric names.

use crate::error::Result;
use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};
use serde::Serialize;

pub struct EngineCounters {
    registry: Registry,
    pub messages_ingested: IntCounter,
    pub duplicate_writes: IntCounter,
    pub segments_closed: IntCounter,
    pub segments_merged: IntCounter,
    pub segments_split: IntCounter,
    pub embeddings_generated: IntCounter,
    pub embedding_failures: IntCounter,
    pub index_lookups: IntCounter,
    pub keyword_lookups: IntCounter,
    pub cache_hits: IntCounter,
    pub cache_misses: IntCounter,
    pub degraded_searches: IntCounter,
    pub segments_migrated: IntCounter,
    pub open_conversations: IntGauge,
    pub queued_migrations: IntGauge,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    pub messages_ingested: u64,
    pub duplicate_writes: u64,
    pub segments_closed: u64,
    pub segments_merged: u64,
    pub segments_split: u64,
    pub embeddings_generated: u64,
    pub embedding_failures: u64,
    pub index_lookups: u64,
    pub keyword_lookups: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub degraded_searches: u64,
    pub segments_migrated: u64,
}

fn counter(registry: &Registry, name: &str, help: &str) -> Result<IntCounter> {
    let counter = IntCounter::new(format!("convo_memory_{}", name), help)?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}

fn gauge(registry: &Registry, name: &str, help: &str) -> Result<IntGauge> {
    let gauge = IntGauge::new(format!("convo_memory_{}", name), help)?;
    registry.register(Box::new(gauge.clone()))?;
    Ok(gauge)
}

impl EngineCounters {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();
        Ok(Self {
            messages_ingested: counter(&registry, "messages_ingested_total", "Messages stored")?,
            duplicate_writes: counter(&registry, "duplicate_writes_total", "Redelivered messages ignored")?,
            segments_closed: counter(&registry, "segments_closed_total", "Segments written")?,
            segments_merged: counter(&registry, "segments_merged_total", "Drafts merged into the previous segment")?,
            segments_split: counter(&registry, "segments_split_total", "Drafts split in two")?,
            embeddings_generated: counter(&registry, "embeddings_generated_total", "Vectors returned by the provider")?,
            embedding_failures: counter(&registry, "embedding_failures_total", "Failed or timed out provider calls")?,
            index_lookups: counter(&registry, "index_lookups_total", "Nearest-neighbour lookups")?,
            keyword_lookups: counter(&registry, "keyword_lookups_total", "Keyword candidate lookups")?,
            cache_hits: counter(&registry, "search_cache_hits_total", "Searches answered from cache")?,
            cache_misses: counter(&registry, "search_cache_misses_total", "Searches computed")?,
            degraded_searches: counter(&registry, "degraded_searches_total", "Searches answered without vectors")?,
            segments_migrated: counter(&registry, "segments_migrated_total", "Segments re-embedded for a new model")?,
            open_conversations: gauge(&registry, "open_conversations", "Conversations with a live handle")?,
            queued_migrations: gauge(&registry, "queued_migrations", "Conversations waiting for re-embedding")?,
            registry,
        })
    }

    pub fn inc(counter: &IntCounter) -> u64 {
        counter.inc();
        counter.get()
    }

    pub fn add(counter: &IntCounter, n: u64) -> u64 {
        counter.inc_by(n);
        counter.get()
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Prometheus text exposition of every metric in the registry.
    pub fn encode_text(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            messages_ingested: self.messages_ingested.get(),
            duplicate_writes: self.duplicate_writes.get(),
            segments_closed: self.segments_closed.get(),
            segments_merged: self.segments_merged.get(),
            segments_split: self.segments_split.get(),
            embeddings_generated: self.embeddings_generated.get(),
            embedding_failures: self.embedding_failures.get(),
            index_lookups: self.index_lookups.get(),
            keyword_lookups: self.keyword_lookups.get(),
            cache_hits: self.cache_hits.get(),
            cache_misses: self.cache_misses.get(),
            degraded_searches: self.degraded_searches.get(),
            segments_migrated: self.segments_migrated.get(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn increments_show_in_snapshot() {
        let counters = EngineCounters::new().unwrap();
        EngineCounters::inc(&counters.cache_hits);
        EngineCounters::inc(&counters.cache_hits);
        EngineCounters::add(&counters.embeddings_generated, 5);

        let snap = counters.snapshot();
        assert_eq!(snap.cache_hits, 2);
        assert_eq!(snap.embeddings_generated, 5);
        assert_eq!(snap.index_lookups, 0);
    }

    #[test]
    fn text_exposition_lists_registered_metrics() {
        let counters = EngineCounters::new().unwrap();
        EngineCounters::inc(&counters.degraded_searches);
        counters.open_conversations.set(3);

        let text = counters.encode_text().unwrap();
        assert!(text.contains("convo_memory_degraded_searches_total 1"));
        assert!(text.contains("convo_memory_open_conversations 3"));
    }

    #[test]
    fn engines_do_not_share_registries() {
        let a = EngineCounters::new().unwrap();
        let b = EngineCounters::new().unwrap();
        EngineCounters::inc(&a.messages_ingested);
        assert_eq!(b.snapshot().messages_ingested, 0);
    }
}
