//! Result cache for hybrid search.
//!
//! Entries are keyed by the conversation's write generation, so bumping the
//! generation on a write orphans exactly that conversation's entries; moka
//! evicts them by size or TTL.

use super::{SearchFilters, SearchResponse};
use crate::config::CacheConfig;
use crate::utils::TextUtils;
use dashmap::DashMap;
use moka::sync::Cache;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SearchCacheKey {
    conversation_id: String,
    generation: u64,
    normalized_query: String,
    filters_hash: [u8; 32],
    limit: usize,
}

#[derive(Serialize)]
struct HashedInputs<'a> {
    filters: &'a SearchFilters,
    participants: Vec<&'a str>,
}

pub struct SearchCache {
    entries: Option<Cache<SearchCacheKey, Arc<SearchResponse>>>,
    generations: DashMap<String, u64>,
}

impl SearchCache {
    pub fn new(config: &CacheConfig) -> Self {
        let entries = config.enabled.then(|| {
            Cache::builder()
                .max_capacity(config.max_entries)
                .time_to_live(Duration::from_secs(config.ttl_seconds))
                .build()
        });
        Self {
            entries,
            generations: DashMap::new(),
        }
    }

    pub fn generation(&self, conversation_id: &str) -> u64 {
        self.generations.get(conversation_id).map(|g| *g).unwrap_or(0)
    }

    /// Invalidates every cached result of one conversation.
    pub fn bump(&self, conversation_id: &str) -> u64 {
        let mut generation = self.generations.entry(conversation_id.to_string()).or_insert(0);
        *generation += 1;
        *generation
    }

    pub fn key(
        &self,
        conversation_id: &str,
        query: &str,
        participants: &[String],
        filters: &SearchFilters,
        limit: usize,
    ) -> SearchCacheKey {
        let mut participants: Vec<&str> = participants.iter().map(String::as_str).collect();
        participants.sort_unstable();
        participants.dedup();
        let encoded = serde_json::to_vec(&HashedInputs { filters, participants }).unwrap_or_default();
        SearchCacheKey {
            conversation_id: conversation_id.to_string(),
            generation: self.generation(conversation_id),
            normalized_query: TextUtils::normalize_content(query),
            filters_hash: *blake3::hash(&encoded).as_bytes(),
            limit,
        }
    }

    pub fn get(&self, key: &SearchCacheKey) -> Option<Arc<SearchResponse>> {
        self.entries.as_ref()?.get(key)
    }

    /// Degraded responses are never stored.
    pub fn insert(&self, key: SearchCacheKey, response: Arc<SearchResponse>) {
        if response.degraded {
            return;
        }
        if let Some(entries) = &self.entries {
            debug!("Caching {} hits for {}", response.hits.len(), key.conversation_id);
            entries.insert(key, response);
        }
    }

    pub fn clear(&self) {
        if let Some(entries) = &self.entries {
            entries.invalidate_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(degraded: bool) -> Arc<SearchResponse> {
        Arc::new(SearchResponse {
            hits: Vec::new(),
            degraded,
        })
    }

    #[test]
    fn bump_only_invalidates_one_conversation() {
        let cache = SearchCache::new(&CacheConfig::default());
        let filters = SearchFilters::default();
        let a = cache.key("a", "  Deadline ", &[], &filters, 5);
        let b = cache.key("b", "deadline", &[], &filters, 5);
        cache.insert(a.clone(), response(false));
        cache.insert(b.clone(), response(false));

        assert!(cache.get(&cache.key("a", "deadline", &[], &filters, 5)).is_some());
        cache.bump("a");
        assert!(cache.get(&cache.key("a", "deadline", &[], &filters, 5)).is_none());
        assert!(cache.get(&b).is_some());
    }

    #[test]
    fn filters_and_participants_change_the_key() {
        let cache = SearchCache::new(&CacheConfig::default());
        let base = cache.key("a", "q", &[], &SearchFilters::default(), 5);
        let filtered = SearchFilters {
            author_ids: vec!["bob".into()],
            ..Default::default()
        };
        assert_ne!(base, cache.key("a", "q", &[], &filtered, 5));
        assert_ne!(base, cache.key("a", "q", &["bob".to_string()], &SearchFilters::default(), 5));
        assert_eq!(
            cache.key("a", "q", &["x".into(), "y".into()], &SearchFilters::default(), 5),
            cache.key("a", "q", &["y".into(), "x".into()], &SearchFilters::default(), 5)
        );
    }

    #[test]
    fn degraded_and_disabled_are_not_stored() {
        let cache = SearchCache::new(&CacheConfig::default());
        let key = cache.key("a", "q", &[], &SearchFilters::default(), 5);
        cache.insert(key.clone(), response(true));
        assert!(cache.get(&key).is_none());

        let off = SearchCache::new(&CacheConfig {
            enabled: false,
            ..Default::default()
        });
        off.insert(key.clone(), response(false));
        assert!(off.get(&key).is_none());
    }
}
