// convo-memory/crates/convo-memory/src/config.rs

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};

/// Top-level engine configuration. Built once and handed to each component
/// at construction time.
#[derive(Debug, Clone)]
pub struct MemoryConfig {
    pub database_path: PathBuf,
    pub embedding: EmbeddingConfig,
    pub segmentation: SegmentationConfig,
    pub search: SearchConfig,
    pub cache: CacheConfig,
    pub index: IndexConfig,
    pub timeouts: TimeoutConfig,
    pub background: BackgroundConfig,
    pub default_profile: IndexProfile,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbeddingBackend {
    Http,
    Hashing,
    Disabled,
}

impl FromStr for EmbeddingBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "http" | "openai" => Ok(Self::Http),
            "hashing" | "local" => Ok(Self::Hashing),
            "disabled" | "none" | "off" => Ok(Self::Disabled),
            other => Err(anyhow::anyhow!("Unknown embedding backend: {}", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EmbeddingConfig {
    pub backend: EmbeddingBackend,
    pub endpoint_url: String,
    pub model_name: String,
    pub dimension: usize,
    pub hashing_seed: u64,
    pub batch_size: usize,
    pub hot_cache_capacity: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            backend: EmbeddingBackend::Hashing,
            endpoint_url: "http://127.0.0.1:8081".to_string(),
            model_name: "local-embedding".to_string(),
            dimension: 384,
            hashing_seed: 1,
            batch_size: 32,
            hot_cache_capacity: 4096,
        }
    }
}

/// Segment close triggers and quality-pass thresholds.
#[derive(Debug, Clone)]
pub struct SegmentationConfig {
    pub base_interval_secs: u64,
    pub min_interval_secs: u64,
    pub max_interval_secs: u64,
    pub activity_window_secs: u64,
    /// Messages per minute at which the base interval is halved.
    pub activity_reference_rate: f64,
    pub activity_shortening: bool,
    pub max_messages: usize,
    pub min_messages_for_drift: usize,
    pub similarity_cutoff: f32,
    pub min_segment_messages: usize,
    pub split_threshold: f32,
    pub quality_pass_enabled: bool,
}

impl Default for SegmentationConfig {
    fn default() -> Self {
        Self {
            base_interval_secs: 30 * 60,
            min_interval_secs: 60,
            max_interval_secs: 2 * 60 * 60,
            activity_window_secs: 5 * 60,
            activity_reference_rate: 1.0,
            activity_shortening: true,
            max_messages: 40,
            min_messages_for_drift: 4,
            similarity_cutoff: 0.15,
            min_segment_messages: 2,
            split_threshold: 0.2,
            quality_pass_enabled: true,
        }
    }
}

impl SegmentationConfig {
    pub fn base_interval(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.base_interval_secs as i64)
    }

    pub fn min_interval(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.min_interval_secs as i64)
    }

    pub fn max_interval(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.max_interval_secs as i64)
    }

    pub fn activity_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.activity_window_secs as i64)
    }
}

/// Weights of the combined ranking score. Exposed as-is so callers can tune
/// the blend per deployment.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SearchWeights {
    pub semantic: f32,
    pub keyword: f32,
    pub recency: f32,
    pub participant_bonus: f32,
}

impl Default for SearchWeights {
    fn default() -> Self {
        Self {
            semantic: 0.5,
            keyword: 0.3,
            recency: 0.2,
            participant_bonus: 0.1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SearchConfig {
    pub weights: SearchWeights,
    pub recency_half_life_secs: u64,
    pub candidate_multiplier: usize,
    pub keyword_candidate_limit: usize,
    pub default_limit: usize,
    pub max_limit: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            weights: SearchWeights::default(),
            recency_half_life_secs: 7 * 24 * 60 * 60,
            candidate_multiplier: 4,
            keyword_candidate_limit: 200,
            default_limit: 10,
            max_limit: 100,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub enabled: bool,
    pub max_entries: u64,
    pub ttl_seconds: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_entries: 1000,
            ttl_seconds: 300,
        }
    }
}

#[derive(Debug, Clone)]
pub struct IndexConfig {
    pub index_dir: PathBuf,
    /// Indexes at or below this size are scanned exactly.
    pub linear_scan_limit: usize,
    /// Pending inserts tolerated before the HNSW snapshot is rebuilt.
    pub rebuild_threshold: usize,
    pub hnsw_neighbors: usize,
    pub hnsw_ef_build: usize,
    pub hnsw_ef_search: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            index_dir: PathBuf::from("./data/indexes"),
            linear_scan_limit: 512,
            rebuild_threshold: 64,
            hnsw_neighbors: 16,
            hnsw_ef_build: 100,
            hnsw_ef_search: 50,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TimeoutConfig {
    pub embed_timeout_ms: u64,
    pub persist_timeout_ms: u64,
    pub ingest_lock_timeout_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            embed_timeout_ms: 2_000,
            persist_timeout_ms: 5_000,
            ingest_lock_timeout_ms: 1_000,
        }
    }
}

impl TimeoutConfig {
    pub fn embed(&self) -> Duration {
        Duration::from_millis(self.embed_timeout_ms)
    }

    pub fn persist(&self) -> Duration {
        Duration::from_millis(self.persist_timeout_ms)
    }

    pub fn ingest_lock(&self) -> Duration {
        Duration::from_millis(self.ingest_lock_timeout_ms)
    }
}

#[derive(Debug, Clone)]
pub struct BackgroundConfig {
    pub tick_interval_secs: u64,
    pub migration_batch_size: usize,
    pub pending_retry_limit: usize,
    /// SQLite `ANALYZE`/`optimize` runs on every Nth maintenance pass; 0 disables.
    pub db_maintenance_every: u32,
}

impl Default for BackgroundConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: 30,
            migration_batch_size: 64,
            pending_retry_limit: 32,
            db_maintenance_every: 120,
        }
    }
}

/// Per-conversation performance/resource profile, set by `configure`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexProfile {
    pub name: String,
    pub vector_enabled: bool,
    /// Oldest segments are evicted from the vector index beyond this size.
    pub max_index_entries: Option<usize>,
    pub embedding_batch_size: usize,
    /// Overrides `SegmentationConfig::max_messages` for this conversation.
    pub max_segment_messages: Option<usize>,
}

impl Default for IndexProfile {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            vector_enabled: true,
            max_index_entries: None,
            embedding_batch_size: 32,
            max_segment_messages: None,
        }
    }
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("./data/memory.db"),
            embedding: EmbeddingConfig::default(),
            segmentation: SegmentationConfig::default(),
            search: SearchConfig::default(),
            cache: CacheConfig::default(),
            index: IndexConfig::default(),
            timeouts: TimeoutConfig::default(),
            background: BackgroundConfig::default(),
            default_profile: IndexProfile::default(),
        }
    }
}

fn env_or<T>(key: &str, default: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw = env::var(key).unwrap_or_else(|_| default.into());
    raw.parse::<T>()
        .map_err(|e| anyhow::anyhow!("{}", e))
        .with_context(|| format!("Invalid value for {}: {}", key, raw))
}

impl MemoryConfig {
    /// Rooted at `data_dir`: database and index artifacts live under it.
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        let mut config = Self::default();
        config.database_path = data_dir.join("memory.db");
        config.index.index_dir = data_dir.join("indexes");
        config
    }

    pub fn from_env() -> Result<Self> {
        if let Err(e) = dotenvy::dotenv() {
            warn!("Failed to load .env file: {}. Using system environment variables.", e);
        } else {
            info!("Loaded environment variables from .env file");
        }

        let data_dir: String = env_or("MEMORY_DATA_DIR", "./data")?;
        let mut config = Self::with_data_dir(&data_dir);

        if let Ok(path) = env::var("MEMORY_DATABASE_PATH") {
            config.database_path = PathBuf::from(path);
        }
        if let Ok(dir) = env::var("MEMORY_INDEX_DIR") {
            config.index.index_dir = PathBuf::from(dir);
        }

        config.embedding = EmbeddingConfig {
            backend: env_or("MEMORY_EMBEDDING_BACKEND", "hashing")?,
            endpoint_url: env_or("MEMORY_EMBEDDING_URL", "http://127.0.0.1:8081")?,
            model_name: env_or("MEMORY_EMBEDDING_MODEL", "local-embedding")?,
            dimension: env_or("MEMORY_EMBEDDING_DIM", "384")?,
            hashing_seed: env_or("MEMORY_EMBEDDING_SEED", "1")?,
            batch_size: env_or("MEMORY_EMBEDDING_BATCH_SIZE", "32")?,
            hot_cache_capacity: env_or("MEMORY_EMBEDDING_CACHE", "4096")?,
        };

        config.segmentation = SegmentationConfig {
            base_interval_secs: env_or("MEMORY_SEGMENT_BASE_INTERVAL_SECONDS", "1800")?,
            min_interval_secs: env_or("MEMORY_SEGMENT_MIN_INTERVAL_SECONDS", "60")?,
            max_interval_secs: env_or("MEMORY_SEGMENT_MAX_INTERVAL_SECONDS", "7200")?,
            activity_window_secs: env_or("MEMORY_ACTIVITY_WINDOW_SECONDS", "300")?,
            activity_reference_rate: env_or("MEMORY_ACTIVITY_REFERENCE_RATE", "1.0")?,
            activity_shortening: env_or("MEMORY_ACTIVITY_SHORTENING", "true")?,
            max_messages: env_or("MEMORY_SEGMENT_MAX_MESSAGES", "40")?,
            min_messages_for_drift: env_or("MEMORY_SEGMENT_MIN_DRIFT_MESSAGES", "4")?,
            similarity_cutoff: env_or("MEMORY_SEGMENT_SIMILARITY_CUTOFF", "0.15")?,
            min_segment_messages: env_or("MEMORY_SEGMENT_MIN_MESSAGES", "2")?,
            split_threshold: env_or("MEMORY_SEGMENT_SPLIT_THRESHOLD", "0.2")?,
            quality_pass_enabled: env_or("MEMORY_SEGMENT_QUALITY_PASS", "true")?,
        };

        config.search = SearchConfig {
            weights: SearchWeights {
                semantic: env_or("MEMORY_WEIGHT_SEMANTIC", "0.5")?,
                keyword: env_or("MEMORY_WEIGHT_KEYWORD", "0.3")?,
                recency: env_or("MEMORY_WEIGHT_RECENCY", "0.2")?,
                participant_bonus: env_or("MEMORY_WEIGHT_PARTICIPANT", "0.1")?,
            },
            recency_half_life_secs: env_or("MEMORY_RECENCY_HALF_LIFE_SECONDS", "604800")?,
            candidate_multiplier: env_or("MEMORY_SEARCH_CANDIDATE_MULTIPLIER", "4")?,
            keyword_candidate_limit: env_or("MEMORY_KEYWORD_CANDIDATE_LIMIT", "200")?,
            default_limit: env_or("MEMORY_SEARCH_DEFAULT_LIMIT", "10")?,
            max_limit: env_or("MEMORY_SEARCH_MAX_LIMIT", "100")?,
        };

        config.cache = CacheConfig {
            enabled: env_or("MEMORY_CACHE_ENABLED", "true")?,
            max_entries: env_or("MEMORY_CACHE_MAX_ENTRIES", "1000")?,
            ttl_seconds: env_or("MEMORY_CACHE_TTL_SECONDS", "300")?,
        };

        config.index.linear_scan_limit = env_or("MEMORY_INDEX_LINEAR_SCAN_LIMIT", "512")?;
        config.index.rebuild_threshold = env_or("MEMORY_INDEX_REBUILD_THRESHOLD", "64")?;

        config.timeouts = TimeoutConfig {
            embed_timeout_ms: env_or("MEMORY_EMBED_TIMEOUT_MS", "2000")?,
            persist_timeout_ms: env_or("MEMORY_PERSIST_TIMEOUT_MS", "5000")?,
            ingest_lock_timeout_ms: env_or("MEMORY_INGEST_LOCK_TIMEOUT_MS", "1000")?,
        };

        config.background.tick_interval_secs = env_or("MEMORY_TICK_INTERVAL_SECONDS", "30")?;
        config.background.migration_batch_size = env_or("MEMORY_MIGRATION_BATCH_SIZE", "64")?;
        config.background.db_maintenance_every = env_or("MEMORY_DB_MAINTENANCE_EVERY", "120")?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let seg = &self.segmentation;
        if seg.min_interval_secs == 0 || seg.min_interval_secs > seg.max_interval_secs {
            return Err(anyhow::anyhow!(
                "Segment interval bounds invalid: min {}s, max {}s",
                seg.min_interval_secs,
                seg.max_interval_secs
            ));
        }
        if seg.max_messages == 0 {
            return Err(anyhow::anyhow!("Segment max_messages must be positive"));
        }
        if !(-1.0..=1.0).contains(&seg.similarity_cutoff) {
            return Err(anyhow::anyhow!(
                "Similarity cutoff {} outside [-1, 1]",
                seg.similarity_cutoff
            ));
        }
        if seg.activity_reference_rate <= 0.0 {
            return Err(anyhow::anyhow!("Activity reference rate must be positive"));
        }
        let w = &self.search.weights;
        if [w.semantic, w.keyword, w.recency, w.participant_bonus]
            .iter()
            .any(|v| *v < 0.0 || !v.is_finite())
        {
            return Err(anyhow::anyhow!("Search weights must be finite and non-negative"));
        }
        if self.search.recency_half_life_secs == 0 {
            return Err(anyhow::anyhow!("Recency half-life must be positive"));
        }
        if self.embedding.dimension == 0 || self.embedding.batch_size == 0 {
            return Err(anyhow::anyhow!("Embedding dimension and batch size must be positive"));
        }
        Ok(())
    }

    pub fn print_config(&self) {
        info!("Memory Engine Configuration:");
        info!("- Database: {}", self.database_path.display());
        info!("- Index Dir: {}", self.index.index_dir.display());
        info!(
            "- Embedding: {:?} (model: {}, dim: {}, batch: {})",
            self.embedding.backend,
            self.embedding.model_name,
            self.embedding.dimension,
            self.embedding.batch_size
        );
        info!(
            "- Segmentation: base {}s [{}s..{}s], max {} msgs, cutoff {}",
            self.segmentation.base_interval_secs,
            self.segmentation.min_interval_secs,
            self.segmentation.max_interval_secs,
            self.segmentation.max_messages,
            self.segmentation.similarity_cutoff
        );
        info!("- Search Weights: {:?}", self.search.weights);
        info!(
            "- Cache: enabled={}, entries={}, ttl={}s",
            self.cache.enabled, self.cache.max_entries, self.cache.ttl_seconds
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = MemoryConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_with_data_dir_roots_paths() {
        let config = MemoryConfig::with_data_dir("/tmp/mem");
        assert_eq!(config.database_path, PathBuf::from("/tmp/mem/memory.db"));
        assert_eq!(config.index.index_dir, PathBuf::from("/tmp/mem/indexes"));
    }

    #[test]
    fn test_interval_bounds_rejected() {
        let mut config = MemoryConfig::default();
        config.segmentation.min_interval_secs = 600;
        config.segmentation.max_interval_secs = 60;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_negative_weight_rejected() {
        let mut config = MemoryConfig::default();
        config.search.weights.keyword = -0.1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_backend_parsing() {
        assert_eq!("http".parse::<EmbeddingBackend>().unwrap(), EmbeddingBackend::Http);
        assert_eq!("LOCAL".parse::<EmbeddingBackend>().unwrap(), EmbeddingBackend::Hashing);
        assert_eq!("off".parse::<EmbeddingBackend>().unwrap(), EmbeddingBackend::Disabled);
        assert!("quantum".parse::<EmbeddingBackend>().is_err());
    }

    #[test]
    fn test_profile_round_trips_through_json() {
        let profile = IndexProfile {
            name: "busy".into(),
            max_index_entries: Some(500),
            ..Default::default()
        };
        let json = serde_json::to_string(&profile).unwrap();
        let parsed: IndexProfile = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, profile);
    }

    #[test]
    fn test_timeouts_convert() {
        let t = TimeoutConfig::default();
        assert_eq!(t.embed(), Duration::from_millis(2_000));
        assert!(t.ingest_lock() < t.persist());
    }
}
