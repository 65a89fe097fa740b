// convo-memory/crates/convo-memory/src/lib.rs

pub mod config;
pub mod context_engine;
pub mod embedding;
pub mod engine;
pub mod error;
pub mod memory_db;
pub mod metrics;
pub mod search;
pub mod segmentation;
pub mod telemetry;
pub mod utils;
pub mod vector_index;

// Public API exports
pub use config::{IndexProfile, MemoryConfig, SearchWeights};
pub use context_engine::ContextAssembler;
pub use embedding::{EmbeddingProvider, HashingEmbeddingProvider, HttpEmbeddingProvider};
pub use engine::{BackgroundWorker, EngineStats, IngestOutcome, MemoryEngine};
pub use error::{MemoryError, Result};
pub use memory_db::{MessageKind, NewMessage, SegmentId, StoredMessage, UserInfo};
pub use search::{SearchFilters, SearchHit, SearchResponse};
pub use vector_index::MigrationReport;

use anyhow::Context;
use std::sync::Arc;

/// Engine configured from `MEMORY_*` environment variables, with tracing
/// installed and the configuration logged.
pub fn bootstrap() -> anyhow::Result<Arc<MemoryEngine>> {
    telemetry::init_tracing();
    let config = MemoryConfig::from_env().context("Failed to load memory engine configuration")?;
    config.print_config();
    let engine = MemoryEngine::open(config).context("Failed to open memory engine")?;
    Ok(Arc::new(engine))
}
