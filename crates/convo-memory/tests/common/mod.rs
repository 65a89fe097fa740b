#![allow(dead_code)]

use chrono::{DateTime, Duration, TimeZone, Utc};
use convo_memory::{EmbeddingProvider, HashingEmbeddingProvider, MemoryConfig, MemoryEngine, NewMessage};
use tempfile::TempDir;

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 9, 2, 9, 0, 0).unwrap()
}

pub fn at_secs(secs: i64) -> DateTime<Utc> {
    t0() + Duration::seconds(secs)
}

pub fn hashing(seed: u64) -> EmbeddingProvider {
    EmbeddingProvider::Hashing(HashingEmbeddingProvider::new(seed, 128))
}

pub fn config(dir: &TempDir) -> MemoryConfig {
    MemoryConfig::with_data_dir(dir.path())
}

pub fn engine(provider: EmbeddingProvider) -> (TempDir, MemoryEngine) {
    let dir = tempfile::tempdir().unwrap();
    let engine = MemoryEngine::with_provider(config(&dir), provider).unwrap();
    (dir, engine)
}

pub fn msg(id: &str, author: &str, content: &str, secs: i64) -> NewMessage {
    NewMessage::human(id, author, content, at_secs(secs))
}

/// Ingests `messages` and closes them as one segment. Use at least two
/// messages so the segment is not merged into its predecessor.
pub async fn segment(engine: &MemoryEngine, conversation: &str, messages: &[(&str, &str, &str, i64)]) -> i64 {
    for (id, author, content, secs) in messages {
        engine
            .ingest(conversation, msg(id, author, content, *secs))
            .await
            .unwrap();
    }
    let ids = engine.flush(conversation).await.unwrap();
    assert_eq!(ids.len(), 1, "expected exactly one segment");
    ids[0]
}
