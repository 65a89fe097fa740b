mod common;

use common::{engine, hashing, msg, segment};
use convo_memory::memory_db::SegmentFilter;
use convo_memory::{EmbeddingProvider, HttpEmbeddingProvider, IndexProfile, MemoryConfig, MemoryEngine};
use std::io::Write;
use std::time::Duration;

#[tokio::test]
async fn disabled_provider_falls_back_to_keywords_then_recovers() {
    let (_dir, engine) = engine(EmbeddingProvider::Disabled);
    let id = segment(
        &engine,
        "c1",
        &[
            ("m1", "alice", "invoice numbers are off by one", 0),
            ("m2", "bob", "fixing the invoice export", 30),
        ],
    )
    .await;

    let stored = engine.database().segments.get_segment(id).unwrap().unwrap();
    assert!(stored.embedding_pending);

    let response = engine.search("c1", "invoice", &[], 5).await.unwrap();
    assert!(response.degraded);
    assert_eq!(response.segment_ids(), vec![Some(id)]);
    assert_eq!(response.hits[0].semantic, 0.0);
    assert!(response.hits[0].keyword > 0.0);

    engine.set_embedding_provider(hashing(1)).await.unwrap();
    assert_eq!(engine.retry_pending_embeddings(10).await.unwrap(), 1);
    let stored = engine.database().segments.get_segment(id).unwrap().unwrap();
    assert!(!stored.embedding_pending);

    let response = engine.search("c1", "invoice", &[], 5).await.unwrap();
    assert!(!response.degraded);
    assert_eq!(response.hits[0].segment_id, Some(id));
}

#[tokio::test]
async fn failing_embedding_service_never_blocks_ingest() {
    let mut server = mockito::Server::new_async().await;
    let _mock = server
        .mock("POST", "/v1/embeddings")
        .with_status(503)
        .expect_at_least(1)
        .create_async()
        .await;
    let provider = EmbeddingProvider::Http(
        HttpEmbeddingProvider::new(server.url(), "remote-embedder", 8, Duration::from_secs(2)).unwrap(),
    );
    let (_dir, engine) = engine(provider);

    let id = segment(
        &engine,
        "c1",
        &[
            ("m1", "alice", "vpn keeps dropping", 0),
            ("m2", "bob", "restart the vpn client", 20),
        ],
    )
    .await;
    let stored = engine.database().segments.get_segment(id).unwrap().unwrap();
    assert!(stored.embedding_pending);

    let response = engine.search("c1", "vpn", &[], 5).await.unwrap();
    assert!(response.degraded);
    assert_eq!(response.segment_ids(), vec![Some(id)]);

    let counters = engine.counters();
    assert!(counters.embedding_failures > 0);
    assert!(counters.degraded_searches >= 1);
}

#[tokio::test]
async fn slow_embedding_service_times_out_into_pending() {
    let mut server = mockito::Server::new_async().await;
    let _mock = server
        .mock("POST", "/v1/embeddings")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_chunked_body(|w| {
            std::thread::sleep(Duration::from_millis(400));
            w.write_all(br#"{"data":[{"embedding":[1,0,0,0,0,0,0,0],"index":0}]}"#)
        })
        .expect_at_least(1)
        .create_async()
        .await;
    let provider = EmbeddingProvider::Http(
        HttpEmbeddingProvider::new(server.url(), "remote-embedder", 8, Duration::from_secs(5)).unwrap(),
    );
    let dir = tempfile::tempdir().unwrap();
    let mut config = MemoryConfig::with_data_dir(dir.path());
    config.timeouts.embed_timeout_ms = 50;
    let engine = MemoryEngine::with_provider(config, provider).unwrap();

    let id = segment(
        &engine,
        "c1",
        &[
            ("m1", "alice", "backup job failed overnight", 0),
            ("m2", "bob", "rerunning the backup now", 20),
        ],
    )
    .await;
    assert!(engine.database().segments.get_segment(id).unwrap().unwrap().embedding_pending);

    let response = engine.search("c1", "backup", &[], 5).await.unwrap();
    assert!(response.degraded);
    assert_eq!(response.segment_ids(), vec![Some(id)]);
    assert!(engine.counters().embedding_failures > 0);
}

#[tokio::test]
async fn keyword_only_conversation_is_not_degraded() {
    let (_dir, engine) = engine(hashing(1));
    let profile = IndexProfile {
        name: "keywords".into(),
        vector_enabled: false,
        ..Default::default()
    };
    engine.configure("c1", profile).await.unwrap();
    let id = segment(
        &engine,
        "c1",
        &[
            ("m1", "alice", "printer on floor two is jammed", 0),
            ("m2", "bob", "facilities ticket filed for the printer", 25),
        ],
    )
    .await;

    let db = engine.database();
    assert!(db.embeddings.get_embeddings("c1", "hash-1-128").unwrap().is_empty());
    assert!(!db.segments.get_segment(id).unwrap().unwrap().embedding_pending);

    let response = engine.search("c1", "printer", &[], 5).await.unwrap();
    assert!(!response.degraded);
    assert_eq!(response.segment_ids(), vec![Some(id)]);
    assert_eq!(response.hits[0].semantic, 0.0);
}

#[tokio::test]
async fn whole_word_match_survives_many_substring_matches() {
    let (_dir, engine) = engine(hashing(1));
    engine
        .configure(
            "c1",
            IndexProfile {
                name: "keywords".into(),
                vector_enabled: false,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    engine.ingest("c1", msg("target", "alice", "the payment is due", 0)).await.unwrap();
    for i in 0..450 {
        let id = format!("n{}", i);
        engine.ingest("c1", msg(&id, "bob", "task is overdue", 10 + i)).await.unwrap();
    }

    let response = engine.search("c1", "due", &[], 5).await.unwrap();
    assert!(!response.degraded);
    assert!(response
        .hits
        .iter()
        .any(|h| h.messages.iter().any(|m| m.id == "target")));
}

#[tokio::test]
async fn cleanup_drops_segments_of_archived_conversations() {
    let (_dir, engine) = engine(hashing(1));
    segment(
        &engine,
        "old",
        &[("m1", "a", "legacy thread", 0), ("m2", "a", "still legacy", 10)],
    )
    .await;
    segment(
        &engine,
        "live",
        &[("m3", "b", "active thread", 0), ("m4", "b", "still active", 10)],
    )
    .await;

    engine.archive_conversation("old").await.unwrap();
    let cleaned = engine.cleanup_archived(0).await.unwrap();
    assert_eq!(cleaned, vec!["old".to_string()]);

    let db = engine.database();
    assert!(db.segments.get_segments("old", &SegmentFilter::default()).unwrap().is_empty());
    assert!(db.embeddings.get_embeddings("old", "hash-1-128").unwrap().is_empty());
    assert_eq!(db.conversations.get_conversation("old").unwrap().unwrap().message_count, 2);
    assert_eq!(db.segments.get_segments("live", &SegmentFilter::default()).unwrap().len(), 1);

    assert!(engine.archive_conversation("ghost").await.is_err());
}
