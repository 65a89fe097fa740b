mod common;

use common::{at_secs, hashing, msg};
use convo_memory::memory_db::{MessageRange, SegmentFilter};
use convo_memory::{MemoryConfig, MemoryEngine};
use proptest::prelude::*;
use std::collections::HashSet;

#[derive(Debug, Clone)]
enum Step {
    Message { gap_secs: i64, topic: usize, redeliver: bool },
    Flush,
    Tick { after_secs: i64 },
}

fn step() -> impl Strategy<Value = Step> {
    prop_oneof![
        6 => (0i64..900, 0usize..3, any::<bool>()).prop_map(|(gap_secs, topic, redeliver)| Step::Message {
            gap_secs,
            topic,
            redeliver: redeliver && gap_secs % 5 == 0,
        }),
        1 => Just(Step::Flush),
        1 => (0i64..4000).prop_map(|after_secs| Step::Tick { after_secs }),
    ]
}

const TOPICS: [&str; 3] = [
    "deployment pipeline broke on the staging cluster",
    "lunch order tacos burritos and salsa",
    "quarterly budget review spreadsheet numbers",
];

async fn run(steps: Vec<Step>) {
    let dir = tempfile::tempdir().unwrap();
    let mut config = MemoryConfig::with_data_dir(dir.path());
    config.segmentation.max_messages = 5;
    config.segmentation.min_messages_for_drift = 2;
    config.segmentation.similarity_cutoff = 0.3;
    let engine = MemoryEngine::with_provider(config, hashing(5)).unwrap();

    let mut clock = 0i64;
    let mut next_id = 0usize;
    let mut last_id: Option<String> = None;
    for step in steps {
        match step {
            Step::Message { gap_secs, topic, redeliver } => {
                clock += gap_secs;
                if redeliver {
                    if let Some(id) = &last_id {
                        engine.ingest("c1", msg(id, "u1", "again", clock)).await.unwrap();
                        continue;
                    }
                }
                let id = format!("m{}", next_id);
                next_id += 1;
                let content = format!("{} {}", TOPICS[topic], next_id);
                engine.ingest("c1", msg(&id, "u1", &content, clock)).await.unwrap();
                last_id = Some(id);
            }
            Step::Flush => {
                engine.flush("c1").await.unwrap();
            }
            Step::Tick { after_secs } => {
                engine.tick(at_secs(clock + after_secs)).await.unwrap();
            }
        }
    }

    if next_id == 0 {
        return;
    }
    engine.flush("c1").await.unwrap();
    let db = engine.database();
    assert!(db.conversations.get_unsegmented_messages("c1").unwrap().is_empty());

    let messages = db.conversations.get_messages("c1", &MessageRange::all()).unwrap();
    assert_eq!(messages.len(), next_id);

    let segments = db.segments.get_segments("c1", &SegmentFilter::default()).unwrap();
    let mut seen = HashSet::new();
    for segment in &segments {
        assert!(!segment.member_message_ids.is_empty());
        assert!(segment.start_time <= segment.end_time);
        for id in &segment.member_message_ids {
            assert!(seen.insert(id.clone()), "message {} in two segments", id);
        }
    }
    for message in &messages {
        assert!(seen.contains(&message.id), "message {} never segmented", message.id);
    }
    assert_eq!(seen.len(), messages.len());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn segments_partition_the_message_stream(steps in prop::collection::vec(step(), 1..40)) {
        tokio_test::block_on(run(steps));
    }
}
