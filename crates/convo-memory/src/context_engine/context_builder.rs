//! Renders ranked search hits into a prompt-ready text block under a token
//! budget.

use crate::memory_db::UserInfo;
use crate::search::{SearchHit, SearchResponse};
use crate::utils::TextUtils;
use std::collections::HashMap;
use tracing::debug;

/// Hits whose remaining room is smaller than this are dropped rather than
/// truncated into a stub.
const MIN_TRUNCATED_BYTES: usize = 24;

#[derive(Debug, Clone)]
pub struct ContextAssemblerConfig {
    pub header: String,
    pub include_summaries: bool,
    pub timestamp_format: String,
}

impl Default for ContextAssemblerConfig {
    fn default() -> Self {
        Self {
            header: "[Relevant memory from this conversation]".to_string(),
            include_summaries: true,
            timestamp_format: "%Y-%m-%d %H:%M UTC".to_string(),
        }
    }
}

pub struct ContextAssembler {
    config: ContextAssemblerConfig,
}

impl Default for ContextAssembler {
    fn default() -> Self {
        Self::new(ContextAssemblerConfig::default())
    }
}

impl ContextAssembler {
    pub fn new(config: ContextAssemblerConfig) -> Self {
        Self { config }
    }

    fn render_hit(&self, hit: &SearchHit, names: &HashMap<&str, &str>) -> String {
        let mut block = format!(
            "--- {}{} ---\n",
            hit.start_time.format(&self.config.timestamp_format),
            if hit.is_provisional() { " (ongoing)" } else { "" }
        );
        if self.config.include_summaries {
            if let Some(summary) = &hit.summary {
                block.push_str(&format!("Summary: {}\n", summary));
            }
        }
        for message in &hit.messages {
            let author = names
                .get(message.author_id.as_str())
                .copied()
                .unwrap_or(message.author_id.as_str());
            block.push_str(&format!("{}: {}\n", author, message.content.trim()));
        }
        block
    }

    /// Hits are taken in rank order while they fit; the first one that does
    /// not fit is cut with an ellipsis and the rest are dropped. The result
    /// never exceeds `max_tokens` by [`TextUtils::estimate_tokens`].
    pub fn assemble(&self, response: &SearchResponse, participants: &[UserInfo], max_tokens: usize) -> String {
        let budget = max_tokens.saturating_mul(4);
        let header = format!("{}\n", self.config.header);
        if response.hits.is_empty() || header.len() >= budget {
            return String::new();
        }

        let names: HashMap<&str, &str> = participants
            .iter()
            .map(|u| (u.user_id.as_str(), u.display_name.as_str()))
            .collect();

        let mut out = header;
        let mut included = 0;
        for hit in &response.hits {
            let block = self.render_hit(hit, &names);
            let room = budget - out.len();
            if block.len() <= room {
                out.push_str(&block);
                included += 1;
                continue;
            }
            if room >= MIN_TRUNCATED_BYTES {
                out.push_str(&TextUtils::truncate_with_ellipsis(&block, room));
                included += 1;
            }
            break;
        }

        if included == 0 {
            return String::new();
        }
        debug!(
            "Assembled context from {}/{} hits ({} tokens)",
            included,
            response.hits.len(),
            TextUtils::estimate_tokens(&out)
        );
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_db::{MessageKind, StoredMessage};
    use chrono::{TimeZone, Utc};

    fn hit(id: i64, text: &str) -> SearchHit {
        let at = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 0).unwrap();
        SearchHit {
            segment_id: Some(id),
            score: 1.0,
            semantic: 1.0,
            keyword: 0.0,
            recency: 0.0,
            participant_match: false,
            summary: None,
            start_time: at,
            end_time: at,
            messages: vec![StoredMessage {
                seq: id,
                id: format!("m{}", id),
                conversation_id: "c1".into(),
                author_id: "u1".into(),
                content: text.into(),
                normalized_content: text.to_lowercase(),
                timestamp: at,
                kind: MessageKind::Human,
            }],
        }
    }

    fn users() -> Vec<UserInfo> {
        vec![UserInfo {
            user_id: "u1".into(),
            display_name: "Alice".into(),
            last_active: None,
            free_text_data: None,
        }]
    }

    #[test]
    fn renders_display_names_and_timestamps() {
        let response = SearchResponse {
            hits: vec![hit(1, "ship it friday")],
            degraded: false,
        };
        let text = ContextAssembler::default().assemble(&response, &users(), 200);
        assert!(text.contains("Alice: ship it friday"));
        assert!(text.contains("2024-01-02 03:04 UTC"));
    }

    #[test]
    fn never_exceeds_budget() {
        let long = "word ".repeat(200);
        let response = SearchResponse {
            hits: vec![hit(1, "short one"), hit(2, &long), hit(3, "dropped")],
            degraded: false,
        };
        let assembler = ContextAssembler::default();
        for budget in [20, 40, 80, 400] {
            let text = assembler.assemble(&response, &users(), budget);
            assert!(TextUtils::estimate_tokens(&text) <= budget, "budget {}", budget);
        }
        let text = assembler.assemble(&response, &users(), 80);
        assert!(text.contains("short one"));
        assert!(text.ends_with("..."));
        assert!(!text.contains("dropped"));
    }

    #[test]
    fn empty_response_is_empty() {
        let text = ContextAssembler::default().assemble(&SearchResponse::default(), &[], 100);
        assert!(text.is_empty());
    }
}
