//! Extractive segment summaries: the most frequent significant terms plus
//! a lead snippet.

use crate::utils::text_utils::TextUtils;
use std::collections::HashMap;

pub struct TopicExtractor {
    max_topics: usize,
    min_word_length: usize,
    snippet_chars: usize,
}

impl Default for TopicExtractor {
    fn default() -> Self {
        Self {
            max_topics: 5,
            min_word_length: 3,
            snippet_chars: 160,
        }
    }
}

impl TopicExtractor {
    pub fn new(max_topics: usize, min_word_length: usize, snippet_chars: usize) -> Self {
        Self {
            max_topics,
            min_word_length,
            snippet_chars,
        }
    }

    /// Top terms by frequency; ties broken by first appearance.
    pub fn extract_topics<'a, I>(&self, texts: I) -> Vec<String>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut counts: HashMap<String, (usize, usize)> = HashMap::new();
        let mut order = 0usize;
        for text in texts {
            for token in TextUtils::tokenize(text) {
                if !TextUtils::is_significant_word(&token, self.min_word_length) {
                    continue;
                }
                let entry = counts.entry(token).or_insert_with(|| {
                    order += 1;
                    (0, order)
                });
                entry.0 += 1;
            }
        }

        let mut ranked: Vec<(String, (usize, usize))> = counts.into_iter().collect();
        ranked.sort_by(|a, b| b.1 .0.cmp(&a.1 .0).then(a.1 .1.cmp(&b.1 .1)));
        ranked
            .into_iter()
            .take(self.max_topics)
            .map(|(term, _)| term)
            .collect()
    }

    /// `None` when the texts carry no significant terms.
    pub fn summarize<'a, I>(&self, texts: I) -> Option<String>
    where
        I: IntoIterator<Item = &'a str> + Clone,
    {
        let topics = self.extract_topics(texts.clone());
        if topics.is_empty() {
            return None;
        }
        let lead = texts
            .into_iter()
            .find(|t| !t.trim().is_empty())
            .map(|t| TextUtils::truncate_with_ellipsis(t.trim(), self.snippet_chars).into_owned())
            .unwrap_or_default();
        Some(format!("[{}] {}", topics.join(", "), lead))
    }
}
