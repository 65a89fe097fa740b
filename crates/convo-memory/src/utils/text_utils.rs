//! Text normalization and tokenization shared by storage, search and
//! the embedding providers.

use lazy_static::lazy_static;
use regex::Regex;
use std::borrow::Cow;

lazy_static! {
    static ref WHITESPACE_REGEX: Regex = Regex::new(r"\s+").unwrap();
    // Platform mention / channel markup such as <@123>, <#456>, <@&789>.
    static ref MARKUP_REGEX: Regex = Regex::new(r"<[@#][!&]?\d+>").unwrap();
    static ref TOKEN_REGEX: Regex = Regex::new(r"[\p{L}\p{N}_']+").unwrap();
}

const STOP_WORDS: &[&str] = &[
    "the", "a", "an", "and", "or", "but", "in", "on", "at", "to", "for", "of", "with", "by",
    "is", "am", "are", "was", "were", "be", "been", "being", "have", "has", "had", "do", "does",
    "did", "will", "would", "shall", "should", "may", "might", "must", "can", "could", "i",
    "you", "he", "she", "it", "we", "they", "me", "him", "her", "us", "them", "my", "your",
    "his", "its", "our", "their", "this", "that", "these", "those", "so", "if", "as",
];

pub struct TextUtils;

impl TextUtils {
    /// Search form of a message: markup stripped, lowercased, whitespace
    /// collapsed.
    pub fn normalize_content(text: &str) -> String {
        let stripped = MARKUP_REGEX.replace_all(text, " ");
        let lowered = stripped.to_lowercase();
        Self::normalize_whitespace(&lowered).into_owned()
    }

    pub fn normalize_whitespace(text: &str) -> Cow<'_, str> {
        if WHITESPACE_REGEX.is_match(text) {
            Cow::Owned(WHITESPACE_REGEX.replace_all(text, " ").trim().to_string())
        } else {
            Cow::Borrowed(text)
        }
    }

    /// All lowercase word tokens, stop words included.
    pub fn tokenize(text: &str) -> Vec<String> {
        TOKEN_REGEX
            .find_iter(&text.to_lowercase())
            .map(|m| m.as_str().trim_matches('\'').to_string())
            .filter(|t| !t.is_empty())
            .collect()
    }

    /// Query terms for keyword lookup: deduplicated, no stop words, length >= 2.
    pub fn keyword_terms(query: &str) -> Vec<String> {
        let mut terms: Vec<String> = Vec::new();
        for token in Self::tokenize(query) {
            if Self::is_significant_word(&token, 2) && !terms.contains(&token) {
                terms.push(token);
            }
        }
        terms
    }

    pub fn is_stop_word(word: &str) -> bool {
        STOP_WORDS.contains(&word)
    }

    pub fn is_significant_word(word: &str, min_len: usize) -> bool {
        word.chars().count() >= min_len && !Self::is_stop_word(word)
    }

    /// Byte offsets of every token in `haystack` equal to `term`.
    /// `haystack` is expected in normalized (lowercase) form.
    pub fn match_positions(haystack: &str, term: &str) -> Vec<usize> {
        if term.is_empty() {
            return Vec::new();
        }
        TOKEN_REGEX
            .find_iter(haystack)
            .filter_map(|m| {
                let raw = m.as_str();
                let leading = raw.len() - raw.trim_start_matches('\'').len();
                let token = raw.trim_matches('\'');
                (token == term).then_some(m.start() + leading)
            })
            .collect()
    }

    /// Rough token estimate used for context budgets.
    pub fn estimate_tokens(text: &str) -> usize {
        text.len().div_ceil(4)
    }

    /// Truncates on a char boundary and appends `...` when shortened.
    pub fn truncate_with_ellipsis(text: &str, max_len: usize) -> Cow<'_, str> {
        if text.len() <= max_len {
            return Cow::Borrowed(text);
        }
        if max_len <= 3 {
            return Cow::Borrowed("...");
        }
        let mut cut = max_len - 3;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        let mut result = String::with_capacity(max_len);
        result.push_str(&text[..cut]);
        result.push_str("...");
        Cow::Owned(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_strips_markup_and_case() {
        let normalized = TextUtils::normalize_content("Hey <@12345>,   the DEADLINE\nis Friday");
        assert_eq!(normalized, "hey , the deadline is friday");
    }

    #[test]
    fn keyword_terms_drop_stop_words() {
        let terms = TextUtils::keyword_terms("When is it due? Is it due soon");
        assert_eq!(terms, vec!["when", "due", "soon"]);
    }

    #[test]
    fn match_positions_finds_all() {
        assert_eq!(TextUtils::match_positions("due date is due", "due"), vec![0, 12]);
        assert!(TextUtils::match_positions("overdue again", "due").is_empty());
        assert!(TextUtils::match_positions("abc", "").is_empty());
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        let text = "héllo wörld";
        let cut = TextUtils::truncate_with_ellipsis(text, 6);
        assert!(cut.ends_with("..."));
        assert!(cut.len() <= 6);
        assert_eq!(TextUtils::truncate_with_ellipsis("short", 10), "short");
    }

    #[test]
    fn estimate_tokens_rounds_up() {
        assert_eq!(TextUtils::estimate_tokens(""), 0);
        assert_eq!(TextUtils::estimate_tokens("abcde"), 2);
    }
}
