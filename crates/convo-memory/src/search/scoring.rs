//! Signal normalisation and the combined ranking score.

use super::SearchHit;
use crate::config::SearchWeights;
use chrono::{DateTime, Utc};
use std::cmp::Ordering;

/// `exp(-ln 2 * age / half_life)`. Future timestamps count as age zero.
pub fn recency_score(end_time: DateTime<Utc>, as_of: DateTime<Utc>, half_life_secs: u64) -> f32 {
    let age = (as_of - end_time).num_milliseconds().max(0) as f64 / 1000.0;
    let half_life = half_life_secs.max(1) as f64;
    (-std::f64::consts::LN_2 * age / half_life).exp() as f32
}

/// Scales values into `[0, 1]` by their maximum. All-zero input is left alone.
pub fn normalize(values: &mut [f32]) {
    let max = values.iter().copied().fold(0.0f32, f32::max);
    if max > 0.0 {
        values.iter_mut().for_each(|v| *v /= max);
    }
}

/// Raw keyword strength of a group of matched messages: distinct terms
/// matched plus a small bonus per occurrence.
pub fn keyword_strength(distinct_terms: usize, occurrences: usize) -> f32 {
    distinct_terms as f32 + 0.1 * occurrences.min(20) as f32
}

pub fn combined_score(
    weights: &SearchWeights,
    semantic: f32,
    keyword: f32,
    recency: f32,
    participant: bool,
) -> f32 {
    let bonus = if participant { weights.participant_bonus } else { 0.0 };
    weights.semantic * semantic + weights.keyword * keyword + weights.recency * recency + bonus
}

/// Score descending, then newer `end_time`, then segment id ascending with
/// the provisional hit last.
pub fn compare_hits(a: &SearchHit, b: &SearchHit) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| b.end_time.cmp(&a.end_time))
        .then_with(|| {
            let key = |h: &SearchHit| h.segment_id.unwrap_or(i64::MAX);
            key(a).cmp(&key(b))
        })
}
