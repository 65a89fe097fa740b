//! Coherence scoring and split planning for closed segments.

use crate::embedding::{centroid, cosine_similarity};

/// Mean similarity of each vector to the centroid. A single vector (or none)
/// is perfectly coherent.
pub fn coherence(vectors: &[&[f32]]) -> f32 {
    if vectors.len() < 2 {
        return 1.0;
    }
    let Some(center) = centroid(vectors.iter().copied()) else {
        return 1.0;
    };
    let total: f32 = vectors.iter().map(|v| cosine_similarity(v, &center)).sum();
    total / vectors.len() as f32
}

/// Split position `i` (the second part starts at `i`) at the least similar
/// pair of neighbours, leaving at least `min_part` vectors on each side.
pub fn weakest_link(vectors: &[&[f32]], min_part: usize) -> Option<usize> {
    let min_part = min_part.max(1);
    if vectors.len() < 2 * min_part {
        return None;
    }
    (min_part..=vectors.len() - min_part)
        .map(|i| (i, cosine_similarity(vectors[i - 1], vectors[i])))
        .min_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)))
        .map(|(i, _)| i)
}

/// Where to split a segment, if it should be split at all: every member has
/// a vector, there are at least `2 * min_messages` members, and coherence is
/// below `threshold`. Both halves keep at least `min_messages` members.
pub fn plan_split(vectors: &[Option<&[f32]>], min_messages: usize, threshold: f32) -> Option<usize> {
    let min_messages = min_messages.max(1);
    if vectors.len() < 2 * min_messages {
        return None;
    }
    let all: Vec<&[f32]> = vectors.iter().copied().collect::<Option<Vec<_>>>()?;
    if coherence(&all) >= threshold {
        return None;
    }
    weakest_link(&all, min_messages)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_vectors_are_coherent() {
        let v = [1.0f32, 0.0];
        assert!((coherence(&[&v[..], &v[..], &v[..]]) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn weakest_link_finds_topic_change() {
        let a = [1.0f32, 0.0, 0.0];
        let b = [0.9f32, 0.1, 0.0];
        let c = [0.0f32, 0.0, 1.0];
        assert_eq!(weakest_link(&[&a[..], &b[..], &c[..]], 1), Some(2));
        assert_eq!(weakest_link(&[&a[..]], 1), None);
    }

    #[test]
    fn weakest_link_respects_minimum_part() {
        let a = [1.0f32, 0.0];
        let b = [0.0f32, 1.0];
        // Boundaries 1 and 3 tie; the earlier one wins unless it leaves too short a part.
        let vectors = [&a[..], &b[..], &b[..], &a[..], &a[..]];
        assert_eq!(weakest_link(&vectors, 1), Some(1));
        assert_eq!(weakest_link(&vectors, 2), Some(3));
        assert_eq!(weakest_link(&vectors, 3), None);
    }

    #[test]
    fn split_only_when_incoherent_and_large_enough() {
        let x = [1.0f32, 0.0];
        let y = [0.0f32, 1.0];
        let z = [-1.0f32, 0.0];
        let mixed = [Some(&x[..]), Some(&x[..]), Some(&z[..]), Some(&z[..])];
        assert_eq!(plan_split(&mixed, 2, 0.5), Some(2));
        assert_eq!(plan_split(&mixed[..3], 2, 0.5), None);

        let uniform = [Some(&y[..]); 4];
        assert_eq!(plan_split(&uniform, 2, 0.5), None);

        let missing = [Some(&x[..]), None, Some(&z[..]), Some(&z[..])];
        assert_eq!(plan_split(&missing, 2, 0.5), None);
    }
}
