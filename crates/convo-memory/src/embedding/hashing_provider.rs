//! Deterministic, training-free embedder based on feature hashing.
//!
//! Each word token and each character trigram of a padded token is hashed
//! (blake3, seeded) into one of `dimension` signed buckets. The sum is L2
//! normalized. Identical text always yields the identical vector, and texts
//! sharing words or word fragments land close together.

use super::Embedder;
use crate::error::Result;
use crate::utils::TextUtils;
use async_trait::async_trait;

const WORD_WEIGHT: f32 = 1.0;
const TRIGRAM_WEIGHT: f32 = 0.5;

#[derive(Debug, Clone)]
pub struct HashingEmbeddingProvider {
    seed: u64,
    dimension: usize,
    model_id: String,
}

impl HashingEmbeddingProvider {
    pub fn new(seed: u64, dimension: usize) -> Self {
        let dimension = dimension.max(1);
        Self {
            seed,
            dimension,
            model_id: format!("hash-{}-{}", seed, dimension),
        }
    }

    fn add_feature(&self, acc: &mut [f32], feature: &[u8], weight: f32) {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&self.seed.to_le_bytes());
        hasher.update(feature);
        let digest = hasher.finalize();
        let bytes = digest.as_bytes();

        let mut bucket_bytes = [0u8; 8];
        bucket_bytes.copy_from_slice(&bytes[..8]);
        let bucket = (u64::from_le_bytes(bucket_bytes) % self.dimension as u64) as usize;
        let sign = if bytes[8] & 1 == 0 { 1.0 } else { -1.0 };
        acc[bucket] += sign * weight;
    }

    pub fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut acc = vec![0.0f32; self.dimension];
        let normalized = TextUtils::normalize_content(text);

        for token in TextUtils::tokenize(&normalized) {
            let mut word = Vec::with_capacity(token.len() + 2);
            word.extend_from_slice(b"w:");
            word.extend_from_slice(token.as_bytes());
            self.add_feature(&mut acc, &word, WORD_WEIGHT);

            let padded: Vec<char> = std::iter::once('^')
                .chain(token.chars())
                .chain(std::iter::once('$'))
                .collect();
            for window in padded.windows(3) {
                let trigram: String = window.iter().collect();
                let mut feature = Vec::with_capacity(trigram.len() + 2);
                feature.extend_from_slice(b"c:");
                feature.extend_from_slice(trigram.as_bytes());
                self.add_feature(&mut acc, &feature, TRIGRAM_WEIGHT);
            }
        }

        let norm = acc.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            acc.iter_mut().for_each(|x| *x /= norm);
        }
        acc
    }
}

#[async_trait]
impl Embedder for HashingEmbeddingProvider {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_text(t)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::cosine_similarity;

    #[test]
    fn deterministic_and_normalized() {
        let provider = HashingEmbeddingProvider::new(7, 64);
        let a = provider.embed_text("Ship the release on Friday");
        let b = provider.embed_text("ship the   release on friday");
        assert_eq!(a, b);
        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
        assert_eq!(provider.model_id(), "hash-7-64");
    }

    #[test]
    fn related_text_scores_higher() {
        let provider = HashingEmbeddingProvider::new(1, 384);
        let base = provider.embed_text("the payment is due on friday");
        let related = provider.embed_text("when is the payment due");
        let unrelated = provider.embed_text("my cat enjoys sunny windowsills");
        assert!(cosine_similarity(&base, &related) > cosine_similarity(&base, &unrelated));
    }

    #[test]
    fn seed_changes_space() {
        let a = HashingEmbeddingProvider::new(1, 128).embed_text("hello world");
        let b = HashingEmbeddingProvider::new(2, 128).embed_text("hello world");
        assert_ne!(a, b);
    }

    #[test]
    fn empty_text_is_zero_vector() {
        let v = HashingEmbeddingProvider::new(1, 16).embed_text("   ");
        assert!(v.iter().all(|x| *x == 0.0));
    }
}
