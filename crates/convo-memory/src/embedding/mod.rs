//! Text to vector providers and the service that fronts them.
//!
//! The provider is a closed set of variants behind [`EmbeddingProvider`].
//! [`EmbeddingService`] owns the active one, allows swapping it at runtime,
//! and tracks the single active model id that stored vectors are tagged with.

pub mod hashing_provider;
pub mod http_provider;

pub use hashing_provider::HashingEmbeddingProvider;
pub use http_provider::HttpEmbeddingProvider;

use crate::config::{EmbeddingBackend, EmbeddingConfig};
use crate::error::{MemoryError, Result};
use crate::metrics::EngineCounters;
use arc_swap::{ArcSwap, ArcSwapOption};
use async_trait::async_trait;
use moka::sync::Cache;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Contract shared by every concrete provider.
#[async_trait]
pub trait Embedder: Send + Sync {
    fn model_id(&self) -> &str;
    fn dimension(&self) -> usize;
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut vectors = self.embed_batch(&[text.to_string()]).await?;
        vectors
            .pop()
            .ok_or_else(|| MemoryError::ProviderUnavailable("provider returned no vector".into()))
    }
}

pub enum EmbeddingProvider {
    Http(HttpEmbeddingProvider),
    Hashing(HashingEmbeddingProvider),
    /// Always unavailable; search degrades to keyword-only.
    Disabled,
}

impl EmbeddingProvider {
    pub fn from_config(config: &EmbeddingConfig, request_timeout: Duration) -> Result<Self> {
        Ok(match config.backend {
            EmbeddingBackend::Http => EmbeddingProvider::Http(HttpEmbeddingProvider::new(
                config.endpoint_url.clone(),
                config.model_name.clone(),
                config.dimension,
                request_timeout,
            )?),
            EmbeddingBackend::Hashing => EmbeddingProvider::Hashing(HashingEmbeddingProvider::new(
                config.hashing_seed,
                config.dimension,
            )),
            EmbeddingBackend::Disabled => EmbeddingProvider::Disabled,
        })
    }

    fn embedder(&self) -> Option<&dyn Embedder> {
        match self {
            EmbeddingProvider::Http(p) => Some(p as &dyn Embedder),
            EmbeddingProvider::Hashing(p) => Some(p as &dyn Embedder),
            EmbeddingProvider::Disabled => None,
        }
    }

    pub fn model_id(&self) -> Option<&str> {
        self.embedder().map(|e| e.model_id())
    }

    pub fn dimension(&self) -> Option<usize> {
        self.embedder().map(|e| e.dimension())
    }

    pub fn is_disabled(&self) -> bool {
        matches!(self, EmbeddingProvider::Disabled)
    }

    pub async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        match self.embedder() {
            Some(embedder) => embedder.embed_batch(texts).await,
            None => Err(MemoryError::ProviderUnavailable("embedding provider disabled".into())),
        }
    }
}

/// Model a vector was produced by.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveModel {
    pub model_id: String,
    pub dimension: usize,
}

/// A vector tagged with the model that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct Embedding {
    pub model_id: String,
    pub vector: Vec<f32>,
}

pub struct EmbeddingService {
    provider: ArcSwap<EmbeddingProvider>,
    active: ArcSwapOption<ActiveModel>,
    hot_cache: Cache<(String, [u8; 32]), Arc<Vec<f32>>>,
    timeout: Duration,
    batch_size: usize,
    counters: Arc<EngineCounters>,
}

impl EmbeddingService {
    pub fn new(
        provider: EmbeddingProvider,
        config: &EmbeddingConfig,
        timeout: Duration,
        counters: Arc<EngineCounters>,
    ) -> Self {
        let active = provider.model_id().zip(provider.dimension()).map(|(id, dim)| {
            Arc::new(ActiveModel {
                model_id: id.to_string(),
                dimension: dim,
            })
        });
        Self {
            provider: ArcSwap::from_pointee(provider),
            active: ArcSwapOption::new(active),
            hot_cache: Cache::builder().max_capacity(config.hot_cache_capacity).build(),
            timeout,
            batch_size: config.batch_size.max(1),
            counters,
        }
    }

    /// The model whose vectors are current. Unchanged while the provider is
    /// disabled.
    pub fn active_model(&self) -> Option<ActiveModel> {
        self.active.load_full().map(|m| (*m).clone())
    }

    pub fn active_model_id(&self) -> Option<String> {
        self.active.load().as_ref().map(|m| m.model_id.clone())
    }

    pub fn is_available(&self) -> bool {
        !self.provider.load().is_disabled()
    }

    /// Installs a new provider. Returns `true` when the active model changed
    /// and stored vectors became stale.
    pub fn set_provider(&self, provider: EmbeddingProvider) -> bool {
        let next = provider.model_id().zip(provider.dimension()).map(|(id, dim)| ActiveModel {
            model_id: id.to_string(),
            dimension: dim,
        });
        self.provider.store(Arc::new(provider));

        let Some(next) = next else {
            warn!("Embedding provider disabled; keeping active model {:?}", self.active_model_id());
            return false;
        };
        let changed = self.active_model().as_ref() != Some(&next);
        if changed {
            info!("Active embedding model is now {} (dim {})", next.model_id, next.dimension);
            self.active.store(Some(Arc::new(next)));
        }
        changed
    }

    fn cache_key(model_id: &str, text: &str) -> (String, [u8; 32]) {
        (model_id.to_string(), *blake3::hash(text.as_bytes()).as_bytes())
    }

    /// Embeds `texts` in provider-sized chunks, each bounded by the timeout.
    pub async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Embedding>> {
        let provider = self.provider.load_full();
        let (model_id, dimension) = match provider.model_id().zip(provider.dimension()) {
            Some((id, dim)) => (id.to_string(), dim),
            None => {
                return Err(MemoryError::ProviderUnavailable("embedding provider disabled".into()))
            }
        };

        let mut results: Vec<Option<Arc<Vec<f32>>>> = texts
            .iter()
            .map(|t| self.hot_cache.get(&Self::cache_key(&model_id, t)))
            .collect();
        let missing: Vec<usize> = results
            .iter()
            .enumerate()
            .filter(|(_, r)| r.is_none())
            .map(|(i, _)| i)
            .collect();

        for chunk in missing.chunks(self.batch_size) {
            let batch: Vec<String> = chunk.iter().map(|&i| texts[i].clone()).collect();
            let vectors = match tokio::time::timeout(self.timeout, provider.embed_batch(&batch)).await {
                Ok(Ok(vectors)) => vectors,
                Ok(Err(e)) => {
                    EngineCounters::inc(&self.counters.embedding_failures);
                    return Err(e);
                }
                Err(_) => {
                    EngineCounters::inc(&self.counters.embedding_failures);
                    warn!("Embedding call timed out after {:?}", self.timeout);
                    return Err(MemoryError::timeout("embed", self.timeout));
                }
            };
            if vectors.len() != batch.len() {
                EngineCounters::inc(&self.counters.embedding_failures);
                return Err(MemoryError::ProviderUnavailable(format!(
                    "provider returned {} vectors for {} texts",
                    vectors.len(),
                    batch.len()
                )));
            }
            for (&i, vector) in chunk.iter().zip(vectors) {
                if vector.len() != dimension {
                    EngineCounters::inc(&self.counters.embedding_failures);
                    return Err(MemoryError::ProviderUnavailable(format!(
                        "expected dimension {}, got {}",
                        dimension,
                        vector.len()
                    )));
                }
                let vector = Arc::new(vector);
                self.hot_cache
                    .insert(Self::cache_key(&model_id, &texts[i]), Arc::clone(&vector));
                results[i] = Some(vector);
            }
            EngineCounters::add(&self.counters.embeddings_generated, batch.len() as u64);
        }
        debug!(
            "Embedded {} text(s) with {} ({} from cache)",
            texts.len(),
            model_id,
            texts.len() - missing.len()
        );

        Ok(results
            .into_iter()
            .flatten()
            .map(|v| Embedding {
                model_id: model_id.clone(),
                vector: (*v).clone(),
            })
            .collect())
    }

    pub async fn embed(&self, text: &str) -> Result<Embedding> {
        self.embed_batch(&[text.to_string()])
            .await?
            .pop()
            .ok_or_else(|| MemoryError::ProviderUnavailable("provider returned no vector".into()))
    }
}

/// Cosine similarity; 0 for mismatched lengths or zero vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a > 0.0 && norm_b > 0.0 {
        dot / (norm_a * norm_b)
    } else {
        0.0
    }
}

/// Component-wise mean of `vectors`; `None` when empty.
pub fn centroid<'a, I>(vectors: I) -> Option<Vec<f32>>
where
    I: IntoIterator<Item = &'a [f32]>,
{
    let mut sum: Option<Vec<f32>> = None;
    let mut count = 0usize;
    for v in vectors {
        match sum.as_mut() {
            Some(acc) if acc.len() == v.len() => {
                acc.iter_mut().zip(v).for_each(|(a, b)| *a += b);
            }
            Some(_) => continue,
            None => sum = Some(v.to_vec()),
        }
        count += 1;
    }
    sum.map(|mut acc| {
        acc.iter_mut().for_each(|x| *x /= count as f32);
        acc
    })
}
