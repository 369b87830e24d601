//! Embedding generation.
//!
//! Defines the [`Embedder`] trait and its implementations:
//! - **[`HashEmbedder`]**: deterministic feature hashing over word tokens; needs
//!   no model and no network, used for development and tests.
//! - **[`OpenAIEmbedder`]**: OpenAI-compatible `/v1/embeddings` with retry.
//! - **[`OllamaEmbedder`]**: a local Ollama instance's `/api/embed`.
//! - **`LocalEmbedder`**: in-process fastembed model (feature `local-embeddings`).
//!
//! Every vector leaving an embedder is L2-normalized, so similarity can be
//! computed as a plain dot product. The dimension is fixed by configuration
//! for the lifetime of the process; the retriever rejects anything else.
//!
//! Query embeddings are memoized by [`CachedEmbedder`], keyed on the SHA-256
//! of the text, because the same question tends to be asked many times.
//!
//! # Provider Selection
//!
//! ```rust
//! # use ragline::config::EmbeddingConfig;
//! # use ragline::embedding::create_embedder;
//! let config = EmbeddingConfig::default(); // provider = "hash", dims = 384
//! let embedder = create_embedder(&config).unwrap();
//! assert_eq!(embedder.dims(), 384);
//! ```

#[cfg(feature = "local-embeddings")]
mod local;
mod remote;

#[cfg(feature = "local-embeddings")]
pub use local::LocalEmbedder;
pub use remote::{OllamaEmbedder, OpenAIEmbedder};

use anyhow::{bail, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use std::sync::Arc;

use crate::config::EmbeddingConfig;

/// Turns text into fixed-length, unit-norm vectors.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Model identifier (e.g. `"text-embedding-3-small"`).
    fn model_name(&self) -> &str;
    /// Length of every vector this embedder returns.
    fn dims(&self) -> usize;
    /// Embed a batch, preserving input order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Embed a single query text.
pub async fn embed_query(embedder: &dyn Embedder, text: &str) -> Result<Vec<f32>> {
    embedder
        .embed(&[text.to_string()])
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| anyhow::anyhow!("Empty embedding response"))
}

// ============ Hash Embedder ============

/// Feature-hashing embedder.
///
/// Each lowercase alphanumeric token is hashed into one of `dims` buckets
/// with a hash-derived sign. Texts sharing words land close together, which
/// is enough for keyword-grade retrieval without any model download.
pub struct HashEmbedder {
    dims: usize,
}

impl HashEmbedder {
    pub fn new(dims: usize) -> Self {
        Self { dims: dims.max(1) }
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dims];
        for token in tokenize(text) {
            let digest = Sha256::digest(token.as_bytes());
            let mut bucket = [0u8; 8];
            bucket.copy_from_slice(&digest[..8]);
            let idx = (u64::from_le_bytes(bucket) % self.dims as u64) as usize;
            let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
            v[idx] += sign;
        }
        l2_normalize(&mut v);
        v
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    fn model_name(&self) -> &str {
        "feature-hash"
    }
    fn dims(&self) -> usize {
        self.dims
    }
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }
}

fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
}

// ============ Query vector cache ============

/// Memoizes single-text embeddings in front of another embedder.
///
/// Batches pass straight through; ingestion rarely repeats itself.
pub struct CachedEmbedder {
    inner: Arc<dyn Embedder>,
    vectors: DashMap<String, Arc<Vec<f32>>>,
    capacity: usize,
}

impl CachedEmbedder {
    pub fn new(inner: Arc<dyn Embedder>, capacity: usize) -> Self {
        Self {
            inner,
            vectors: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.vectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vectors.is_empty()
    }
}

#[async_trait]
impl Embedder for CachedEmbedder {
    fn model_name(&self) -> &str {
        self.inner.model_name()
    }
    fn dims(&self) -> usize {
        self.inner.dims()
    }
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let [text] = texts else {
            return self.inner.embed(texts).await;
        };

        let key = hex::encode(Sha256::digest(text.as_bytes()));
        if let Some(hit) = self.vectors.get(&key) {
            return Ok(vec![hit.as_ref().clone()]);
        }

        let vector = embed_query(self.inner.as_ref(), text).await?;
        if self.vectors.len() >= self.capacity {
            // Arbitrary eviction; any entry is as good as another here.
            let victim = self.vectors.iter().next().map(|e| e.key().clone());
            if let Some(victim) = victim {
                self.vectors.remove(&victim);
            }
        }
        self.vectors.insert(key, Arc::new(vector.clone()));
        Ok(vec![vector])
    }
}

/// Create the [`Embedder`] selected by `[embedding].provider`.
///
/// | Config Value | Embedder |
/// |-------------|----------|
/// | `"hash"` | [`HashEmbedder`] |
/// | `"openai"` | [`OpenAIEmbedder`] |
/// | `"ollama"` | [`OllamaEmbedder`] |
/// | `"local"` | `LocalEmbedder` (feature `local-embeddings`) |
///
/// The result is wrapped in a [`CachedEmbedder`] unless
/// `query_cache_capacity = 0`.
pub fn create_embedder(config: &EmbeddingConfig) -> Result<Arc<dyn Embedder>> {
    let base: Arc<dyn Embedder> = match config.provider.as_str() {
        "hash" => Arc::new(HashEmbedder::new(config.dims)),
        "openai" => Arc::new(OpenAIEmbedder::new(config)?),
        "ollama" => Arc::new(OllamaEmbedder::new(config)?),
        #[cfg(feature = "local-embeddings")]
        "local" => Arc::new(LocalEmbedder::new(config)?),
        #[cfg(not(feature = "local-embeddings"))]
        "local" => bail!("Local embedding provider requires --features local-embeddings"),
        other => bail!("Unknown embedding provider: {}", other),
    };

    if config.query_cache_capacity == 0 {
        return Ok(base);
    }
    Ok(Arc::new(CachedEmbedder::new(base, config.query_cache_capacity)))
}

/// Scale a vector to unit length in place. Zero vectors are left untouched.
pub fn l2_normalize(v: &mut [f32]) {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

/// Encode a float vector as a BLOB (little-endian f32 bytes).
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB written by [`vec_to_blob`].
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Cosine similarity in `[-1.0, 1.0]`; `0.0` for empty or mismatched input.
///
/// ```text
///            a · b
/// cos(θ) = ─────────
///          ‖a‖ × ‖b‖
/// ```
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }
    dot / denom
}
