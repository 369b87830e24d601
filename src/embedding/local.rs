//! In-process embeddings via fastembed.
//!
//! The ONNX model is downloaded on first use and loaded once; later calls
//! reuse the loaded session on the blocking pool.

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use tokio::sync::OnceCell;

use super::{l2_normalize, Embedder};
use crate::config::EmbeddingConfig;

pub struct LocalEmbedder {
    model_name: String,
    dims: usize,
    batch_size: usize,
    model: OnceCell<Arc<Mutex<fastembed::TextEmbedding>>>,
}

impl LocalEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model_name = config
            .model
            .clone()
            .unwrap_or_else(|| "all-minilm-l6-v2".to_string());
        // Fail fast on unknown names instead of on the first query.
        fastembed_model(&model_name)?;
        Ok(Self {
            model_name,
            dims: config.dims,
            batch_size: config.batch_size.max(1),
            model: OnceCell::new(),
        })
    }

    async fn loaded(&self) -> Result<Arc<Mutex<fastembed::TextEmbedding>>> {
        let model = self
            .model
            .get_or_try_init(|| async {
                let which = fastembed_model(&self.model_name)?;
                tokio::task::spawn_blocking(move || {
                    fastembed::TextEmbedding::try_new(fastembed::InitOptions::new(which))
                        .map(|m| Arc::new(Mutex::new(m)))
                        .map_err(|e| {
                            anyhow::anyhow!("Failed to initialize local embedding model: {}", e)
                        })
                })
                .await?
            })
            .await?;
        Ok(model.clone())
    }
}

#[async_trait]
impl Embedder for LocalEmbedder {
    fn model_name(&self) -> &str {
        &self.model_name
    }
    fn dims(&self) -> usize {
        self.dims
    }
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let model = self.loaded().await?;
        let texts = texts.to_vec();
        let batch_size = self.batch_size;

        tokio::task::spawn_blocking(move || {
            let mut guard = model
                .lock()
                .map_err(|_| anyhow::anyhow!("local embedding model lock poisoned"))?;
            let mut vectors = guard
                .embed(texts, Some(batch_size))
                .map_err(|e| anyhow::anyhow!("Local embedding failed: {}", e))?;
            for v in vectors.iter_mut() {
                l2_normalize(v);
            }
            Ok(vectors)
        })
        .await?
    }
}

fn fastembed_model(name: &str) -> Result<fastembed::EmbeddingModel> {
    match name {
        "all-minilm-l6-v2" => Ok(fastembed::EmbeddingModel::AllMiniLML6V2),
        "bge-small-en-v1.5" => Ok(fastembed::EmbeddingModel::BGESmallENV15),
        "bge-base-en-v1.5" => Ok(fastembed::EmbeddingModel::BGEBaseENV15),
        "nomic-embed-text-v1.5" => Ok(fastembed::EmbeddingModel::NomicEmbedTextV15),
        "multilingual-e5-small" => Ok(fastembed::EmbeddingModel::MultilingualE5Small),
        other => bail!(
            "Unknown local embedding model: '{}'. Supported models: \
             all-minilm-l6-v2, bge-small-en-v1.5, bge-base-en-v1.5, \
             nomic-embed-text-v1.5, multilingual-e5-small",
            other
        ),
    }
}
