//! Tenant-scoped vector index and top-k retrieval.
//!
//! [`Retriever`] is the only entry point the rest of the service uses. It
//! owns the dimension check, the embedding of chunk text and query text, and
//! the store timeout. Storage itself sits behind [`VectorStore`]:
//!
//! | Backend | Type | Notes |
//! |---------|------|-------|
//! | `memory` | [`MemoryVectorStore`] | lock-free reads over immutable snapshots |
//! | `sqlite` | [`SqliteVectorStore`] | vectors as BLOBs, WAL snapshot reads |
//!
//! # Ordering
//!
//! Results are sorted by descending cosine similarity. Equal scores keep the
//! tenant's insertion order, so identical queries return identical lists.

mod memory;
mod sqlite;

pub use memory::MemoryVectorStore;
pub use sqlite::SqliteVectorStore;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Duration;

use crate::chunk::content_hash;
use crate::config::StoreConfig;
use crate::embedding::{embed_query, Embedder};
use crate::error::{IndexError, RetrievalError};
use crate::models::{ChunkInput, IndexOutcome, IndexedChunk, ScoredChunk};

/// Storage for indexed chunks.
///
/// Implementations must keep search results free of torn writes while
/// `upsert` runs concurrently, and must never return another tenant's rows.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Add chunks, returning one outcome per input in input order.
    async fn upsert(&self, chunks: Vec<IndexedChunk>) -> Result<Vec<IndexOutcome>>;

    /// The `k` most similar chunks of `tenant_id`.
    async fn search(&self, tenant_id: &str, query: &[f32], k: usize) -> Result<Vec<ScoredChunk>>;

    /// Number of searchable chunks, for one tenant or overall.
    async fn count(&self, tenant_id: Option<&str>) -> Result<usize>;
}

/// Build the store selected by `[store].backend`.
pub async fn create_store(config: &StoreConfig) -> Result<Arc<dyn VectorStore>> {
    match config.backend.as_str() {
        "memory" => Ok(Arc::new(MemoryVectorStore::new())),
        "sqlite" => Ok(Arc::new(SqliteVectorStore::open(&config.path).await?)),
        other => anyhow::bail!("Unknown store backend: {}", other),
    }
}

/// Sort by score (desc) then insertion order (asc) and keep the top `k`.
pub(crate) fn rank(mut hits: Vec<ScoredChunk>, k: usize) -> Vec<ScoredChunk> {
    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then(a.seq.cmp(&b.seq))
    });
    hits.truncate(k);
    hits
}

/// Per-call summary of an indexing request.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct IndexReport {
    pub inserted: usize,
    pub unchanged: usize,
    pub superseded: usize,
}

impl IndexReport {
    fn record(&mut self, outcome: IndexOutcome) {
        match outcome {
            IndexOutcome::Inserted => self.inserted += 1,
            IndexOutcome::Unchanged => self.unchanged += 1,
            IndexOutcome::Superseded => self.superseded += 1,
        }
    }

    /// Whether anything searchable changed.
    pub fn changed(&self) -> bool {
        self.inserted + self.superseded > 0
    }
}

pub struct Retriever {
    store: Arc<dyn VectorStore>,
    embedder: Arc<dyn Embedder>,
    dims: usize,
    timeout: Duration,
}

impl Retriever {
    /// The index dimension is taken from the embedder and fixed from here on.
    pub fn new(store: Arc<dyn VectorStore>, embedder: Arc<dyn Embedder>, timeout: Duration) -> Self {
        let dims = embedder.dims();
        Self {
            store,
            embedder,
            dims,
            timeout,
        }
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    pub fn embedder(&self) -> &Arc<dyn Embedder> {
        &self.embedder
    }

    fn check_dims(&self, vector: &[f32]) -> Result<(), IndexError> {
        if vector.len() != self.dims {
            return Err(IndexError::DimensionMismatch {
                expected: self.dims,
                actual: vector.len(),
            });
        }
        Ok(())
    }

    fn prepare(&self, tenant_id: &str, chunk: ChunkInput, vector: Vec<f32>) -> Result<IndexedChunk, IndexError> {
        self.check_dims(&vector)?;
        if tenant_id.is_empty() || chunk.document_id.is_empty() || chunk.chunk_id.is_empty() {
            return Err(IndexError::InvalidChunk(
                "tenant_id, document_id and chunk_id must not be empty".to_string(),
            ));
        }
        Ok(IndexedChunk {
            tenant_id: tenant_id.to_string(),
            content_hash: content_hash(&chunk.text),
            document_id: chunk.document_id,
            chunk_id: chunk.chunk_id,
            text: chunk.text,
            vector,
        })
    }

    /// Index one chunk with a caller-supplied vector.
    pub async fn index(
        &self,
        tenant_id: &str,
        chunk: ChunkInput,
        vector: Vec<f32>,
    ) -> Result<IndexOutcome, IndexError> {
        let prepared = self.prepare(tenant_id, chunk, vector)?;
        let outcomes = self.store.upsert(vec![prepared]).await?;
        outcomes
            .into_iter()
            .next()
            .ok_or_else(|| IndexError::Store(anyhow::anyhow!("store returned no outcome")))
    }

    /// Embed and index a batch of chunks for one tenant.
    ///
    /// Every vector is validated before anything is written, so a bad batch
    /// leaves the index untouched.
    pub async fn index_chunks(
        &self,
        tenant_id: &str,
        chunks: Vec<ChunkInput>,
    ) -> Result<IndexReport, IndexError> {
        if chunks.is_empty() {
            return Ok(IndexReport::default());
        }

        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let vectors = self
            .embedder
            .embed(&texts)
            .await
            .map_err(|e| IndexError::Embedding(e.to_string()))?;
        if vectors.len() != chunks.len() {
            return Err(IndexError::Embedding(format!(
                "expected {} vectors, got {}",
                chunks.len(),
                vectors.len()
            )));
        }

        let prepared = chunks
            .into_iter()
            .zip(vectors)
            .map(|(chunk, vector)| self.prepare(tenant_id, chunk, vector))
            .collect::<Result<Vec<_>, _>>()?;

        let mut report = IndexReport::default();
        for outcome in self.store.upsert(prepared).await? {
            report.record(outcome);
        }
        Ok(report)
    }

    /// Top-`k` chunks of `tenant_id` for an already-embedded query.
    pub async fn search(
        &self,
        tenant_id: &str,
        query_vector: &[f32],
        k: usize,
    ) -> Result<Vec<ScoredChunk>, IndexError> {
        self.check_dims(query_vector)?;
        if k == 0 {
            return Ok(Vec::new());
        }
        Ok(self.store.search(tenant_id, query_vector, k).await?)
    }

    /// Embed `query_text` and search, bounded by the store timeout.
    pub async fn retrieve(
        &self,
        tenant_id: &str,
        query_text: &str,
        k: usize,
    ) -> Result<Vec<ScoredChunk>, RetrievalError> {
        let work = async {
            let vector = embed_query(self.embedder.as_ref(), query_text)
                .await
                .map_err(|e| IndexError::Embedding(e.to_string()))?;
            self.search(tenant_id, &vector, k).await
        };

        match tokio::time::timeout(self.timeout, work).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(RetrievalError::Timeout(self.timeout)),
        }
    }

    pub async fn count(&self, tenant_id: Option<&str>) -> Result<usize, IndexError> {
        Ok(self.store.count(tenant_id).await?)
    }
}
