//! Core data types that flow through the query pipeline.
//!
//! Identity comes from the auth layer and is trusted as given. Chunks are
//! immutable once indexed: re-ingesting a chunk with different text
//! supersedes the old record rather than editing it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The `(tenant, user)` pair attached to every query and voice session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    pub tenant_id: String,
    pub user_id: String,
}

impl Identity {
    pub fn new(tenant_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            user_id: user_id.into(),
        }
    }
}

/// A chunk of document text submitted for indexing.
#[derive(Debug, Clone, Deserialize)]
pub struct ChunkInput {
    pub document_id: String,
    pub chunk_id: String,
    pub text: String,
}

/// A chunk as held by a vector store.
#[derive(Debug, Clone)]
pub struct IndexedChunk {
    pub tenant_id: String,
    pub document_id: String,
    pub chunk_id: String,
    pub text: String,
    /// SHA-256 of `text`; decides whether re-ingestion is a no-op.
    pub content_hash: String,
    pub vector: Vec<f32>,
}

/// What happened to a chunk handed to the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexOutcome {
    Inserted,
    /// Same id and same content already indexed.
    Unchanged,
    /// Same id, new content; the old record is no longer searchable.
    Superseded,
}

/// A search hit with its similarity score.
#[derive(Debug, Clone)]
pub struct ScoredChunk {
    pub document_id: String,
    pub chunk_id: String,
    pub text: String,
    pub score: f32,
    /// Position in the tenant's insertion order; breaks score ties.
    pub seq: u64,
}

/// A source snippet attached to an answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRef {
    pub document_ref: String,
    pub chunk_id: String,
    pub snippet: String,
    pub score: f32,
}

/// A cached answer, stored whole and shared by reference.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub answer_text: String,
    pub sources: Vec<SourceRef>,
    pub tokens_in: u32,
    pub tokens_out: u32,
    pub provider: String,
    pub created_at: DateTime<Utc>,
}

/// The response to a query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Answer {
    pub answer_text: String,
    pub sources: Vec<SourceRef>,
    pub tokens_in: u32,
    pub tokens_out: u32,
    pub cached: bool,
    pub latency_ms: u64,
    /// Name of the provider that produced the text.
    pub provider: String,
    /// `false` when no retrieved context went into the prompt.
    pub grounded: bool,
}
