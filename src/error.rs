//! Error taxonomy for the query pipeline.
//!
//! Only [`RouteError::AllProvidersUnavailable`] and malformed input reach
//! callers as failures. The rest are absorbed by the orchestrator and turned
//! into a degraded answer (missing context, cache miss).

use std::time::Duration;
use thiserror::Error;

/// Errors raised while indexing or searching vectors.
#[derive(Error, Debug)]
pub enum IndexError {
    #[error("vector dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("invalid chunk: {0}")]
    InvalidChunk(String),

    #[error("embedding failed: {0}")]
    Embedding(String),

    #[error("vector store error: {0}")]
    Store(#[from] anyhow::Error),
}

/// Why retrieval produced no context for a query.
#[derive(Error, Debug)]
pub enum RetrievalError {
    #[error("retrieval timed out after {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Index(#[from] IndexError),
}

/// The cache backend could not be reached in time. Always treated as a miss.
#[derive(Error, Debug, Clone)]
#[error("cache unavailable: {0}")]
pub struct CacheUnavailable(pub String);

/// Failure of a single completion call against one provider.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    /// The provider's circuit is open; no call was made.
    #[error("circuit open; call short-circuited")]
    Unavailable,

    #[error("call timed out after {0:?}")]
    Timeout(Duration),

    #[error("authentication rejected: {0}")]
    Auth(String),

    #[error("rate limited by provider: {0}")]
    RateLimited(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl ProviderError {
    /// Whether this outcome says something about the provider's health.
    ///
    /// Credential and quota rejections are ours to fix, not the provider's,
    /// so they never trip the breaker.
    pub fn counts_toward_breaker(&self) -> bool {
        !matches!(
            self,
            ProviderError::Unavailable | ProviderError::Auth(_) | ProviderError::RateLimited(_)
        )
    }
}

/// One provider the router considered while serving a call.
#[derive(Debug, Clone)]
pub struct ProviderAttempt {
    pub provider: String,
    pub error: ProviderError,
}

#[derive(Error, Debug, Clone)]
pub enum RouteError {
    #[error("all providers unavailable ({})", describe_attempts(.attempts))]
    AllProvidersUnavailable { attempts: Vec<ProviderAttempt> },
}

fn describe_attempts(attempts: &[ProviderAttempt]) -> String {
    attempts
        .iter()
        .map(|a| format!("{}: {}", a.provider, a.error))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Errors surfaced by [`crate::orchestrator::Orchestrator::answer`].
#[derive(Error, Debug)]
pub enum QueryError {
    #[error("query must not be empty")]
    EmptyQuery,

    #[error("rate limit exceeded; retry in {}s", .retry_after.as_secs().max(1))]
    RateLimited { retry_after: Duration },

    #[error("no grounding context available: {0}")]
    GroundingUnavailable(String),

    #[error("service degraded: {0}")]
    Degraded(#[from] RouteError),
}

/// Speech-to-text failures. Reported to the voice client as an `error` frame.
#[derive(Error, Debug, Clone)]
pub enum SttError {
    #[error("speech-to-text is not configured")]
    Disabled,

    #[error("speech-to-text timed out after {0:?}")]
    Timeout(Duration),

    #[error("speech-to-text failed: {0}")]
    Failed(String),
}
