//! Query orchestration: cache, retrieval, prompt assembly, routing.
//!
//! # Pipeline
//!
//! ```text
//! answer(identity, query)
//!   ├─ reject empty query / rate-limited caller
//!   ├─ cache.generation(tenant)
//!   ├─ fingerprint ─► cache.get ──hit──► Answer { cached: true }
//!   │                     │ miss / unavailable
//!   ├─ retriever.retrieve(tenant, query, k)   (timeout ⇒ no context)
//!   ├─ assemble_context(hits, max_context_chars)
//!   ├─ router.complete(prompt)                (all down ⇒ Degraded)
//!   ├─ cache.put (best effort; skipped if the tenant was purged meanwhile)
//!   └─ Answer { cached: false }
//! ```
//!
//! Only malformed input, rate limiting, an exhausted router, and (when
//! grounding is required) missing context reach the caller as errors.
//! Everything else degrades.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::cache::{Fingerprint, NormalizeRules, ResponseCache};
use crate::config::Config;
use crate::error::{IndexError, QueryError};
use crate::llm::{ContextBlock, Prompt};
use crate::models::{Answer, CacheEntry, ChunkInput, Identity, ScoredChunk, SourceRef};
use crate::rate_limit::RateLimiter;
use crate::retriever::{IndexReport, Retriever};
use crate::router::Router;

/// Tunables for [`Orchestrator::answer`].
#[derive(Debug, Clone)]
pub struct QuerySettings {
    pub default_k: usize,
    pub max_context_chars: usize,
    pub snippet_chars: usize,
    pub require_grounding: bool,
    pub cache_ttl: Duration,
    pub cache_timeout: Duration,
    pub normalize: NormalizeRules,
}

impl QuerySettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            default_k: config.retrieval.default_k,
            max_context_chars: config.retrieval.max_context_chars,
            snippet_chars: config.retrieval.snippet_chars,
            require_grounding: config.retrieval.require_grounding,
            cache_ttl: config.cache.ttl(),
            cache_timeout: config.cache.timeout(),
            normalize: NormalizeRules::from(&config.cache),
        }
    }
}

impl Default for QuerySettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Context chosen for a prompt and the sources it came from.
#[derive(Debug, Clone, Default)]
pub struct AssembledContext {
    pub blocks: Vec<ContextBlock>,
    pub sources: Vec<SourceRef>,
}

/// Fill the context budget with the highest-ranked chunks first.
///
/// Stops at the first chunk that would overflow `max_chars`. A top chunk
/// longer than the whole budget is truncated rather than dropped.
pub fn assemble_context(hits: &[ScoredChunk], max_chars: usize, snippet_chars: usize) -> AssembledContext {
    let mut out = AssembledContext::default();
    let mut used = 0usize;

    for hit in hits {
        let len = hit.text.chars().count();
        let text = if used + len <= max_chars {
            hit.text.clone()
        } else if out.blocks.is_empty() {
            hit.text.chars().take(max_chars).collect()
        } else {
            break;
        };
        used += text.chars().count();

        out.sources.push(SourceRef {
            document_ref: hit.document_id.clone(),
            chunk_id: hit.chunk_id.clone(),
            snippet: snippet(&hit.text, snippet_chars),
            score: hit.score,
        });
        out.blocks.push(ContextBlock {
            document_ref: hit.document_id.clone(),
            text,
        });

        if used >= max_chars {
            break;
        }
    }
    out
}

fn snippet(text: &str, max_chars: usize) -> String {
    let trimmed = text.trim();
    if trimmed.chars().count() <= max_chars {
        return trimmed.to_string();
    }
    let cut: String = trimmed.chars().take(max_chars).collect();
    format!("{}...", cut.trim_end())
}

pub struct Orchestrator {
    retriever: Arc<Retriever>,
    cache: Arc<dyn ResponseCache>,
    router: Arc<Router>,
    limiter: Option<RateLimiter>,
    settings: QuerySettings,
}

impl Orchestrator {
    pub fn new(
        retriever: Arc<Retriever>,
        cache: Arc<dyn ResponseCache>,
        router: Arc<Router>,
        limiter: Option<RateLimiter>,
        settings: QuerySettings,
    ) -> Self {
        Self {
            retriever,
            cache,
            router,
            limiter,
            settings,
        }
    }

    pub fn retriever(&self) -> &Arc<Retriever> {
        &self.retriever
    }

    pub fn cache(&self) -> &Arc<dyn ResponseCache> {
        &self.cache
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn settings(&self) -> &QuerySettings {
        &self.settings
    }

    pub fn rate_limiter(&self) -> Option<&RateLimiter> {
        self.limiter.as_ref()
    }

    /// Answer `query_text` for `identity`. Either a complete answer or an error.
    pub async fn answer(&self, identity: &Identity, query_text: &str) -> Result<Answer, QueryError> {
        let started = Instant::now();
        let query = query_text.trim();
        if query.is_empty() {
            return Err(QueryError::EmptyQuery);
        }
        if let Some(limiter) = &self.limiter {
            limiter
                .check(identity)
                .map_err(|retry_after| QueryError::RateLimited { retry_after })?;
        }

        let tenant = identity.tenant_id.as_str();
        let fingerprint = Fingerprint::compute(tenant, query, &self.settings.normalize);
        // Read before retrieval so an ingest that lands mid-answer invalidates it.
        let generation = self.generation(tenant).await;

        if let Some(entry) = self.cached(tenant, &fingerprint).await {
            debug!(tenant, provider = %entry.provider, "cache hit");
            return Ok(Answer {
                answer_text: entry.answer_text.clone(),
                grounded: !entry.sources.is_empty(),
                sources: entry.sources.clone(),
                tokens_in: entry.tokens_in,
                tokens_out: entry.tokens_out,
                cached: true,
                latency_ms: started.elapsed().as_millis() as u64,
                provider: entry.provider.clone(),
            });
        }

        let hits = match self
            .retriever
            .retrieve(tenant, query, self.settings.default_k)
            .await
        {
            Ok(hits) => hits,
            Err(e) if self.settings.require_grounding => {
                return Err(QueryError::GroundingUnavailable(e.to_string()))
            }
            Err(e) => {
                warn!(tenant, error = %e, "retrieval failed; answering without context");
                Vec::new()
            }
        };
        if hits.is_empty() && self.settings.require_grounding {
            return Err(QueryError::GroundingUnavailable(
                "no indexed content matched the query".into(),
            ));
        }

        let context = assemble_context(
            &hits,
            self.settings.max_context_chars,
            self.settings.snippet_chars,
        );
        let grounded = !context.blocks.is_empty();
        let prompt = Arc::new(Prompt::new(query, context.blocks));

        let routed = self.router.complete(prompt).await?;
        for skipped in &routed.skipped {
            debug!(provider = %skipped.provider, error = %skipped.error, "provider skipped");
        }

        let entry = CacheEntry {
            answer_text: routed.completion.text,
            sources: context.sources,
            tokens_in: routed.completion.tokens_in,
            tokens_out: routed.completion.tokens_out,
            provider: routed.provider,
            created_at: chrono::Utc::now(),
        };
        if let Some(generation) = generation {
            self.store(tenant, fingerprint, entry.clone(), generation).await;
        }

        let latency_ms = started.elapsed().as_millis() as u64;
        info!(
            tenant,
            user = %identity.user_id,
            provider = %entry.provider,
            sources = entry.sources.len(),
            latency_ms,
            "query answered"
        );

        Ok(Answer {
            answer_text: entry.answer_text,
            sources: entry.sources,
            tokens_in: entry.tokens_in,
            tokens_out: entry.tokens_out,
            cached: false,
            latency_ms,
            provider: entry.provider,
            grounded,
        })
    }

    /// Index chunks for a tenant and drop its cached answers if anything changed.
    pub async fn ingest(&self, tenant_id: &str, chunks: Vec<ChunkInput>) -> Result<IndexReport, IndexError> {
        let report = self.retriever.index_chunks(tenant_id, chunks).await?;
        if report.changed() {
            self.purge_cache(tenant_id).await;
        }
        Ok(report)
    }

    /// Remove a tenant's cached answers. Returns how many were dropped.
    pub async fn purge_cache(&self, tenant_id: &str) -> usize {
        match tokio::time::timeout(self.settings.cache_timeout, self.cache.purge(tenant_id)).await {
            Ok(Ok(n)) => {
                info!(tenant = tenant_id, removed = n, "cache purged");
                n
            }
            Ok(Err(e)) => {
                warn!(tenant = tenant_id, error = %e, "cache purge failed");
                0
            }
            Err(_) => {
                warn!(tenant = tenant_id, "cache purge timed out");
                0
            }
        }
    }

    async fn cached(&self, tenant: &str, fingerprint: &Fingerprint) -> Option<Arc<CacheEntry>> {
        match tokio::time::timeout(self.settings.cache_timeout, self.cache.get(tenant, fingerprint)).await {
            Ok(Ok(entry)) => entry,
            Ok(Err(e)) => {
                warn!(tenant, error = %e, "cache read failed; treating as miss");
                None
            }
            Err(_) => {
                warn!(tenant, "cache read timed out; treating as miss");
                None
            }
        }
    }

    async fn generation(&self, tenant: &str) -> Option<u64> {
        match tokio::time::timeout(self.settings.cache_timeout, self.cache.generation(tenant)).await {
            Ok(Ok(generation)) => Some(generation),
            Ok(Err(e)) => {
                warn!(tenant, error = %e, "cache generation unavailable; answer will not be cached");
                None
            }
            Err(_) => {
                warn!(tenant, "cache generation timed out; answer will not be cached");
                None
            }
        }
    }

    async fn store(&self, tenant: &str, fingerprint: Fingerprint, entry: CacheEntry, generation: u64) {
        let put = self
            .cache
            .put(tenant, fingerprint, entry, self.settings.cache_ttl, generation);
        match tokio::time::timeout(self.settings.cache_timeout, put).await {
            Ok(Ok(true)) => {}
            Ok(Ok(false)) => debug!(tenant, "answer predates a cache purge; not cached"),
            Ok(Err(e)) => warn!(tenant, error = %e, "cache write failed"),
            Err(_) => warn!(tenant, "cache write timed out"),
        }
    }
}
