//! Long-lived service context.
//!
//! Everything with state that outlives a request (vector store, response
//! cache, provider breakers, rate limiter, session registry) is built once
//! here at startup and shared by handle. Request paths never construct
//! their own.

use anyhow::{Context, Result};
use serde::Serialize;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::info;

use crate::auth::IdentityVerifier;
use crate::breaker::BreakerStatus;
use crate::cache::{CacheStats, MemoryCache, ResponseCache};
use crate::config::Config;
use crate::embedding::create_embedder;
use crate::orchestrator::{Orchestrator, QuerySettings};
use crate::rate_limit::RateLimiter;
use crate::retriever::{create_store, Retriever};
use crate::router::Router;
use crate::stt::{create_stt, SpeechToText};
use crate::voice::{SessionRegistry, SessionSettings};

pub struct ServiceContext {
    pub config: Arc<Config>,
    pub orchestrator: Arc<Orchestrator>,
    pub stt: Arc<dyn SpeechToText>,
    pub sessions: SessionRegistry,
    pub verifier: IdentityVerifier,
    pub voice: SessionSettings,
    background: Vec<JoinHandle<()>>,
}

impl ServiceContext {
    /// Build every component from configuration and start background upkeep.
    pub async fn from_config(config: Config) -> Result<Self> {
        let store = create_store(&config.store)
            .await
            .with_context(|| format!("Failed to open {} vector store", config.store.backend))?;
        let embedder = create_embedder(&config.embedding)?;
        let retriever = Arc::new(Retriever::new(store, embedder, config.store.timeout()));

        let cache = Arc::new(MemoryCache::new(config.cache.max_entries_per_tenant));
        let sweeper = cache.spawn_sweeper(Duration::from_secs(config.cache.sweep_interval_secs));

        let router = Arc::new(Router::from_config(&config.providers)?);
        let limiter = RateLimiter::from_config(&config.rate_limit);
        let orchestrator = Arc::new(Orchestrator::new(
            retriever,
            cache as Arc<dyn ResponseCache>,
            router,
            limiter,
            QuerySettings::from_config(&config),
        ));

        let stt = create_stt(&config.stt)?;
        let verifier = IdentityVerifier::from_config(&config.auth)?;

        info!(
            providers = ?orchestrator.router().provider_names(),
            store = %config.store.backend,
            embedder = %config.embedding.provider,
            stt = stt.name(),
            signed_identity = verifier.requires_signature(),
            "service context ready"
        );

        let mut ctx = Self::new(config, orchestrator, stt, verifier);
        ctx.background.push(sweeper);
        Ok(ctx)
    }

    /// Assemble a context from prebuilt parts.
    pub fn new(
        config: Config,
        orchestrator: Arc<Orchestrator>,
        stt: Arc<dyn SpeechToText>,
        verifier: IdentityVerifier,
    ) -> Self {
        let voice = SessionSettings::from(&config.voice);
        let pruner = spawn_limiter_pruner(&orchestrator, Duration::from_secs(60));
        Self {
            config: Arc::new(config),
            orchestrator,
            stt,
            sessions: SessionRegistry::new(),
            verifier,
            voice,
            background: vec![pruner],
        }
    }

    pub fn with_stt(mut self, stt: Arc<dyn SpeechToText>) -> Self {
        self.stt = stt;
        self
    }

    pub async fn status(&self) -> ServiceStatus {
        let retriever = self.orchestrator.retriever();
        let settings = self.orchestrator.settings();
        ServiceStatus {
            version: env!("CARGO_PKG_VERSION").to_string(),
            providers: self.orchestrator.router().status(),
            cache: self.orchestrator.cache().stats(),
            retrieval: RetrievalStatus {
                default_k: settings.default_k,
                max_context_chars: settings.max_context_chars,
                require_grounding: settings.require_grounding,
                embedding_model: retriever.embedder().model_name().to_string(),
                dims: retriever.dims(),
                store: self.config.store.backend.clone(),
                indexed_chunks: retriever.count(None).await.ok(),
            },
            voice_sessions: self.sessions.len(),
            stt: self.stt.name().to_string(),
        }
    }
}

impl Drop for ServiceContext {
    fn drop(&mut self) {
        for task in &self.background {
            task.abort();
        }
    }
}

fn spawn_limiter_pruner(orchestrator: &Arc<Orchestrator>, every: Duration) -> JoinHandle<()> {
    let weak: Weak<Orchestrator> = Arc::downgrade(orchestrator);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let Some(orchestrator) = weak.upgrade() else {
                break;
            };
            if let Some(limiter) = orchestrator.rate_limiter() {
                limiter.prune();
            }
        }
    })
}

/// Read-only snapshot for `GET /admin/status` and `ragline status`.
#[derive(Debug, Serialize)]
pub struct ServiceStatus {
    pub version: String,
    pub providers: Vec<BreakerStatus>,
    pub cache: CacheStats,
    pub retrieval: RetrievalStatus,
    pub voice_sessions: usize,
    pub stt: String,
}

#[derive(Debug, Serialize)]
pub struct RetrievalStatus {
    pub default_k: usize,
    pub max_context_chars: usize,
    pub require_grounding: bool,
    pub embedding_model: String,
    pub dims: usize,
    pub store: String,
    /// `None` when the store could not be counted.
    pub indexed_chunks: Option<usize>,
}
