//! TOML configuration for the query service.
//!
//! Every tunable the pipeline depends on lives here: breaker thresholds,
//! cache TTL and normalization rules, retrieval bounds, store timeouts and
//! the provider priority list. Values are read once at startup by
//! [`load_config`] and shared read-only afterwards.
//!
//! A minimal configuration only needs one provider:
//!
//! ```toml
//! [[providers]]
//! name = "local-mock"
//! kind = "mock"
//! ```

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
    #[serde(default)]
    pub stt: SttConfig,
    #[serde(default)]
    pub voice: VoiceConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8080".to_string()
}

/// Where indexed chunk vectors live.
#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    /// `"memory"` or `"sqlite"`.
    #[serde(default = "default_store_backend")]
    pub backend: String,
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
    /// Upper bound on a single retrieval call (embedding + search).
    #[serde(default = "default_store_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_store_backend(),
            path: default_store_path(),
            timeout_ms: default_store_timeout_ms(),
        }
    }
}

fn default_store_backend() -> String {
    "memory".to_string()
}
fn default_store_path() -> PathBuf {
    PathBuf::from("./data/ragline.sqlite")
}
fn default_store_timeout_ms() -> u64 {
    2000
}

impl StoreConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_dims")]
    pub dims: usize,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_embedding_timeout_secs")]
    pub timeout_secs: u64,
    /// Number of query vectors kept in memory; `0` disables the cache.
    #[serde(default = "default_query_cache_capacity")]
    pub query_cache_capacity: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            model: None,
            dims: default_dims(),
            url: None,
            api_key_env: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_embedding_timeout_secs(),
            query_cache_capacity: default_query_cache_capacity(),
        }
    }
}

fn default_embedding_provider() -> String {
    "hash".to_string()
}
fn default_dims() -> usize {
    384
}
fn default_batch_size() -> usize {
    32
}
fn default_max_retries() -> u32 {
    3
}
fn default_embedding_timeout_secs() -> u64 {
    30
}
fn default_query_cache_capacity() -> usize {
    1024
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_k")]
    pub default_k: usize,
    #[serde(default = "default_max_context_chars")]
    pub max_context_chars: usize,
    #[serde(default = "default_snippet_chars")]
    pub snippet_chars: usize,
    /// Refuse to answer when no context could be retrieved.
    #[serde(default)]
    pub require_grounding: bool,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            default_k: default_k(),
            max_context_chars: default_max_context_chars(),
            snippet_chars: default_snippet_chars(),
            require_grounding: false,
        }
    }
}

fn default_k() -> usize {
    8
}
fn default_max_context_chars() -> usize {
    8000
}
fn default_snippet_chars() -> usize {
    240
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default = "default_cache_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    #[serde(default = "default_max_entries_per_tenant")]
    pub max_entries_per_tenant: usize,
    #[serde(default = "default_true")]
    pub case_fold: bool,
    #[serde(default = "default_true")]
    pub collapse_whitespace: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_ttl_secs(),
            timeout_ms: default_cache_timeout_ms(),
            sweep_interval_secs: default_sweep_interval_secs(),
            max_entries_per_tenant: default_max_entries_per_tenant(),
            case_fold: true,
            collapse_whitespace: true,
        }
    }
}

fn default_ttl_secs() -> u64 {
    86_400
}
fn default_cache_timeout_ms() -> u64 {
    250
}
fn default_sweep_interval_secs() -> u64 {
    60
}
fn default_max_entries_per_tenant() -> usize {
    10_000
}
fn default_true() -> bool {
    true
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// One entry of the `[[providers]]` priority list.
///
/// Order in the file is routing order: the first healthy provider wins.
#[derive(Debug, Deserialize, Clone)]
pub struct ProviderConfig {
    pub name: String,
    /// `"openai"`, `"ollama"` or `"mock"`.
    pub kind: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    /// Name of the environment variable holding the API key.
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_provider_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_reset_timeout_secs")]
    pub reset_timeout_secs: u64,
    /// Mock only: fail every call.
    #[serde(default)]
    pub fail: bool,
    /// Mock only: artificial latency.
    #[serde(default)]
    pub latency_ms: u64,
}

fn default_max_tokens() -> u32 {
    1000
}
fn default_temperature() -> f32 {
    0.7
}
fn default_provider_timeout_secs() -> u64 {
    30
}
fn default_failure_threshold() -> u32 {
    3
}
fn default_reset_timeout_secs() -> u64 {
    60
}

impl ProviderConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
    pub fn reset_timeout(&self) -> Duration {
        Duration::from_secs(self.reset_timeout_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SttConfig {
    /// `"disabled"` or `"openai"`.
    #[serde(default = "default_stt_provider")]
    pub provider: String,
    #[serde(default = "default_stt_model")]
    pub model: String,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default = "default_stt_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for SttConfig {
    fn default() -> Self {
        Self {
            provider: default_stt_provider(),
            model: default_stt_model(),
            base_url: None,
            api_key_env: None,
            timeout_secs: default_stt_timeout_secs(),
        }
    }
}

fn default_stt_provider() -> String {
    "disabled".to_string()
}
fn default_stt_model() -> String {
    "whisper-1".to_string()
}
fn default_stt_timeout_secs() -> u64 {
    60
}

impl SttConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct VoiceConfig {
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_max_utterance_bytes")]
    pub max_utterance_bytes: usize,
    #[serde(default = "default_max_queued_utterances")]
    pub max_queued_utterances: usize,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: default_idle_timeout_secs(),
            max_utterance_bytes: default_max_utterance_bytes(),
            max_queued_utterances: default_max_queued_utterances(),
        }
    }
}

fn default_idle_timeout_secs() -> u64 {
    300
}
fn default_max_utterance_bytes() -> usize {
    10 * 1024 * 1024
}
fn default_max_queued_utterances() -> usize {
    4
}

impl VoiceConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RateLimitConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_rpm")]
    pub requests_per_minute: u32,
    /// Maximum requests inside any ten-second span.
    #[serde(default = "default_burst")]
    pub burst: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            requests_per_minute: default_rpm(),
            burst: default_burst(),
        }
    }
}

fn default_rpm() -> u32 {
    60
}
fn default_burst() -> u32 {
    10
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AuthConfig {
    /// Environment variable holding the HMAC secret used to sign identity headers.
    /// When unset, identity headers are trusted as-is.
    #[serde(default)]
    pub shared_secret_env: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
        }
    }
}

fn default_log_filter() -> String {
    "ragline=info,tower_http=info".to_string()
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

/// Parse and validate configuration from a TOML string.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;
    config.validate()?;
    Ok(config)
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        // Providers
        if self.providers.is_empty() {
            anyhow::bail!("at least one [[providers]] entry is required");
        }
        let mut seen = HashSet::new();
        for p in &self.providers {
            if p.name.trim().is_empty() {
                anyhow::bail!("providers.name must not be empty");
            }
            if !seen.insert(p.name.as_str()) {
                anyhow::bail!("duplicate provider name: '{}'", p.name);
            }
            if p.failure_threshold == 0 {
                anyhow::bail!("providers.{}.failure_threshold must be >= 1", p.name);
            }
            if p.timeout_secs == 0 {
                anyhow::bail!("providers.{}.timeout_secs must be > 0", p.name);
            }
            match p.kind.as_str() {
                "openai" | "ollama" | "mock" => {}
                other => anyhow::bail!(
                    "Unknown provider kind for '{}': '{}'. Must be openai, ollama, or mock.",
                    p.name,
                    other
                ),
            }
        }

        // Retrieval
        if self.retrieval.default_k == 0 {
            anyhow::bail!("retrieval.default_k must be >= 1");
        }
        if self.retrieval.max_context_chars == 0 {
            anyhow::bail!("retrieval.max_context_chars must be > 0");
        }

        // Embedding
        if self.embedding.dims == 0 {
            anyhow::bail!("embedding.dims must be > 0");
        }
        match self.embedding.provider.as_str() {
            "hash" | "openai" | "ollama" | "local" => {}
            other => anyhow::bail!(
                "Unknown embedding provider: '{}'. Must be hash, openai, ollama, or local.",
                other
            ),
        }

        match self.store.backend.as_str() {
            "memory" | "sqlite" => {}
            other => anyhow::bail!("Unknown store backend: '{}'. Must be memory or sqlite.", other),
        }

        match self.stt.provider.as_str() {
            "disabled" | "openai" => {}
            other => anyhow::bail!("Unknown stt provider: '{}'. Must be disabled or openai.", other),
        }

        if self.rate_limit.enabled
            && (self.rate_limit.requests_per_minute == 0 || self.rate_limit.burst == 0)
        {
            anyhow::bail!("rate_limit.requests_per_minute and rate_limit.burst must be > 0");
        }

        Ok(())
    }
}
