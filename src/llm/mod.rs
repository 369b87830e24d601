//! Language-model providers.
//!
//! Every backend implements [`CompletionProvider`]: one prompt in, one
//! [`Completion`] out. Transport, auth and wire format stay inside the
//! adapter; the router only sees names and [`ProviderError`]s.
//!
//! | `kind` | Adapter |
//! |--------|---------|
//! | `"openai"` | [`OpenAIProvider`] (any OpenAI-compatible chat endpoint) |
//! | `"ollama"` | [`OllamaProvider`] |
//! | `"mock"` | [`MockProvider`] (offline, deterministic) |
//!
//! Adapters never retry. A failed call is reported once and the router
//! moves on to the next provider.

mod mock;
mod ollama;
mod openai;

pub use mock::MockProvider;
pub use ollama::OllamaProvider;
pub use openai::OpenAIProvider;

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

use crate::config::ProviderConfig;
use crate::error::ProviderError;

/// A retrieved chunk handed to the model as context.
#[derive(Debug, Clone, PartialEq)]
pub struct ContextBlock {
    pub document_ref: String,
    pub text: String,
}

/// A grounded prompt: the user's question plus ranked context.
#[derive(Debug, Clone, PartialEq)]
pub struct Prompt {
    pub question: String,
    /// Highest-similarity first.
    pub context: Vec<ContextBlock>,
}

const SYSTEM_PREAMBLE: &str = "You are a helpful assistant answering questions about an \
organization's documents. Base your answer on the provided context. If the context does \
not contain the answer, say so plainly instead of guessing.";

impl Prompt {
    pub fn new(question: impl Into<String>, context: Vec<ContextBlock>) -> Self {
        Self {
            question: question.into(),
            context,
        }
    }

    /// System message with the numbered context appended.
    pub fn system_message(&self) -> String {
        if self.context.is_empty() {
            return format!("{}\n\nNo relevant context was found.", SYSTEM_PREAMBLE);
        }
        let mut out = format!("{}\n\nContext:", SYSTEM_PREAMBLE);
        for (i, block) in self.context.iter().enumerate() {
            out.push_str(&format!("\n\n[{}] ({})\n{}", i + 1, block.document_ref, block.text));
        }
        out
    }

    /// Chat-style message list shared by the HTTP adapters.
    pub fn messages(&self) -> serde_json::Value {
        serde_json::json!([
            { "role": "system", "content": self.system_message() },
            { "role": "user", "content": self.question },
        ])
    }
}

/// Text and token accounting for one completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub text: String,
    pub tokens_in: u32,
    pub tokens_out: u32,
}

#[async_trait]
pub trait CompletionProvider: Send + Sync {
    /// Stable name used for routing, breaker status and attribution.
    fn name(&self) -> &str;

    async fn complete(&self, prompt: &Prompt) -> Result<Completion, ProviderError>;
}

/// Build the adapter for one `[[providers]]` entry.
pub fn create_provider(config: &ProviderConfig) -> Result<Arc<dyn CompletionProvider>> {
    match config.kind.as_str() {
        "openai" => Ok(Arc::new(OpenAIProvider::new(config)?)),
        "ollama" => Ok(Arc::new(OllamaProvider::new(config)?)),
        "mock" => Ok(Arc::new(MockProvider::from_config(config))),
        other => anyhow::bail!("Unknown provider kind: {}", other),
    }
}

/// Whitespace word count; used when a backend does not report usage.
pub fn approx_tokens(text: &str) -> u32 {
    text.split_whitespace().count() as u32
}

/// Map an HTTP error status to the router's view of it.
pub(crate) fn classify_status(status: reqwest::StatusCode, body: String) -> ProviderError {
    match status.as_u16() {
        401 | 403 => ProviderError::Auth(format!("{}: {}", status, body)),
        429 => ProviderError::RateLimited(body),
        _ => ProviderError::Transport(format!("{}: {}", status, body)),
    }
}

pub(crate) fn transport_error(err: reqwest::Error, timeout: std::time::Duration) -> ProviderError {
    if err.is_timeout() {
        ProviderError::Timeout(timeout)
    } else {
        ProviderError::Transport(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_message_numbers_context() {
        let prompt = Prompt::new(
            "What is the refund policy?",
            vec![
                ContextBlock {
                    document_ref: "handbook".into(),
                    text: "Refunds within 14 days.".into(),
                },
                ContextBlock {
                    document_ref: "faq".into(),
                    text: "Contact support.".into(),
                },
            ],
        );
        let sys = prompt.system_message();
        assert!(sys.contains("[1] (handbook)\nRefunds within 14 days."));
        assert!(sys.contains("[2] (faq)"));
        assert_eq!(prompt.messages()[1]["content"], "What is the refund policy?");
    }

    #[test]
    fn test_ungrounded_prompt_says_so() {
        let prompt = Prompt::new("hello", Vec::new());
        assert!(prompt.system_message().contains("No relevant context"));
    }

    #[test]
    fn test_classify_status() {
        use reqwest::StatusCode;
        assert!(matches!(
            classify_status(StatusCode::UNAUTHORIZED, String::new()),
            ProviderError::Auth(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, String::new()),
            ProviderError::RateLimited(_)
        ));
        assert!(classify_status(StatusCode::BAD_GATEWAY, String::new()).counts_toward_breaker());
    }

    #[test]
    fn test_create_provider_by_kind() {
        let cfg: ProviderConfig = toml::from_str("name = \"m\"\nkind = \"mock\"\n").unwrap();
        assert_eq!(create_provider(&cfg).unwrap().name(), "m");
    }
}
