//! Offline provider for development and tests.
//!
//! Answers are a deterministic function of the prompt, so repeated calls
//! with the same context produce the same text.

use async_trait::async_trait;
use std::time::Duration;

use super::{approx_tokens, Completion, CompletionProvider, Prompt};
use crate::config::ProviderConfig;
use crate::error::ProviderError;

pub struct MockProvider {
    name: String,
    fail: bool,
    latency: Duration,
}

impl MockProvider {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fail: false,
            latency: Duration::ZERO,
        }
    }

    pub fn from_config(config: &ProviderConfig) -> Self {
        Self {
            name: config.name.clone(),
            fail: config.fail,
            latency: Duration::from_millis(config.latency_ms),
        }
    }

    /// A provider whose every call fails with a transport error.
    pub fn failing(name: impl Into<String>) -> Self {
        Self {
            fail: true,
            ..Self::new(name)
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }
}

#[async_trait]
impl CompletionProvider for MockProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(&self, prompt: &Prompt) -> Result<Completion, ProviderError> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        if self.fail {
            return Err(ProviderError::Transport(format!(
                "{} is configured to fail",
                self.name
            )));
        }

        let text = match prompt.context.first() {
            Some(top) => {
                let excerpt: String = top.text.chars().take(160).collect();
                format!(
                    "Based on {} ({} source{}): {}",
                    top.document_ref,
                    prompt.context.len(),
                    if prompt.context.len() == 1 { "" } else { "s" },
                    excerpt
                )
            }
            None => format!(
                "I could not find anything in your documents about \"{}\".",
                prompt.question
            ),
        };

        Ok(Completion {
            tokens_in: approx_tokens(&prompt.system_message()) + approx_tokens(&prompt.question),
            tokens_out: approx_tokens(&text),
            text,
        })
    }
}
