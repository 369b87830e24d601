//! Ollama chat adapter (`POST {base_url}/api/chat`, non-streaming).

use anyhow::Result;
use async_trait::async_trait;
use std::time::Duration;

use super::{approx_tokens, classify_status, transport_error, Completion, CompletionProvider, Prompt};
use crate::config::ProviderConfig;
use crate::error::ProviderError;

pub struct OllamaProvider {
    name: String,
    model: String,
    url: String,
    max_tokens: u32,
    temperature: f32,
    timeout: Duration,
    client: reqwest::Client,
}

impl OllamaProvider {
    pub fn new(config: &ProviderConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("providers.{}.model required for ollama", config.name))?;
        let base = config
            .base_url
            .clone()
            .unwrap_or_else(|| "http://localhost:11434".to_string());

        Ok(Self {
            name: config.name.clone(),
            model,
            url: format!("{}/api/chat", base.trim_end_matches('/')),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            timeout: config.timeout(),
            client: reqwest::Client::builder().timeout(config.timeout()).build()?,
        })
    }
}

#[async_trait]
impl CompletionProvider for OllamaProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(&self, prompt: &Prompt) -> Result<Completion, ProviderError> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": prompt.messages(),
            "stream": false,
            "options": {
                "num_predict": self.max_tokens,
                "temperature": self.temperature,
            },
        });

        let response = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| transport_error(e, self.timeout))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(classify_status(status, text));
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;

        let text = json
            .pointer("/message/content")
            .and_then(|c| c.as_str())
            .ok_or_else(|| ProviderError::InvalidResponse("missing message.content".into()))?
            .to_string();
        let tokens_in = json
            .get("prompt_eval_count")
            .and_then(|v| v.as_u64())
            .map(|v| v as u32)
            .unwrap_or_else(|| approx_tokens(&prompt.system_message()) + approx_tokens(&prompt.question));
        let tokens_out = json
            .get("eval_count")
            .and_then(|v| v.as_u64())
            .map(|v| v as u32)
            .unwrap_or_else(|| approx_tokens(&text));

        Ok(Completion {
            text,
            tokens_in,
            tokens_out,
        })
    }
}
