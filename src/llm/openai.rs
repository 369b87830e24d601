//! OpenAI-compatible chat completions (`POST {base_url}/chat/completions`).

use anyhow::Result;
use async_trait::async_trait;
use std::time::Duration;

use super::{approx_tokens, classify_status, transport_error, Completion, CompletionProvider, Prompt};
use crate::config::ProviderConfig;
use crate::error::ProviderError;

pub struct OpenAIProvider {
    name: String,
    model: String,
    url: String,
    api_key: String,
    max_tokens: u32,
    temperature: f32,
    timeout: Duration,
    client: reqwest::Client,
}

impl OpenAIProvider {
    /// Reads the API key from `api_key_env` (default `OPENAI_API_KEY`).
    pub fn new(config: &ProviderConfig) -> Result<Self> {
        let key_env = config
            .api_key_env
            .clone()
            .unwrap_or_else(|| "OPENAI_API_KEY".to_string());
        let api_key = std::env::var(&key_env).map_err(|_| {
            anyhow::anyhow!("{} environment variable not set (provider '{}')", key_env, config.name)
        })?;
        let base = config
            .base_url
            .clone()
            .unwrap_or_else(|| "https://api.openai.com/v1".to_string());

        Ok(Self {
            name: config.name.clone(),
            model: config
                .model
                .clone()
                .unwrap_or_else(|| "gpt-4o-mini".to_string()),
            url: format!("{}/chat/completions", base.trim_end_matches('/')),
            api_key,
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            timeout: config.timeout(),
            client: reqwest::Client::builder().timeout(config.timeout()).build()?,
        })
    }
}

#[async_trait]
impl CompletionProvider for OpenAIProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(&self, prompt: &Prompt) -> Result<Completion, ProviderError> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": prompt.messages(),
            "max_tokens": self.max_tokens,
            "temperature": self.temperature,
        });

        let response = self
            .client
            .post(&self.url)
            .bearer_auth(&self.api_key)
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
        parse_chat_response(&json, prompt)
    }
}

fn parse_chat_response(json: &serde_json::Value, prompt: &Prompt) -> Result<Completion, ProviderError> {
    let text = json
        .pointer("/choices/0/message/content")
        .and_then(|c| c.as_str())
        .ok_or_else(|| ProviderError::InvalidResponse("missing choices[0].message.content".into()))?
        .to_string();

    let usage = |field: &str| {
        json.pointer(&format!("/usage/{}", field))
            .and_then(|v| v.as_u64())
            .map(|v| v as u32)
    };
    let tokens_in = usage("prompt_tokens").unwrap_or_else(|| {
        approx_tokens(&prompt.system_message()) + approx_tokens(&prompt.question)
    });
    let tokens_out = usage("completion_tokens").unwrap_or_else(|| approx_tokens(&text));

    Ok(Completion {
        text,
        tokens_in,
        tokens_out,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_chat_response_with_usage() {
        let json = json!({
            "choices": [{ "message": { "role": "assistant", "content": "Fourteen days." } }],
            "usage": { "prompt_tokens": 120, "completion_tokens": 3 }
        });
        let c = parse_chat_response(&json, &Prompt::new("q", Vec::new())).unwrap();
        assert_eq!(c.text, "Fourteen days.");
        assert_eq!((c.tokens_in, c.tokens_out), (120, 3));
    }

    #[test]
    fn test_parse_chat_response_estimates_missing_usage() {
        let json = json!({ "choices": [{ "message": { "content": "two words" } }] });
        let c = parse_chat_response(&json, &Prompt::new("q", Vec::new())).unwrap();
        assert_eq!(c.tokens_out, 2);
        assert!(c.tokens_in > 0);
    }

    #[test]
    fn test_parse_chat_response_rejects_garbage() {
        let err = parse_chat_response(&json!({ "oops": true }), &Prompt::new("q", Vec::new()))
            .unwrap_err();
        assert!(matches!(err, ProviderError::InvalidResponse(_)));
    }
}
