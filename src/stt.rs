//! Speech-to-text backends for voice sessions.
//!
//! A session hands one complete utterance to [`SpeechToText::transcribe`]
//! and gets text back. Failures become a voice `error` frame; they never end
//! the session.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::config::SttConfig;
use crate::error::SttError;

#[async_trait]
pub trait SpeechToText: Send + Sync {
    fn name(&self) -> &str;

    /// Transcribe one utterance. `mime_type` is what the client declared.
    async fn transcribe(&self, audio: &[u8], mime_type: &str) -> Result<String, SttError>;

    /// Whether the buffered audio already ends an utterance. Backends without
    /// voice-activity detection leave this to the client's `stop` frame.
    fn utterance_complete(&self, _audio: &[u8]) -> bool {
        false
    }
}

/// Used when `[stt].provider = "disabled"`. Every call fails.
pub struct DisabledStt;

#[async_trait]
impl SpeechToText for DisabledStt {
    fn name(&self) -> &str {
        "disabled"
    }

    async fn transcribe(&self, _audio: &[u8], _mime_type: &str) -> Result<String, SttError> {
        Err(SttError::Disabled)
    }
}

/// OpenAI-compatible `POST {base_url}/audio/transcriptions`.
pub struct OpenAiStt {
    url: String,
    api_key: String,
    model: String,
    timeout: Duration,
    client: reqwest::Client,
}

impl OpenAiStt {
    pub fn new(config: &SttConfig) -> Result<Self> {
        let key_env = config
            .api_key_env
            .clone()
            .unwrap_or_else(|| "OPENAI_API_KEY".to_string());
        let api_key = std::env::var(&key_env)
            .map_err(|_| anyhow::anyhow!("{} environment variable not set (stt)", key_env))?;
        let base = config
            .base_url
            .clone()
            .unwrap_or_else(|| "https://api.openai.com/v1".to_string());

        Ok(Self {
            url: format!("{}/audio/transcriptions", base.trim_end_matches('/')),
            api_key,
            model: config.model.clone(),
            timeout: config.timeout(),
            client: reqwest::Client::builder().timeout(config.timeout()).build()?,
        })
    }
}

#[async_trait]
impl SpeechToText for OpenAiStt {
    fn name(&self) -> &str {
        "openai"
    }

    async fn transcribe(&self, audio: &[u8], mime_type: &str) -> Result<String, SttError> {
        let part = reqwest::multipart::Part::bytes(audio.to_vec())
            .file_name(format!("utterance.{}", extension_for(mime_type)))
            .mime_str(mime_type)
            .map_err(|e| SttError::Failed(format!("invalid mime type '{}': {}", mime_type, e)))?;
        let form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("model", self.model.clone());

        let response = self
            .client
            .post(&self.url)
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    SttError::Timeout(self.timeout)
                } else {
                    SttError::Failed(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SttError::Failed(format!("{}: {}", status, body)));
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| SttError::Failed(e.to_string()))?;
        json.get("text")
            .and_then(|t| t.as_str())
            .map(|t| t.trim().to_string())
            .ok_or_else(|| SttError::Failed("response missing 'text'".into()))
    }
}

/// File extension the transcription API uses to sniff the container.
fn extension_for(mime_type: &str) -> &'static str {
    let base = mime_type.split(';').next().unwrap_or("").trim();
    match base {
        "audio/webm" => "webm",
        "audio/ogg" => "ogg",
        "audio/wav" | "audio/x-wav" | "audio/wave" => "wav",
        "audio/mpeg" | "audio/mp3" => "mp3",
        "audio/mp4" | "audio/m4a" | "audio/x-m4a" => "m4a",
        "audio/flac" => "flac",
        _ => "webm",
    }
}

pub fn create_stt(config: &SttConfig) -> Result<Arc<dyn SpeechToText>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledStt)),
        "openai" => Ok(Arc::new(OpenAiStt::new(config)?)),
        other => anyhow::bail!("Unknown stt provider: {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extension_for_codec_params() {
        assert_eq!(extension_for("audio/webm;codecs=opus"), "webm");
        assert_eq!(extension_for("audio/wav"), "wav");
        assert_eq!(extension_for("application/octet-stream"), "webm");
    }

    #[tokio::test]
    async fn test_disabled_stt_fails() {
        let stt = create_stt(&SttConfig::default()).unwrap();
        assert_eq!(stt.name(), "disabled");
        assert!(matches!(
            stt.transcribe(b"abc", "audio/webm").await,
            Err(SttError::Disabled)
        ));
        assert!(!stt.utterance_complete(b"abc"));
    }
}
