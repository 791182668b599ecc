use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::Client;
use std::time::Duration;

use super::error::TranscribeError;
use super::tier::Tier;
use crate::audio::AudioFormat;
use crate::config::ApiConfig;

/// A single "transcribe this blob" call against the hosted speech service.
///
/// Implementations perform exactly one request and classify its failure.
/// Callers are expected to have checked the payload against the tier ceiling.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TranscriptionClient: Send + Sync {
    async fn transcribe(
        &self,
        audio: Vec<u8>,
        file_name: &str,
        language: &str,
    ) -> Result<String, TranscribeError>;
}

/// Client for the OpenAI-compatible `/audio/transcriptions` endpoint served by Groq
pub struct GroqClient {
    http: Client,
    base_url: String,
    api_key: String,
    model: String,
    prompt: Option<String>,
    tier: Tier,
}

impl GroqClient {
    pub fn new(config: &ApiConfig, api_key: String) -> anyhow::Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            model: config.model.clone(),
            prompt: config.prompt.clone(),
            tier: config.tier,
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/audio/transcriptions", self.base_url)
    }
}

#[async_trait]
impl TranscriptionClient for GroqClient {
    async fn transcribe(
        &self,
        audio: Vec<u8>,
        file_name: &str,
        language: &str,
    ) -> Result<String, TranscribeError> {
        let size_mb = crate::utils::bytes_to_mb(audio.len() as u64);
        let mime = std::path::Path::new(file_name)
            .extension()
            .and_then(|ext| ext.to_str())
            .and_then(AudioFormat::from_extension)
            .unwrap_or(AudioFormat::Mp3)
            .mime_type();

        let file = Part::bytes(audio)
            .file_name(file_name.to_string())
            .mime_str(mime)?;

        let mut form = Form::new()
            .part("file", file)
            .text("model", self.model.clone())
            .text("response_format", "text")
            .text("language", language.to_string())
            .text("temperature", "0.0");

        if let Some(prompt) = &self.prompt {
            form = form.text("prompt", prompt.clone());
        }

        tracing::debug!("Sending {:.1}MB to {} ({})", size_mb, self.endpoint(), file_name);

        let response = self
            .http
            .post(self.endpoint())
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TranscribeError::from_status(status.as_u16(), body, size_mb, self.tier));
        }

        let text = response.text().await?;
        Ok(text.trim().to_string())
    }
}
