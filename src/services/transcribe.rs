use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::multipart;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::core::config::{resolve_api_key, CaptionConfig};
use crate::utils::srt::CaptionSegment;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct OpenAiTranscriberConfig {
    /// Falls back to `OPENAI_API_KEY`.
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_model")]
    pub model: String,
    pub base_url: Option<String>,
    /// ISO-639-1 hint, e.g. "en".
    pub language: Option<String>,
}

fn default_model() -> String {
    "whisper-1".to_string()
}

/// Speech-to-text with segment timings relative to the start of the clip.
#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(&self, wav: &[u8]) -> Result<Vec<CaptionSegment>>;
}

pub fn create_transcriber(config: &CaptionConfig) -> Result<Box<dyn Transcriber>> {
    match config.provider.as_str() {
        "openai" => {
            let cfg = config
                .openai
                .clone()
                .ok_or_else(|| anyhow!("OpenAI transcription config missing"))?;
            let api_key =
                resolve_api_key(cfg.api_key.as_deref(), "OPENAI_API_KEY").unwrap_or_default();
            Ok(Box::new(OpenAiTranscriber::new(cfg, api_key)))
        }
        _ => Err(anyhow!("Unknown transcription provider: {}", config.provider)),
    }
}

pub struct OpenAiTranscriber {
    config: OpenAiTranscriberConfig,
    api_key: String,
    base_url: String,
    client: reqwest::Client,
}

impl OpenAiTranscriber {
    pub fn new(config: OpenAiTranscriberConfig, api_key: String) -> Self {
        Self {
            base_url: config
                .base_url
                .as_deref()
                .unwrap_or("https://api.openai.com/v1")
                .trim_end_matches('/')
                .to_string(),
            config,
            api_key,
            client: reqwest::Client::new(),
        }
    }
}

#[derive(Deserialize)]
struct VerboseTranscription {
    #[serde(default)]
    text: String,
    #[serde(default)]
    duration: Option<f64>,
    #[serde(default)]
    segments: Vec<VerboseSegment>,
}

#[derive(Deserialize)]
struct VerboseSegment {
    start: f64,
    end: f64,
    text: String,
}

fn seconds(value: f64) -> Duration {
    Duration::from_secs_f64(value.max(0.0))
}

fn into_captions(response: VerboseTranscription) -> Vec<CaptionSegment> {
    if response.segments.is_empty() {
        let text = response.text.trim();
        if text.is_empty() {
            return Vec::new();
        }
        // Servers without segment support still report the whole text.
        return vec![CaptionSegment::new(
            Duration::ZERO,
            seconds(response.duration.unwrap_or(0.0)),
            text,
        )];
    }

    response
        .segments
        .into_iter()
        .filter(|s| !s.text.trim().is_empty())
        .map(|s| CaptionSegment::new(seconds(s.start), seconds(s.end), s.text.trim()))
        .collect()
}

#[async_trait]
impl Transcriber for OpenAiTranscriber {
    async fn transcribe(&self, wav: &[u8]) -> Result<Vec<CaptionSegment>> {
        let part = multipart::Part::bytes(wav.to_vec())
            .file_name("audio.wav")
            .mime_str("audio/wav")
            .context("Invalid mime type")?;
        let mut form = multipart::Form::new()
            .part("file", part)
            .text("model", self.config.model.clone())
            .text("response_format", "verbose_json")
            .text("timestamp_granularities[]", "segment");
        if let Some(language) = &self.config.language {
            form = form.text("language", language.clone());
        }

        let mut request = self
            .client
            .post(format!("{}/audio/transcriptions", self.base_url))
            .multipart(form);
        if !self.api_key.is_empty() {
            request = request.bearer_auth(&self.api_key);
        }
        let resp = request.send().await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let error_text = resp.text().await?;
            return Err(anyhow!("Transcription API error ({}): {}", status, error_text));
        }

        let result: VerboseTranscription = resp
            .json()
            .await
            .context("Failed to parse transcription response")?;
        Ok(into_captions(result))
    }
}
