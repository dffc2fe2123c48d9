use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;

use crate::core::config::resolve_api_key;
use crate::core::retry::RetryPolicy;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LlmConfig {
    pub provider: String,

    #[serde(default)]
    pub retry: RetryPolicy,

    pub gemini: Option<GeminiConfig>,
    pub openai: Option<OpenAIConfig>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct GeminiConfig {
    /// Falls back to `GEMINI_API_KEY`.
    #[serde(default)]
    pub api_key: Option<String>,
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct OpenAIConfig {
    /// Falls back to `OPENAI_API_KEY`. Local servers usually accept any value.
    #[serde(default)]
    pub api_key: Option<String>,
    pub model: String,
    pub base_url: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

fn default_temperature() -> f32 {
    0.1
}

#[async_trait]
pub trait LlmClient: Send + Sync + Debug {
    async fn chat(&self, system: &str, user: &str) -> Result<String>;
}

pub fn create_llm(config: &LlmConfig) -> Result<Box<dyn LlmClient>> {
    match config.provider.as_str() {
        "gemini" => {
            let cfg = config.gemini.as_ref().context("Gemini config missing")?;
            let api_key = resolve_api_key(cfg.api_key.as_deref(), "GEMINI_API_KEY")?;
            Ok(Box::new(GeminiClient::new(&api_key, &cfg.model, cfg.temperature)))
        }
        "openai" => {
            let cfg = config.openai.as_ref().context("OpenAI config missing")?;
            let api_key = resolve_api_key(cfg.api_key.as_deref(), "OPENAI_API_KEY")
                .unwrap_or_default();
            Ok(Box::new(OpenAIClient::new(
                &api_key,
                &cfg.model,
                cfg.base_url.as_deref(),
                cfg.temperature,
            )))
        }
        _ => Err(anyhow!("Unknown LLM provider: {}", config.provider)),
    }
}

// --- Gemini ---
#[derive(Debug)]
struct GeminiClient {
    api_key: String,
    model: String,
    temperature: f32,
    client: reqwest::Client,
}

impl GeminiClient {
    fn new(api_key: &str, model: &str, temperature: f32) -> Self {
        Self {
            api_key: api_key.to_string(),
            model: model.to_string(),
            temperature,
            client: reqwest::Client::new(),
        }
    }
}

#[derive(Serialize)]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<GeminiSystemInstruction>,
    #[serde(rename = "generationConfig")]
    generation_config: GeminiGenerationConfig,
}

#[derive(Serialize)]
struct GeminiContent {
    role: String,
    parts: Vec<GeminiPart>,
}

#[derive(Serialize)]
struct GeminiSystemInstruction {
    parts: Vec<GeminiPart>,
}

#[derive(Serialize)]
struct GeminiPart {
    text: String,
}

#[derive(Serialize)]
struct GeminiGenerationConfig {
    temperature: f32,
}

#[derive(Deserialize)]
struct GeminiResponse {
    candidates: Option<Vec<GeminiCandidate>>,
    error: Option<GeminiError>,
}

#[derive(Deserialize)]
struct GeminiCandidate {
    content: Option<GeminiContentResponse>,
    #[serde(rename = "finishReason")]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct GeminiContentResponse {
    #[serde(default)]
    parts: Vec<GeminiPartResponse>,
}

#[derive(Deserialize)]
struct GeminiPartResponse {
    #[serde(default)]
    text: String,
}

#[derive(Deserialize, Debug)]
struct GeminiError {
    message: String,
}

#[async_trait]
impl LlmClient for GeminiClient {
    async fn chat(&self, system: &str, user: &str) -> Result<String> {
        let url = format!(
            "https://generativelanguage.googleapis.com/v1beta/models/{}:generateContent",
            self.model
        );

        let request_body = GeminiRequest {
            contents: vec![GeminiContent {
                role: "user".to_string(),
                parts: vec![GeminiPart {
                    text: user.to_string(),
                }],
            }],
            system_instruction: Some(GeminiSystemInstruction {
                parts: vec![GeminiPart {
                    text: system.to_string(),
                }],
            }),
            generation_config: GeminiGenerationConfig {
                temperature: self.temperature,
            },
        };

        let resp = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(&request_body)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let error_text = resp.text().await?;
            return Err(anyhow!("Gemini API error ({}): {}", status, error_text));
        }

        let response_text = resp.text().await?;
        let result: GeminiResponse = match serde_json::from_str(&response_text) {
            Ok(r) => r,
            Err(e) => {
                return Err(anyhow!(
                    "Failed to parse Gemini response: {}. Body: {}",
                    e,
                    response_text
                ))
            }
        };

        extract_gemini_text(result, &response_text)
    }
}

fn extract_gemini_text(result: GeminiResponse, raw: &str) -> Result<String> {
    if let Some(err) = result.error {
        return Err(anyhow!("Gemini API returned error: {}", err.message));
    }

    if let Some(first) = result.candidates.as_ref().and_then(|c| c.first()) {
        if let Some(content) = &first.content {
            let text: String = content.parts.iter().map(|p| p.text.as_str()).collect();
            if !text.trim().is_empty() {
                return Ok(text);
            }
        }

        let reason = first.finish_reason.as_deref().unwrap_or("UNKNOWN");
        return Err(anyhow!("Gemini response empty. Finish reason: {}", reason));
    }

    Err(anyhow!("Gemini response format unexpected or empty. Body: {}", raw))
}

// --- OpenAI-compatible ---

#[derive(Debug)]
struct OpenAIClient {
    api_key: String,
    model: String,
    base_url: String,
    temperature: f32,
    client: reqwest::Client,
}

impl OpenAIClient {
    fn new(api_key: &str, model: &str, base_url: Option<&str>, temperature: f32) -> Self {
        Self {
            api_key: api_key.to_string(),
            model: model.to_string(),
            base_url: base_url
                .unwrap_or("https://api.openai.com/v1")
                .trim_end_matches('/')
                .to_string(),
            temperature,
            client: reqwest::Client::new(),
        }
    }
}

#[derive(Serialize)]
struct OpenAIRequest {
    model: String,
    messages: Vec<OpenAIMessage>,
    temperature: f32,
}

#[derive(Serialize)]
struct OpenAIMessage {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct OpenAIResponse {
    choices: Vec<OpenAIChoice>,
}

#[derive(Deserialize)]
struct OpenAIChoice {
    message: OpenAIMessageResponse,
}

#[derive(Deserialize)]
struct OpenAIMessageResponse {
    content: Option<String>,
}

#[async_trait]
impl LlmClient for OpenAIClient {
    async fn chat(&self, system: &str, user: &str) -> Result<String> {
        let url = format!("{}/chat/completions", self.base_url);

        let request_body = OpenAIRequest {
            model: self.model.clone(),
            messages: vec![
                OpenAIMessage {
                    role: "system".to_string(),
                    content: system.to_string(),
                },
                OpenAIMessage {
                    role: "user".to_string(),
                    content: user.to_string(),
                },
            ],
            temperature: self.temperature,
        };

        let mut request = self.client.post(&url).json(&request_body);
        if !self.api_key.is_empty() {
            request = request.bearer_auth(&self.api_key);
        }
        let resp = request.send().await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let error_text = resp.text().await?;
            return Err(anyhow!("OpenAI API error ({}): {}", status, error_text));
        }

        let result: OpenAIResponse = resp.json().await?;
        if let Some(content) = result
            .choices
            .first()
            .and_then(|c| c.message.content.as_ref())
        {
            if !content.trim().is_empty() {
                return Ok(content.clone());
            }
        }

        Err(anyhow!("OpenAI response empty or missing content"))
    }
}
