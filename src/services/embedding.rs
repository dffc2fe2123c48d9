use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;

use crate::core::config::resolve_api_key;
use crate::services::memory::MemoryConfig;

#[async_trait]
pub trait EmbeddingClient: Send + Sync + Debug {
    /// One vector per input text, in input order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

pub fn create_embedding_client(config: &MemoryConfig) -> Result<Box<dyn EmbeddingClient>> {
    match config.provider.as_str() {
        "gemini" => {
            let api_key = resolve_api_key(config.api_key.as_deref(), "GEMINI_API_KEY")?;
            Ok(Box::new(GeminiEmbeddingClient::new(&api_key, &config.model)))
        }
        "openai" => {
            let api_key =
                resolve_api_key(config.api_key.as_deref(), "OPENAI_API_KEY").unwrap_or_default();
            Ok(Box::new(OpenAIEmbeddingClient::new(
                &api_key,
                &config.model,
                config.base_url.as_deref(),
            )))
        }
        _ => Err(anyhow!("Unknown embedding provider: {}", config.provider)),
    }
}

fn check_count(vectors: Vec<Vec<f32>>, expected: usize) -> Result<Vec<Vec<f32>>> {
    if vectors.len() != expected {
        return Err(anyhow!(
            "Embedding service returned {} vectors for {} inputs",
            vectors.len(),
            expected
        ));
    }
    Ok(vectors)
}

// --- Gemini ---

#[derive(Debug)]
struct GeminiEmbeddingClient {
    api_key: String,
    model: String,
    client: reqwest::Client,
}

impl GeminiEmbeddingClient {
    fn new(api_key: &str, model: &str) -> Self {
        Self {
            api_key: api_key.to_string(),
            model: model.trim_start_matches("models/").to_string(),
            client: reqwest::Client::new(),
        }
    }
}

#[derive(Serialize)]
struct GeminiBatchRequest {
    requests: Vec<GeminiEmbedRequest>,
}

#[derive(Serialize)]
struct GeminiEmbedRequest {
    model: String,
    content: GeminiEmbedContent,
}

#[derive(Serialize)]
struct GeminiEmbedContent {
    parts: Vec<GeminiEmbedPart>,
}

#[derive(Serialize)]
struct GeminiEmbedPart {
    text: String,
}

#[derive(Deserialize)]
struct GeminiBatchResponse {
    #[serde(default)]
    embeddings: Vec<GeminiEmbedding>,
}

#[derive(Deserialize)]
struct GeminiEmbedding {
    values: Vec<f32>,
}

#[async_trait]
impl EmbeddingClient for GeminiEmbeddingClient {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let url = format!(
            "https://generativelanguage.googleapis.com/v1beta/models/{}:batchEmbedContents",
            self.model
        );
        let body = GeminiBatchRequest {
            requests: texts
                .iter()
                .map(|t| GeminiEmbedRequest {
                    model: format!("models/{}", self.model),
                    content: GeminiEmbedContent {
                        parts: vec![GeminiEmbedPart { text: t.clone() }],
                    },
                })
                .collect(),
        };

        let resp = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let error_text = resp.text().await?;
            return Err(anyhow!("Gemini embedding error ({}): {}", status, error_text));
        }

        let result: GeminiBatchResponse = resp
            .json()
            .await
            .context("Failed to parse Gemini embedding response")?;
        check_count(
            result.embeddings.into_iter().map(|e| e.values).collect(),
            texts.len(),
        )
    }
}

// --- OpenAI-compatible ---

#[derive(Debug)]
struct OpenAIEmbeddingClient {
    api_key: String,
    model: String,
    base_url: String,
    client: reqwest::Client,
}

impl OpenAIEmbeddingClient {
    fn new(api_key: &str, model: &str, base_url: Option<&str>) -> Self {
        Self {
            api_key: api_key.to_string(),
            model: model.to_string(),
            base_url: base_url
                .unwrap_or("https://api.openai.com/v1")
                .trim_end_matches('/')
                .to_string(),
            client: reqwest::Client::new(),
        }
    }
}

#[derive(Serialize)]
struct OpenAIEmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct OpenAIEmbeddingResponse {
    data: Vec<OpenAIEmbeddingData>,
}

#[derive(Deserialize)]
struct OpenAIEmbeddingData {
    #[serde(default)]
    index: usize,
    embedding: Vec<f32>,
}

fn openai_vectors(mut response: OpenAIEmbeddingResponse) -> Vec<Vec<f32>> {
    response.data.sort_by_key(|d| d.index);
    response.data.into_iter().map(|d| d.embedding).collect()
}

#[async_trait]
impl EmbeddingClient for OpenAIEmbeddingClient {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let url = format!("{}/embeddings", self.base_url);
        let body = OpenAIEmbeddingRequest {
            model: &self.model,
            input: texts,
        };

        let mut request = self.client.post(&url).json(&body);
        if !self.api_key.is_empty() {
            request = request.bearer_auth(&self.api_key);
        }
        let resp = request.send().await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let error_text = resp.text().await?;
            return Err(anyhow!("OpenAI embedding error ({}): {}", status, error_text));
        }

        let result: OpenAIEmbeddingResponse = resp
            .json()
            .await
            .context("Failed to parse embedding response")?;
        check_count(openai_vectors(result), texts.len())
    }
}
