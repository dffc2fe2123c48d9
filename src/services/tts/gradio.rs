//! Client for a voice-cloning model served through a Gradio app.
//!
//! Each synthesis is a four step exchange: upload the reference clip (once
//! per clip), submit a job, follow the job's event stream until it reports
//! the output file, and download that file.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use log::debug;
use reqwest::{multipart, Client};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use url::Url;

use super::TtsEngine;
use crate::core::error::PipelineError;
use crate::utils::audio::{decode_wav, AudioClip};

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct GradioConfig {
    /// e.g. "http://127.0.0.1:7860"
    pub base_url: String,

    /// API name of the generation function.
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// Extra inputs appended after the reference clip and the text.
    #[serde(default)]
    pub extra_inputs: Vec<Value>,
}

fn default_endpoint() -> String {
    "generate".to_string()
}

pub struct GradioTtsEngine {
    config: GradioConfig,
    base_url: String,
    client: Client,
    uploads: Mutex<HashMap<PathBuf, String>>,
}

impl GradioTtsEngine {
    pub fn new(config: GradioConfig) -> Self {
        Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            config,
            client: Client::new(),
            uploads: Mutex::new(HashMap::new()),
        }
    }

    async fn upload_reference(&self, voice_reference: &Path) -> Result<String> {
        let mut uploads = self.uploads.lock().await;
        if let Some(server_path) = uploads.get(voice_reference) {
            return Ok(server_path.clone());
        }

        let data = tokio::fs::read(voice_reference)
            .await
            .with_context(|| format!("Failed to read voice reference {:?}", voice_reference))?;
        debug!("Uploading voice reference {:?} ({} bytes)", voice_reference, data.len());

        let file_name = voice_reference
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "reference.wav".to_string());
        let part = multipart::Part::bytes(data)
            .file_name(file_name)
            .mime_str("audio/wav")
            .context("Invalid mime type")?;
        let form = multipart::Form::new().part("files", part);

        let upload_resp = self
            .client
            .post(format!("{}/gradio_api/upload", self.base_url))
            .multipart(form)
            .send()
            .await
            .context("Failed to send upload request")?
            .error_for_status()
            .context("Upload rejected")?
            .json::<Vec<String>>()
            .await
            .context("Failed to parse upload response")?;

        let server_path = upload_resp
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("Upload failed: empty response"))?;
        debug!("Reference uploaded to {}", server_path);

        uploads.insert(voice_reference.to_path_buf(), server_path.clone());
        Ok(server_path)
    }

    async fn submit(&self, server_path: &str, text: &str) -> Result<String> {
        let mut data = vec![
            json!({
                "path": server_path,
                "meta": {"_type": "gradio.FileData"}
            }),
            Value::String(text.to_string()),
        ];
        data.extend(self.config.extra_inputs.iter().cloned());

        let gen_resp = self
            .client
            .post(format!(
                "{}/gradio_api/call/{}",
                self.base_url, self.config.endpoint
            ))
            .json(&json!({ "data": data }))
            .send()
            .await
            .context("Failed to send generation request")?
            .error_for_status()
            .context("Generation request rejected")?
            .json::<Value>()
            .await
            .context("Failed to parse generation response")?;

        gen_resp["event_id"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| anyhow!("No event_id in generation response: {}", gen_resp))
    }

    async fn wait_for_output(&self, event_id: &str) -> Result<String> {
        let mut stream = self
            .client
            .get(format!(
                "{}/gradio_api/call/{}/{}",
                self.base_url, self.config.endpoint, event_id
            ))
            .send()
            .await
            .context("Failed to connect to event stream")?
            .error_for_status()?
            .bytes_stream();

        let mut events = EventStreamParser::default();
        while let Some(item) = stream.next().await {
            let chunk = item.context("Event stream error")?;
            if let Some(location) = events.feed(&chunk)? {
                return Ok(location);
            }
        }

        Err(anyhow!("Event stream ended without an output file"))
    }

    async fn download(&self, location: &str) -> Result<Vec<u8>> {
        let url = if location.starts_with("http://") || location.starts_with("https://") {
            Url::parse(location)?
        } else {
            Url::parse(&format!("{}/gradio_api/file={}", self.base_url, location))?
        };
        debug!("Downloading {}", url);

        let bytes = self
            .client
            .get(url)
            .send()
            .await
            .context("Failed to download result")?
            .error_for_status()?
            .bytes()
            .await
            .context("Failed to read result body")?;
        Ok(bytes.to_vec())
    }
}

#[async_trait]
impl TtsEngine for GradioTtsEngine {
    async fn warm_up(&self) -> Result<()> {
        let url = format!("{}/gradio_api/info", self.base_url);
        let resp = self.client.get(&url).send().await.map_err(|e| {
            PipelineError::resource(format!("TTS server {} unreachable: {}", self.base_url, e))
        })?;
        if !resp.status().is_success() {
            return Err(PipelineError::resource(format!(
                "TTS server {} answered {}",
                self.base_url,
                resp.status()
            ))
            .into());
        }
        Ok(())
    }

    async fn synthesize(&self, text: &str, voice_reference: &Path) -> Result<AudioClip> {
        let server_path = self.upload_reference(voice_reference).await?;
        let event_id = self.submit(&server_path, text).await?;
        debug!("Job {} submitted ({} chars)", event_id, text.chars().count());
        let location = self.wait_for_output(&event_id).await?;
        let bytes = self.download(&location).await?;
        decode_wav(&bytes).context("TTS server returned unreadable audio")
    }
}

/// Incremental parser for Gradio's server-sent events. Lines, and the UTF-8
/// sequences inside them, may be split across network chunks, so bytes are
/// buffered until a full line arrives.
#[derive(Default)]
struct EventStreamParser {
    buffer: Vec<u8>,
    event: String,
}

impl EventStreamParser {
    /// Returns the output file location once the stream reports completion.
    fn feed(&mut self, chunk: &[u8]) -> Result<Option<String>> {
        self.buffer.extend_from_slice(chunk);

        while let Some(newline) = self.buffer.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=newline).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(['\r', '\n']);

            if let Some(event) = line.strip_prefix("event:") {
                self.event = event.trim().to_string();
                continue;
            }
            let Some(payload) = line.strip_prefix("data:") else {
                continue;
            };
            let payload = payload.trim();

            if self.event == "error" {
                return Err(anyhow!("TTS job failed: {}", payload));
            }
            if payload.is_empty() || payload == "null" {
                continue;
            }
            if let Ok(data) = serde_json::from_str::<Value>(payload) {
                if let Some(location) = output_location(&data) {
                    return Ok(Some(location));
                }
            }
        }

        Ok(None)
    }
}

fn output_location(data: &Value) -> Option<String> {
    let file_info = data.as_array()?.first()?;
    file_info["url"]
        .as_str()
        .or_else(|| file_info["path"].as_str())
        .map(str::to_string)
}
