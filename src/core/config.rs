use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use super::cache::CacheConfig;
use super::retry::RetryPolicy;
use crate::services::llm::LlmConfig;
use crate::services::memory::MemoryConfig;
use crate::services::rewrite::RewriteConfig;
use crate::services::transcribe::OpenAiTranscriberConfig;
use crate::services::tts::gradio::GradioConfig;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_input")]
    pub input_folder: String,

    #[serde(default = "default_output")]
    pub output_folder: String,

    #[serde(default = "default_build")]
    pub build_folder: String,

    /// Base name of the assembled audio and caption files.
    #[serde(default = "default_title")]
    pub title: String,

    /// Explicit chapter order (file stems). Falls back to file name order.
    #[serde(default)]
    pub chapters: Option<Vec<String>>,

    pub llm: LlmConfig,

    #[serde(default)]
    pub memory: MemoryConfig,

    #[serde(default)]
    pub rewrite: RewriteConfig,

    #[serde(default)]
    pub audio: AudioConfig,

    #[serde(default)]
    pub captions: CaptionConfig,

    #[serde(default)]
    pub cache: CacheConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AudioConfig {
    #[serde(default = "default_tts_provider")]
    pub provider: String,

    pub gradio: Option<GradioConfig>,

    /// Speaker name to reference clip. Must contain `default`.
    #[serde(default)]
    pub voices: BTreeMap<String, String>,

    #[serde(default = "default_max_segment_chars")]
    pub max_segment_chars: usize,

    /// Seconds of silence per blank line in the narration.
    #[serde(default = "default_silence_per_blank_line")]
    pub silence_per_blank_line: f32,

    #[serde(default = "default_peak_target")]
    pub peak_target: f32,

    #[serde(default)]
    pub carry_voice_across_units: bool,

    #[serde(default)]
    pub retry: RetryPolicy,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            provider: default_tts_provider(),
            gradio: None,
            voices: BTreeMap::new(),
            max_segment_chars: default_max_segment_chars(),
            silence_per_blank_line: default_silence_per_blank_line(),
            peak_target: default_peak_target(),
            carry_voice_across_units: false,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CaptionConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_transcriber_provider")]
    pub provider: String,

    pub openai: Option<OpenAiTranscriberConfig>,

    /// Audio is sent to the transcriber in windows of this many seconds.
    #[serde(default = "default_window_seconds")]
    pub window_seconds: u32,

    #[serde(default)]
    pub retry: RetryPolicy,
}

impl Default for CaptionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            provider: default_transcriber_provider(),
            openai: None,
            window_seconds: default_window_seconds(),
            retry: RetryPolicy::default(),
        }
    }
}

fn default_input() -> String {
    "input".to_string()
}
fn default_output() -> String {
    "output".to_string()
}
fn default_build() -> String {
    "build".to_string()
}
fn default_title() -> String {
    "audiobook".to_string()
}
fn default_tts_provider() -> String {
    "gradio".to_string()
}
fn default_transcriber_provider() -> String {
    "openai".to_string()
}
fn default_window_seconds() -> u32 {
    300
}
fn default_max_segment_chars() -> usize {
    250
}
fn default_silence_per_blank_line() -> f32 {
    0.3
}
fn default_peak_target() -> f32 {
    0.9
}
pub(crate) fn default_true() -> bool {
    true
}

/// Returns the configured key, or the value of `env_var` when the key is
/// missing or empty.
pub fn resolve_api_key(configured: Option<&str>, env_var: &str) -> Result<String> {
    match configured {
        Some(key) if !key.trim().is_empty() => Ok(key.to_string()),
        _ => std::env::var(env_var)
            .ok()
            .filter(|v| !v.trim().is_empty())
            .with_context(|| format!("No API key configured and {} is not set", env_var)),
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::load_from(Path::new("config.yml"))
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            anyhow::bail!("{} not found. Please create one.", path.display());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::from_yaml(&content).with_context(|| format!("Failed to parse {}", path.display()))
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: Config = serde_yaml_ng::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.audio.max_segment_chars == 0 {
            anyhow::bail!("audio.max_segment_chars must be greater than zero");
        }
        if !(self.audio.peak_target > 0.0 && self.audio.peak_target <= 1.0) {
            anyhow::bail!("audio.peak_target must be in (0, 1]");
        }
        if self.memory.slice_chars == 0 {
            anyhow::bail!("memory.slice_chars must be greater than zero");
        }
        if self.captions.window_seconds == 0 {
            anyhow::bail!("captions.window_seconds must be greater than zero");
        }
        if self.rewrite.chunk_chars == 0 {
            anyhow::bail!("rewrite.chunk_chars must be greater than zero");
        }
        Ok(())
    }

    pub fn ensure_directories(&self) -> Result<()> {
        fs::create_dir_all(&self.input_folder)?;
        fs::create_dir_all(&self.output_folder)?;
        fs::create_dir_all(&self.build_folder)?;
        Ok(())
    }

    pub fn manifest_path(&self) -> String {
        Path::new(&self.build_folder)
            .join("manifest.json")
            .to_string_lossy()
            .to_string()
    }
}
