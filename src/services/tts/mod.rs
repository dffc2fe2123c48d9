use anyhow::{anyhow, Result};
use async_trait::async_trait;
use log::info;
use std::path::Path;

use crate::core::config::AudioConfig;
use crate::utils::audio::AudioClip;

pub mod gradio;

/// A speech model that clones the voice in a reference clip.
///
/// The engine is owned by the synthesis worker and used from one task only.
#[async_trait]
pub trait TtsEngine: Send + Sync {
    /// Loads or contacts the model. An error here means the engine is
    /// unusable for the whole run.
    async fn warm_up(&self) -> Result<()>;

    async fn synthesize(&self, text: &str, voice_reference: &Path) -> Result<AudioClip>;
}

pub fn create_tts_engine(config: &AudioConfig) -> Result<Box<dyn TtsEngine>> {
    info!("Initializing TTS engine for provider: {}", config.provider);
    match config.provider.as_str() {
        "gradio" => {
            let gradio_config = config
                .gradio
                .clone()
                .ok_or_else(|| anyhow!("Gradio TTS config missing"))?;
            Ok(Box::new(gradio::GradioTtsEngine::new(gradio_config)))
        }
        _ => Err(anyhow!("Unknown TTS provider: {}", config.provider)),
    }
}
