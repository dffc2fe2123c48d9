use anyhow::{anyhow, Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use log::{info, warn};
use std::time::Duration;

use crate::core::cache::{CacheState, UnitCache};
use crate::core::config::AudioConfig;
use crate::core::error::{content_skip_reason, is_resource_failure, PipelineError};
use crate::core::retry::{call_with_retry, RetryPolicy};
use crate::core::state::{ManifestEntry, Stage, StageStatus};
use crate::services::script::{Instruction, ScriptEngine};
use crate::services::tts::TtsEngine;
use crate::services::voice::VoiceMap;
use crate::utils::audio::{encode_wav, peak_normalize, silence, AudioClip};

enum Piece {
    Speech(AudioClip),
    Pause(Duration),
}

/// Owns the speech model for the whole run and turns one chapter's
/// narration into one normalized WAV.
pub struct SynthesisStage {
    engine: Box<dyn TtsEngine>,
    script: ScriptEngine,
    cache: UnitCache,
    retry: RetryPolicy,
    peak_target: f32,
    carry_voice: bool,
}

impl SynthesisStage {
    pub fn new(
        engine: Box<dyn TtsEngine>,
        voices: VoiceMap,
        cache: UnitCache,
        config: &AudioConfig,
    ) -> Self {
        let script = ScriptEngine::new(
            voices,
            config.max_segment_chars,
            Duration::from_secs_f32(config.silence_per_blank_line.max(0.0)),
        );
        Self {
            engine,
            script,
            cache,
            retry: config.retry.clone(),
            peak_target: config.peak_target,
            carry_voice: config.carry_voice_across_units,
        }
    }

    pub async fn warm_up(&self) -> Result<()> {
        self.engine.warm_up().await.map_err(|e| {
            if is_resource_failure(&e) {
                e
            } else {
                PipelineError::resource(format!("speech model unavailable: {:#}", e)).into()
            }
        })
    }

    /// Synthesizes the chapter listed by `entry`.
    ///
    /// Returns `Err` only for resource failures, which end the worker.
    pub async fn process(&mut self, entry: &ManifestEntry) -> Result<StageStatus> {
        match self
            .cache
            .check(entry.index, &entry.name, Stage::Synthesis)
            .await
        {
            Ok(CacheState::Valid) => {
                info!("Using cached audio for '{}'", entry.name);
                return Ok(StageStatus::Cached);
            }
            Ok(CacheState::StaleFailure) => {
                info!("Audio for '{}' failed previously, retrying", entry.name)
            }
            Ok(CacheState::Absent) => {}
            Err(e) => return Ok(StageStatus::Failed(format!("cache check failed: {:#}", e))),
        }

        if !self.carry_voice {
            self.script.reset();
        }

        match self.synthesize_unit(entry).await {
            Ok(clip) => {
                let stored = match encode_wav(&clip) {
                    Ok(bytes) => {
                        self.cache
                            .store(entry.index, &entry.name, Stage::Synthesis, &bytes)
                            .await
                    }
                    Err(e) => Err(e),
                };
                match stored {
                    Ok(path) => {
                        info!(
                            "Audio ready for '{}': {} ({:.1}s)",
                            entry.name,
                            path,
                            clip.duration().as_secs_f32()
                        );
                        Ok(StageStatus::Completed)
                    }
                    Err(e) => Ok(StageStatus::Failed(format!("failed to store audio: {:#}", e))),
                }
            }
            Err(e) if is_resource_failure(&e) => Err(e),
            Err(e) => {
                if let Some(reason) = content_skip_reason(&e) {
                    warn!("Skipping audio for '{}': {}", entry.name, reason);
                    return Ok(StageStatus::Skipped(reason));
                }
                let reason = format!("{:#}", e);
                warn!("Synthesis failed for '{}': {}", entry.name, reason);
                if let Err(e) = self
                    .cache
                    .record_failure(entry.index, &entry.name, Stage::Synthesis, &reason)
                    .await
                {
                    warn!("Could not record failure for '{}': {:#}", entry.name, e);
                }
                Ok(StageStatus::Failed(reason))
            }
        }
    }

    async fn synthesize_unit(&mut self, entry: &ManifestEntry) -> Result<AudioClip> {
        let narration_path = self.cache.resolve(&entry.file);
        let narration = self
            .cache
            .storage()
            .read_to_string(&narration_path)
            .await
            .with_context(|| format!("Failed to read narration {}", narration_path))?;

        let instructions = self.script.segment(&narration);
        let spoken = instructions
            .iter()
            .filter(|i| matches!(i, Instruction::Speak { .. }))
            .count();
        if spoken == 0 {
            return Err(PipelineError::content(&entry.name, "narration has nothing to speak").into());
        }

        info!(
            "Synthesizing '{}' ({} segments)...",
            entry.name, spoken
        );
        let pb = ProgressBar::new(spoken as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})")?
                .progress_chars("#>-"),
        );

        let engine = self.engine.as_ref();
        let voices = self.script.voices();
        let mut pieces = Vec::with_capacity(instructions.len());
        let mut sample_rate = None;
        let mut succeeded = 0usize;

        for (i, instruction) in instructions.iter().enumerate() {
            let (voice, text) = match instruction {
                Instruction::Silence(pause) => {
                    pieces.push(Piece::Pause(*pause));
                    continue;
                }
                Instruction::Speak { voice, text } => (voice.as_deref(), text.as_str()),
            };

            let reference = voices.reference(voice);
            let operation = format!("synthesizing segment {} of '{}'", i + 1, entry.name);
            let result = call_with_retry(&operation, &self.retry, move || {
                engine.synthesize(text, reference)
            })
            .await;
            pb.inc(1);

            let clip = match result {
                Ok(clip) => clip,
                Err(e) if is_resource_failure(&e) => {
                    pb.abandon();
                    return Err(e);
                }
                Err(e) => {
                    warn!("Dropping segment {} of '{}': {:#}", i + 1, entry.name, e);
                    continue;
                }
            };
            if clip.is_empty() {
                warn!("Segment {} of '{}' produced no audio", i + 1, entry.name);
                continue;
            }
            match sample_rate {
                None => sample_rate = Some(clip.sample_rate),
                Some(rate) if rate != clip.sample_rate => {
                    warn!(
                        "Dropping segment {} of '{}': sample rate {} Hz, expected {} Hz",
                        i + 1,
                        entry.name,
                        clip.sample_rate,
                        rate
                    );
                    continue;
                }
                Some(_) => {}
            }
            succeeded += 1;
            pieces.push(Piece::Speech(clip));
        }
        pb.finish_and_clear();

        let sample_rate = match sample_rate {
            Some(rate) if succeeded > 0 => rate,
            _ => return Err(anyhow!("all {} segments failed", spoken)),
        };
        if succeeded < spoken {
            warn!(
                "'{}': {} of {} segments synthesized",
                entry.name, succeeded, spoken
            );
        }

        let mut samples = Vec::new();
        for piece in pieces {
            match piece {
                Piece::Speech(clip) => samples.extend(clip.samples),
                Piece::Pause(pause) => {
                    samples.extend(silence(pause.as_secs_f32(), sample_rate))
                }
            }
        }

        if !peak_normalize(&mut samples, self.peak_target) {
            warn!("Audio for '{}' is silent, left unnormalized", entry.name);
        }
        Ok(AudioClip::new(samples, sample_rate))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::core::cache::FAILURE_SENTINEL;
    use crate::services::rewrite::tests::{fast_retry, test_cache};
    use crate::services::voice::tests::map;
    use crate::utils::audio::decode_wav;
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};

    pub(crate) const MOCK_RATE: u32 = 8000;

    /// Returns 10 ms of audio per character and records (text, reference)
    /// pairs. Text containing `FAIL` is rejected.
    #[derive(Default)]
    pub(crate) struct MockTts {
        pub calls: Arc<Mutex<Vec<(String, String)>>>,
        pub broken: Arc<AtomicBool>,
    }

    #[async_trait]
    impl TtsEngine for MockTts {
        async fn warm_up(&self) -> Result<()> {
            if self.broken.load(Ordering::SeqCst) {
                anyhow::bail!("CUDA out of memory");
            }
            Ok(())
        }

        async fn synthesize(&self, text: &str, voice_reference: &Path) -> Result<AudioClip> {
            self.calls.lock().unwrap().push((
                text.to_string(),
                voice_reference.to_string_lossy().to_string(),
            ));
            if self.broken.load(Ordering::SeqCst) {
                return Err(PipelineError::resource("model crashed").into());
            }
            if text.contains("FAIL") {
                anyhow::bail!("synthesis error");
            }
            let len = text.chars().count() * MOCK_RATE as usize / 100;
            Ok(AudioClip::new(vec![0.3; len], MOCK_RATE))
        }
    }

    pub(crate) fn audio_config() -> AudioConfig {
        AudioConfig {
            retry: fast_retry(),
            ..Default::default()
        }
    }

    fn entry(name: &str) -> ManifestEntry {
        ManifestEntry {
            index: 0,
            name: name.to_string(),
            file: format!("narration/00_{}.txt", name),
        }
    }

    fn write_narration(build: &Path, name: &str, text: &str) -> Result<()> {
        std::fs::create_dir_all(build.join("narration"))?;
        std::fs::write(build.join(format!("narration/00_{}.txt", name)), text)?;
        Ok(())
    }

    fn stage(tts: MockTts, build: &Path) -> SynthesisStage {
        SynthesisStage::new(
            Box::new(tts),
            map(&["default", "Anna"]),
            test_cache(build),
            &audio_config(),
        )
    }

    #[tokio::test]
    async fn test_synthesizes_with_voices_and_pauses() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        write_narration(
            temp_dir.path(),
            "meeting",
            "The door opened slowly.\n\n[Anna]\nWho is there?\nShe waited.",
        )?;
        let tts = MockTts::default();
        let calls = tts.calls.clone();
        let mut stage = stage(tts, temp_dir.path());

        assert_eq!(stage.process(&entry("meeting")).await?, StageStatus::Completed);

        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[0].1, "voices/default.wav");
        assert_eq!(calls[1], ("Who is there?".to_string(), "voices/Anna.wav".to_string()));
        assert_eq!(calls[2].1, "voices/Anna.wav");

        let bytes = std::fs::read(temp_dir.path().join("audio/00_meeting.wav"))?;
        let clip = decode_wav(&bytes)?;
        assert_eq!(clip.sample_rate, MOCK_RATE);
        let speech_chars = "The door opened slowly.Who is there?She waited.".len();
        let expected = speech_chars * MOCK_RATE as usize / 100 + (0.3 * MOCK_RATE as f32).round() as usize;
        assert_eq!(clip.samples.len(), expected);
        let peak = clip.samples.iter().fold(0.0f32, |a, s| a.max(s.abs()));
        assert!((peak - 0.9).abs() < 1e-3);
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_segment_is_dropped() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        write_narration(temp_dir.path(), "gap", "First line.\nFAIL here.\nLast line.")?;
        let mut stage = stage(MockTts::default(), temp_dir.path());

        assert_eq!(stage.process(&entry("gap")).await?, StageStatus::Completed);
        let clip = decode_wav(&std::fs::read(temp_dir.path().join("audio/00_gap.wav"))?)?;
        let expected = "First line.Last line.".len() * MOCK_RATE as usize / 100;
        assert_eq!(clip.samples.len(), expected);
        Ok(())
    }

    #[tokio::test]
    async fn test_all_segments_failing_writes_sentinel() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        write_narration(temp_dir.path(), "lost", "FAIL one.\nFAIL two.")?;
        let mut stage = stage(MockTts::default(), temp_dir.path());

        assert!(matches!(
            stage.process(&entry("lost")).await?,
            StageStatus::Failed(_)
        ));
        let content = std::fs::read_to_string(temp_dir.path().join("audio/00_lost.wav"))?;
        assert!(content.starts_with(FAILURE_SENTINEL));
        Ok(())
    }

    #[tokio::test]
    async fn test_cached_audio_is_not_resynthesized() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        crate::utils::audio::tests::write_test_wav(
            &temp_dir.path().join("audio/00_done.wav"),
            1.0,
            MOCK_RATE,
        )?;
        let tts = MockTts::default();
        let calls = tts.calls.clone();
        let mut stage = stage(tts, temp_dir.path());

        assert_eq!(stage.process(&entry("done")).await?, StageStatus::Cached);
        assert!(calls.lock().unwrap().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_resource_failure_is_fatal() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        write_narration(temp_dir.path(), "crash", "Some words.")?;
        let tts = MockTts::default();
        tts.broken.store(true, Ordering::SeqCst);
        let mut stage = stage(tts, temp_dir.path());

        assert!(is_resource_failure(&stage.warm_up().await.unwrap_err()));
        let err = stage.process(&entry("crash")).await.unwrap_err();
        assert!(is_resource_failure(&err));
        assert!(!temp_dir.path().join("audio/00_crash.wav").exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_voice_resets_between_units() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        write_narration(temp_dir.path(), "one", "[Anna]\nHello there.")?;
        std::fs::write(temp_dir.path().join("narration/01_two.txt"), "Plain narration.")?;
        let tts = MockTts::default();
        let calls = tts.calls.clone();
        let mut stage = stage(tts, temp_dir.path());

        stage.process(&entry("one")).await?;
        stage
            .process(&ManifestEntry {
                index: 1,
                name: "two".to_string(),
                file: "narration/01_two.txt".to_string(),
            })
            .await?;

        let calls = calls.lock().unwrap();
        assert_eq!(calls[0].1, "voices/Anna.wav");
        assert_eq!(calls[1].1, "voices/default.wav");
        Ok(())
    }
}
