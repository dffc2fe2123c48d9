use anyhow::{Context, Result};
use log::{info, warn};
use std::time::Duration;

use crate::core::cache::{CacheState, UnitCache};
use crate::core::config::CaptionConfig;
use crate::core::retry::{call_with_retry, RetryPolicy};
use crate::core::state::{ManifestEntry, Stage, StageStatus};
use crate::services::transcribe::Transcriber;
use crate::utils::audio::{decode_wav, encode_wav, AudioClip};
use crate::utils::srt::{merge_caption_tracks, to_srt, CaptionSegment};

/// Transcribes chapter audio into an SRT track with unit-relative times.
pub struct CaptionStage {
    transcriber: Option<Box<dyn Transcriber>>,
    cache: UnitCache,
    window: Duration,
    retry: RetryPolicy,
}

impl CaptionStage {
    /// `transcriber` is `None` when captions are disabled.
    pub fn new(
        transcriber: Option<Box<dyn Transcriber>>,
        cache: UnitCache,
        config: &CaptionConfig,
    ) -> Self {
        Self {
            transcriber,
            cache,
            window: Duration::from_secs(u64::from(config.window_seconds.max(1))),
            retry: config.retry.clone(),
        }
    }

    pub async fn process(&self, entry: &ManifestEntry) -> StageStatus {
        let Some(transcriber) = self.transcriber.as_deref() else {
            return StageStatus::Skipped("captions disabled".to_string());
        };

        match self.cache.check(entry.index, &entry.name, Stage::Caption).await {
            Ok(CacheState::Valid) => {
                info!("Using cached captions for '{}'", entry.name);
                return StageStatus::Cached;
            }
            Ok(CacheState::StaleFailure) => {
                info!("Captions for '{}' failed previously, retrying", entry.name)
            }
            Ok(CacheState::Absent) => {}
            Err(e) => return StageStatus::Failed(format!("cache check failed: {:#}", e)),
        }

        let result = match self.transcribe_unit(transcriber, entry).await {
            Ok(segments) => {
                let srt = caption_artifact(&segments);
                self.cache
                    .store(entry.index, &entry.name, Stage::Caption, srt.as_bytes())
                    .await
                    .map(|_| segments.len())
            }
            Err(e) => Err(e),
        };

        match result {
            Ok(count) => {
                info!("Captions ready for '{}' ({} cues)", entry.name, count);
                StageStatus::Completed
            }
            Err(e) => {
                let reason = format!("{:#}", e);
                warn!("Captioning failed for '{}': {}", entry.name, reason);
                if let Err(e) = self
                    .cache
                    .record_failure(entry.index, &entry.name, Stage::Caption, &reason)
                    .await
                {
                    warn!("Could not record failure for '{}': {:#}", entry.name, e);
                }
                StageStatus::Failed(reason)
            }
        }
    }

    async fn transcribe_unit(
        &self,
        transcriber: &dyn Transcriber,
        entry: &ManifestEntry,
    ) -> Result<Vec<CaptionSegment>> {
        let bytes = self
            .cache
            .load_bytes(entry.index, &entry.name, Stage::Synthesis)
            .await?;
        let clip = decode_wav(&bytes)
            .with_context(|| format!("Audio for '{}' is not a readable WAV", entry.name))?;

        let windows = split_windows(&clip, self.window);
        let mut tracks = Vec::with_capacity(windows.len());
        for (i, window) in windows.iter().enumerate() {
            let wav = encode_wav(window)?;
            let wav_ref = &wav;
            let operation = if windows.len() > 1 {
                format!("transcribing '{}' ({}/{})", entry.name, i + 1, windows.len())
            } else {
                format!("transcribing '{}'", entry.name)
            };
            let segments = call_with_retry(&operation, &self.retry, move || {
                transcriber.transcribe(wav_ref)
            })
            .await?;
            tracks.push((window.duration(), segments));
        }

        Ok(merge_caption_tracks(&tracks))
    }
}

/// SRT for a unit track. A track without speech is stored as one blank
/// zero-length cue, which `parse_srt` drops, so the artifact still clears the
/// cache size check.
fn caption_artifact(segments: &[CaptionSegment]) -> String {
    if segments.is_empty() {
        to_srt(&[CaptionSegment::new(Duration::ZERO, Duration::ZERO, "")])
    } else {
        to_srt(segments)
    }
}

/// Cuts a clip into consecutive windows of at most `window` length.
pub fn split_windows(clip: &AudioClip, window: Duration) -> Vec<AudioClip> {
    let per_window = (window.as_secs_f64() * clip.sample_rate as f64).round() as usize;
    if per_window == 0 || clip.samples.len() <= per_window {
        return vec![clip.clone()];
    }
    clip.samples
        .chunks(per_window)
        .map(|chunk| AudioClip::new(chunk.to_vec(), clip.sample_rate))
        .collect()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::core::cache::FAILURE_SENTINEL;
    use crate::services::rewrite::tests::{fast_retry, test_cache};
    use crate::utils::audio::tests::write_test_wav;
    use crate::utils::srt::parse_srt;
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::{Arc, Mutex};

    /// One cue per call covering the first half of the clip. Records the
    /// duration of every clip it receives.
    #[derive(Default)]
    pub(crate) struct MockTranscriber {
        pub clips: Arc<Mutex<Vec<Duration>>>,
        pub fail: bool,
        /// Hears nothing in any clip.
        pub silent: bool,
    }

    #[async_trait]
    impl Transcriber for MockTranscriber {
        async fn transcribe(&self, wav: &[u8]) -> Result<Vec<CaptionSegment>> {
            let clip = decode_wav(wav)?;
            let duration = clip.duration();
            let mut clips = self.clips.lock().unwrap();
            clips.push(duration);
            if self.fail {
                anyhow::bail!("transcription service unavailable");
            }
            if self.silent {
                return Ok(Vec::new());
            }
            Ok(vec![CaptionSegment::new(
                Duration::ZERO,
                duration / 2,
                format!("Part {}", clips.len()),
            )])
        }
    }

    pub(crate) fn caption_config(window_seconds: u32) -> CaptionConfig {
        CaptionConfig {
            window_seconds,
            retry: fast_retry(),
            ..Default::default()
        }
    }

    fn entry() -> ManifestEntry {
        ManifestEntry {
            index: 0,
            name: "dawn".to_string(),
            file: "narration/00_dawn.txt".to_string(),
        }
    }

    fn write_audio(build: &Path, seconds: f32) -> Result<()> {
        write_test_wav(&build.join("audio/00_dawn.wav"), seconds, 8000)
    }

    #[tokio::test]
    async fn test_windows_are_offset_into_one_track() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        write_audio(temp_dir.path(), 5.0)?;
        let transcriber = MockTranscriber::default();
        let clips = transcriber.clips.clone();
        let stage = CaptionStage::new(
            Some(Box::new(transcriber)),
            test_cache(temp_dir.path()),
            &caption_config(2),
        );

        assert_eq!(stage.process(&entry()).await, StageStatus::Completed);
        assert_eq!(
            *clips.lock().unwrap(),
            vec![
                Duration::from_secs(2),
                Duration::from_secs(2),
                Duration::from_secs(1)
            ]
        );

        let srt = std::fs::read_to_string(temp_dir.path().join("captions/00_dawn.srt"))?;
        let cues = parse_srt(&srt)?;
        let starts: Vec<Duration> = cues.iter().map(|c| c.start).collect();
        assert_eq!(
            starts,
            vec![Duration::ZERO, Duration::from_secs(2), Duration::from_secs(4)]
        );
        assert_eq!(cues[2].text, "Part 3");
        Ok(())
    }

    #[tokio::test]
    async fn test_disabled_captions_are_skipped() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let stage = CaptionStage::new(None, test_cache(temp_dir.path()), &caption_config(300));
        assert!(matches!(
            stage.process(&entry()).await,
            StageStatus::Skipped(_)
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_failure_recorded_then_cached_on_success() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        write_audio(temp_dir.path(), 1.0)?;
        let srt_path = temp_dir.path().join("captions/00_dawn.srt");

        let failing = CaptionStage::new(
            Some(Box::new(MockTranscriber {
                fail: true,
                ..Default::default()
            })),
            test_cache(temp_dir.path()),
            &caption_config(300),
        );
        assert!(matches!(failing.process(&entry()).await, StageStatus::Failed(_)));
        assert!(std::fs::read_to_string(&srt_path)?.starts_with(FAILURE_SENTINEL));

        let transcriber = MockTranscriber::default();
        let clips = transcriber.clips.clone();
        let working = CaptionStage::new(
            Some(Box::new(transcriber)),
            test_cache(temp_dir.path()),
            &caption_config(300),
        );
        assert_eq!(working.process(&entry()).await, StageStatus::Completed);
        assert_eq!(working.process(&entry()).await, StageStatus::Cached);
        assert_eq!(clips.lock().unwrap().len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_silent_chapter_is_cached() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        write_audio(temp_dir.path(), 1.0)?;
        let transcriber = MockTranscriber {
            silent: true,
            ..Default::default()
        };
        let clips = transcriber.clips.clone();
        let stage = CaptionStage::new(
            Some(Box::new(transcriber)),
            test_cache(temp_dir.path()),
            &caption_config(300),
        );

        assert_eq!(stage.process(&entry()).await, StageStatus::Completed);
        assert_eq!(stage.process(&entry()).await, StageStatus::Cached);
        assert_eq!(clips.lock().unwrap().len(), 1);

        let srt = std::fs::read_to_string(temp_dir.path().join("captions/00_dawn.srt"))?;
        assert!(parse_srt(&srt)?.is_empty());
        Ok(())
    }

    #[test]
    fn test_split_windows_short_clip_untouched() {
        let clip = AudioClip::new(vec![0.1; 100], 100);
        let windows = split_windows(&clip, Duration::from_secs(300));
        assert_eq!(windows, vec![clip]);
    }
}
