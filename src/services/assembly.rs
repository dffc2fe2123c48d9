//! Final assembly: chapter WAVs concatenated in index order into one master
//! file, caption tracks merged onto the master timeline, and a chapter
//! timestamp index.

use anyhow::{Context, Result};
use log::{debug, info, warn};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::cache::{CacheState, UnitCache};
use crate::core::error::PipelineError;
use crate::core::state::{Manifest, Stage};
use crate::utils::audio::WavConcatenator;
use crate::utils::srt::{merge_caption_tracks, parse_srt, to_srt, CaptionSegment};

#[derive(Debug, Clone, Default)]
pub struct AssemblySummary {
    pub audio_path: Option<PathBuf>,
    pub captions_path: Option<PathBuf>,
    pub timestamps_path: Option<PathBuf>,
    /// Unit names on the master timeline, in playback order.
    pub included: Vec<String>,
    /// Units left out, with the reason.
    pub excluded: Vec<(String, String)>,
    pub total_duration: Duration,
}

struct Chapter {
    name: String,
    audio: PathBuf,
    captions: Vec<CaptionSegment>,
}

struct Placed {
    name: String,
    duration: Duration,
    captions: Vec<CaptionSegment>,
}

pub struct Assembler {
    cache: UnitCache,
    output_folder: PathBuf,
    title: String,
}

impl Assembler {
    pub fn new(cache: UnitCache, output_folder: &str, title: &str) -> Self {
        Self {
            cache,
            output_folder: PathBuf::from(output_folder),
            title: title.to_string(),
        }
    }

    pub fn audio_path(&self) -> PathBuf {
        self.output_folder.join(format!("{}.wav", self.title))
    }

    pub fn captions_path(&self) -> PathBuf {
        self.output_folder.join(format!("{}.srt", self.title))
    }

    pub fn timestamps_path(&self) -> PathBuf {
        self.output_folder.join("timestamps.txt")
    }

    pub async fn assemble(&self, manifest: &Manifest) -> Result<AssemblySummary> {
        let mut summary = AssemblySummary::default();
        let mut chapters = Vec::new();

        for entry in manifest.entries() {
            match self
                .cache
                .check(entry.index, &entry.name, Stage::Synthesis)
                .await?
            {
                CacheState::Valid => {}
                _ => {
                    exclude(&mut summary, &entry.name, "no playable audio");
                    continue;
                }
            }

            chapters.push(Chapter {
                name: entry.name.clone(),
                audio: PathBuf::from(self.cache.artifact_path(
                    entry.index,
                    &entry.name,
                    Stage::Synthesis,
                )),
                captions: self.load_captions(entry.index, &entry.name).await,
            });
        }

        if chapters.is_empty() {
            warn!("No chapter audio to assemble");
            return Ok(summary);
        }

        info!("Merging {} chapters...", chapters.len());
        let output = self.audio_path();
        let (placed, rejected, written) =
            tokio::task::spawn_blocking(move || concatenate(&output, chapters))
                .await
                .context("Audio concatenation task panicked")??;

        for (name, reason) in rejected {
            exclude(&mut summary, &name, &reason);
        }
        if !written {
            warn!("No chapter audio could be read");
            return Ok(summary);
        }

        let tracks: Vec<(Duration, Vec<CaptionSegment>)> = placed
            .iter()
            .map(|p| (p.duration, p.captions.clone()))
            .collect();
        let merged = merge_caption_tracks(&tracks);

        let storage = self.cache.storage();
        let captions_path = self.captions_path();
        storage
            .write(&captions_path.to_string_lossy(), to_srt(&merged).as_bytes())
            .await?;

        let timestamps_path = self.timestamps_path();
        let index = timestamp_index(placed.iter().map(|p| (p.name.as_str(), p.duration)));
        storage
            .write(&timestamps_path.to_string_lossy(), index.as_bytes())
            .await?;

        summary.total_duration = placed.iter().map(|p| p.duration).sum();
        summary.included = placed.into_iter().map(|p| p.name).collect();
        summary.audio_path = Some(self.audio_path());
        summary.captions_path = Some(captions_path);
        summary.timestamps_path = Some(timestamps_path);

        info!(
            "Audiobook assembled: {} chapters, {} ({} cues)",
            summary.included.len(),
            format_chapter_time(summary.total_duration),
            merged.len()
        );
        Ok(summary)
    }

    /// A unit without a readable caption track contributes no cues but keeps
    /// its place on the timeline.
    async fn load_captions(&self, index: usize, name: &str) -> Vec<CaptionSegment> {
        match self.cache.check(index, name, Stage::Caption).await {
            Ok(CacheState::Valid) => {}
            Ok(_) => {
                debug!("No captions for '{}'", name);
                return Vec::new();
            }
            Err(e) => {
                warn!("Could not check captions for '{}': {:#}", name, e);
                return Vec::new();
            }
        }

        let parsed = match self.cache.load_text(index, name, Stage::Caption).await {
            Ok(content) => parse_srt(&content),
            Err(e) => Err(e),
        };
        parsed.unwrap_or_else(|e| {
            warn!("Ignoring unreadable captions for '{}': {:#}", name, e);
            Vec::new()
        })
    }
}

fn exclude(summary: &mut AssemblySummary, name: &str, reason: &str) {
    let err = PipelineError::Assembly {
        unit: name.to_string(),
        message: reason.to_string(),
    };
    warn!("{}", err);
    summary.excluded.push((name.to_string(), reason.to_string()));
}

type Concatenated = (Vec<Placed>, Vec<(String, String)>, bool);

fn concatenate(output: &Path, chapters: Vec<Chapter>) -> Result<Concatenated> {
    let mut concatenator = WavConcatenator::new(output);
    let mut placed = Vec::with_capacity(chapters.len());
    let mut rejected = Vec::new();

    for chapter in chapters {
        match concatenator.append(&chapter.audio) {
            Ok(duration) => placed.push(Placed {
                name: chapter.name,
                duration,
                captions: chapter.captions,
            }),
            Err(e) => rejected.push((chapter.name, format!("{:#}", e))),
        }
    }

    let written = concatenator.finish()?;
    Ok((placed, rejected, written))
}

/// `Name Like This` from `name-like-this`.
pub fn chapter_title(name: &str) -> String {
    name.split(['-', '_'])
        .filter(|w| !w.is_empty())
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<String>>()
        .join(" ")
}

/// `MM:SS`, or `HH:MM:SS` from one hour on.
pub fn format_chapter_time(d: Duration) -> String {
    let total = d.as_secs();
    let (h, m, s) = (total / 3600, (total % 3600) / 60, total % 60);
    if h > 0 {
        format!("{:02}:{:02}:{:02}", h, m, s)
    } else {
        format!("{:02}:{:02}", m, s)
    }
}

/// One `time Title` line per chapter, each at the sum of the durations
/// before it.
pub fn timestamp_index<'a>(chapters: impl Iterator<Item = (&'a str, Duration)>) -> String {
    let mut offset = Duration::ZERO;
    let mut lines = Vec::new();
    for (name, duration) in chapters {
        lines.push(format!("{} {}", format_chapter_time(offset), chapter_title(name)));
        offset += duration;
    }
    let mut out = lines.join("\n");
    out.push('\n');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::cache::FAILURE_SENTINEL;
    use crate::core::state::ManifestEntry;
    use crate::services::rewrite::tests::test_cache;
    use crate::utils::audio::tests::write_test_wav;
    use crate::utils::audio::wav_duration;

    fn manifest(names: &[&str]) -> Manifest {
        let mut manifest = Manifest::default();
        for (index, name) in names.iter().enumerate() {
            manifest.upsert(ManifestEntry {
                index,
                name: name.to_string(),
                file: format!("narration/{:02}_{}.txt", index, name),
            });
        }
        manifest
    }

    fn write_captions(build: &Path, file: &str, cues: &[CaptionSegment]) -> Result<()> {
        std::fs::create_dir_all(build.join("captions"))?;
        std::fs::write(build.join("captions").join(file), to_srt(cues))?;
        Ok(())
    }

    #[tokio::test]
    async fn test_assembly_offsets_captions_by_preceding_audio() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let build = temp_dir.path().join("build");
        let output = temp_dir.path().join("output");
        write_test_wav(&build.join("audio/00_the-gate.wav"), 10.0, 8000)?;
        write_test_wav(&build.join("audio/01_quiet.wav"), 2.5, 8000)?;
        write_test_wav(&build.join("audio/02_the-end.wav"), 7.5, 8000)?;
        let cue = CaptionSegment::new(Duration::ZERO, Duration::from_secs(1), "Start.");
        write_captions(&build, "00_the-gate.srt", &[cue.clone()])?;
        write_captions(&build, "02_the-end.srt", &[cue.clone()])?;

        let assembler = Assembler::new(test_cache(&build), &output.to_string_lossy(), "book");
        let summary = assembler
            .assemble(&manifest(&["the-gate", "quiet", "the-end"]))
            .await?;

        assert_eq!(summary.included, vec!["the-gate", "quiet", "the-end"]);
        assert_eq!(summary.total_duration, Duration::from_secs(20));
        assert_eq!(wav_duration(&output.join("book.wav"))?, Duration::from_secs(20));

        let merged = parse_srt(&std::fs::read_to_string(output.join("book.srt"))?)?;
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].start, Duration::ZERO);
        assert_eq!(merged[1].start, Duration::from_millis(12_500));

        let index = std::fs::read_to_string(output.join("timestamps.txt"))?;
        assert_eq!(index, "00:00 The Gate\n00:10 Quiet\n00:12 The End\n");
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_and_failed_audio_are_excluded() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let build = temp_dir.path().join("build");
        let output = temp_dir.path().join("output");
        write_test_wav(&build.join("audio/00_one.wav"), 3.0, 8000)?;
        std::fs::write(
            build.join("audio/01_two.wav"),
            format!("{}. model error\n", FAILURE_SENTINEL),
        )?;
        write_test_wav(&build.join("audio/03_four.wav"), 2.0, 16000)?;

        let assembler = Assembler::new(test_cache(&build), &output.to_string_lossy(), "book");
        let summary = assembler
            .assemble(&manifest(&["one", "two", "three", "four"]))
            .await?;

        assert_eq!(summary.included, vec!["one"]);
        let excluded: Vec<&str> = summary.excluded.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(excluded, vec!["two", "three", "four"]);
        assert_eq!(wav_duration(&output.join("book.wav"))?, Duration::from_secs(3));
        Ok(())
    }

    #[tokio::test]
    async fn test_nothing_to_assemble() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let assembler = Assembler::new(
            test_cache(temp_dir.path()),
            &temp_dir.path().join("output").to_string_lossy(),
            "book",
        );
        let summary = assembler.assemble(&manifest(&["one"])).await?;
        assert!(summary.audio_path.is_none());
        assert_eq!(summary.excluded.len(), 1);
        Ok(())
    }

    #[test]
    fn test_chapter_time_and_title() {
        assert_eq!(format_chapter_time(Duration::from_secs(75)), "01:15");
        assert_eq!(format_chapter_time(Duration::from_secs(3725)), "01:02:05");
        assert_eq!(chapter_title("the-iron_wolf"), "The Iron Wolf");
    }
}
