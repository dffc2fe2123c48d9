use anyhow::{Context, Result};
use log::debug;
use serde::{Deserialize, Serialize};
use std::fmt;

use super::io::Storage;

/// One chapter of the source document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkUnit {
    pub index: usize,
    pub name: String,
    pub source_text: String,
}

impl WorkUnit {
    pub fn new(index: usize, name: impl Into<String>, source_text: impl Into<String>) -> Self {
        Self {
            index,
            name: name.into(),
            source_text: source_text.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Rewrite,
    Synthesis,
    Caption,
}

impl Stage {
    pub fn folder(&self) -> &'static str {
        match self {
            Stage::Rewrite => "narration",
            Stage::Synthesis => "audio",
            Stage::Caption => "captions",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Stage::Rewrite => "txt",
            Stage::Synthesis => "wav",
            Stage::Caption => "srt",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Stage::Rewrite => "rewrite",
            Stage::Synthesis => "synthesis",
            Stage::Caption => "caption",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub index: usize,
    pub name: String,
    /// Narration path relative to the build folder.
    pub file: String,
}

/// Ordered index of units whose narration is available.
///
/// Serialized as a bare JSON array. Entries are keyed by unit name and kept
/// sorted by index, so rewriting the file for an unchanged set of units
/// produces identical bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Manifest {
    entries: Vec<ManifestEntry>,
}

impl Manifest {
    pub async fn load(storage: &dyn Storage, path: &str) -> Result<Self> {
        if !storage.exists(path).await? {
            return Ok(Self::default());
        }
        let content = storage.read_to_string(path).await?;
        let mut manifest: Manifest = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse manifest {}", path))?;
        manifest.entries.sort_by_key(|e| e.index);
        Ok(manifest)
    }

    pub async fn save(&self, storage: &dyn Storage, path: &str) -> Result<()> {
        let mut content = serde_json::to_string_pretty(self)?;
        content.push('\n');
        storage.write(path, content.as_bytes()).await
    }

    /// Inserts or replaces the entry for `entry.name`. Returns true if the
    /// manifest changed.
    pub fn upsert(&mut self, entry: ManifestEntry) -> bool {
        if let Some(existing) = self.entries.iter_mut().find(|e| e.name == entry.name) {
            if *existing == entry {
                return false;
            }
            *existing = entry;
        } else {
            self.entries.push(entry);
        }
        self.entries.sort_by_key(|e| e.index);
        true
    }

    /// Drops entries that do not name one of `units` at the same index.
    /// Returns true if anything was removed.
    pub fn retain_units(&mut self, units: &[WorkUnit]) -> bool {
        let before = self.entries.len();
        self.entries.retain(|entry| {
            let current = units
                .iter()
                .any(|u| u.name == entry.name && u.index == entry.index);
            if !current {
                debug!("Dropping '{}' (index {}) from manifest", entry.name, entry.index);
            }
            current
        });
        self.entries.len() != before
    }

    pub fn entries(&self) -> &[ManifestEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Outcome of one stage for one unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageStatus {
    Completed,
    Cached,
    Skipped(String),
    Failed(String),
    NotReached,
}

impl StageStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, StageStatus::Completed | StageStatus::Cached)
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageStatus::Completed => f.write_str("completed"),
            StageStatus::Cached => f.write_str("cached"),
            StageStatus::Skipped(reason) => write!(f, "skipped ({})", reason),
            StageStatus::Failed(reason) => write!(f, "failed ({})", reason),
            StageStatus::NotReached => f.write_str("not reached"),
        }
    }
}

/// A stage worker's record of what happened to one unit.
#[derive(Debug, Clone)]
pub struct StageOutcome {
    pub index: usize,
    pub name: String,
    pub stage: Stage,
    pub status: StageStatus,
}

#[derive(Debug, Clone)]
pub struct UnitReport {
    pub index: usize,
    pub name: String,
    pub rewrite: StageStatus,
    pub synthesis: StageStatus,
    pub caption: StageStatus,
}

impl UnitReport {
    fn new(index: usize, name: &str) -> Self {
        Self {
            index,
            name: name.to_string(),
            rewrite: StageStatus::NotReached,
            synthesis: StageStatus::NotReached,
            caption: StageStatus::NotReached,
        }
    }

    fn statuses(&self) -> [&StageStatus; 3] {
        [&self.rewrite, &self.synthesis, &self.caption]
    }

    pub fn is_failed(&self) -> bool {
        self.statuses()
            .iter()
            .any(|s| matches!(s, StageStatus::Failed(_)))
    }

    /// Narration and audio are available; captions are either done or
    /// disabled.
    pub fn is_complete(&self) -> bool {
        self.rewrite.is_success()
            && self.synthesis.is_success()
            && (self.caption.is_success() || matches!(self.caption, StageStatus::Skipped(_)))
    }
}

/// Per-unit status across all stages, ordered by index.
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    units: Vec<UnitReport>,
}

impl RunReport {
    pub fn new(units: &[WorkUnit]) -> Self {
        Self {
            units: units.iter().map(|u| UnitReport::new(u.index, &u.name)).collect(),
        }
    }

    pub fn record(&mut self, outcome: StageOutcome) {
        if !self.units.iter().any(|u| u.index == outcome.index) {
            self.units.push(UnitReport::new(outcome.index, &outcome.name));
            self.units.sort_by_key(|u| u.index);
        }
        if let Some(unit) = self.units.iter_mut().find(|u| u.index == outcome.index) {
            match outcome.stage {
                Stage::Rewrite => unit.rewrite = outcome.status,
                Stage::Synthesis => unit.synthesis = outcome.status,
                Stage::Caption => unit.caption = outcome.status,
            }
        }
    }

    pub fn units(&self) -> &[UnitReport] {
        &self.units
    }

    pub fn attempted(&self) -> usize {
        self.units.len()
    }

    pub fn completed(&self) -> usize {
        self.units.iter().filter(|u| u.is_complete()).count()
    }

    pub fn failed(&self) -> usize {
        self.units.iter().filter(|u| u.is_failed()).count()
    }

    pub fn summary(&self) -> String {
        format!(
            "{} attempted, {} completed, {} failed",
            self.attempted(),
            self.completed(),
            self.failed()
        )
    }
}
