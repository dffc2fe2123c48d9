//! Per-unit, per-stage artifacts on disk.
//!
//! Every stage writes exactly one artifact per unit. A failed attempt is
//! recorded by writing [`FAILURE_SENTINEL`] in place of the artifact, so a
//! rerun can tell "never tried" from "tried and failed" and retry only the
//! latter.

use anyhow::Result;
use log::debug;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

use super::io::Storage;
use super::state::Stage;

pub const FAILURE_SENTINEL: &str = "Error: Failed to process chapter";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheState {
    Valid,
    StaleFailure,
    Absent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_min_text_bytes")]
    pub min_text_bytes: u64,
    #[serde(default = "default_min_audio_bytes")]
    pub min_audio_bytes: u64,
    #[serde(default = "default_min_caption_bytes")]
    pub min_caption_bytes: u64,
}

fn default_min_text_bytes() -> u64 {
    100
}
fn default_min_audio_bytes() -> u64 {
    1000
}
fn default_min_caption_bytes() -> u64 {
    10
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            min_text_bytes: default_min_text_bytes(),
            min_audio_bytes: default_min_audio_bytes(),
            min_caption_bytes: default_min_caption_bytes(),
        }
    }
}

impl CacheConfig {
    pub fn min_bytes(&self, stage: Stage) -> u64 {
        match stage {
            Stage::Rewrite => self.min_text_bytes,
            Stage::Synthesis => self.min_audio_bytes,
            Stage::Caption => self.min_caption_bytes,
        }
    }
}

#[derive(Clone)]
pub struct UnitCache {
    storage: Arc<dyn Storage>,
    build_folder: String,
    limits: CacheConfig,
}

impl UnitCache {
    pub fn new(storage: Arc<dyn Storage>, build_folder: &str, limits: CacheConfig) -> Self {
        Self {
            storage,
            build_folder: build_folder.to_string(),
            limits,
        }
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    /// Artifact path relative to the build folder. Stable across runs.
    pub fn relative_path(&self, index: usize, name: &str, stage: Stage) -> String {
        format!(
            "{}/{:02}_{}.{}",
            stage.folder(),
            index,
            name,
            stage.extension()
        )
    }

    pub fn artifact_path(&self, index: usize, name: &str, stage: Stage) -> String {
        self.resolve(&self.relative_path(index, name, stage))
    }

    /// Joins a build-relative path onto the build folder.
    pub fn resolve(&self, relative: &str) -> String {
        Path::new(&self.build_folder)
            .join(relative)
            .to_string_lossy()
            .to_string()
    }

    pub async fn check(&self, index: usize, name: &str, stage: Stage) -> Result<CacheState> {
        let path = self.artifact_path(index, name, stage);
        let size = match self.storage.size(&path).await? {
            Some(size) => size,
            None => return Ok(CacheState::Absent),
        };

        let head = self
            .storage
            .read_head(&path, FAILURE_SENTINEL.len())
            .await?;
        if head == FAILURE_SENTINEL.as_bytes() {
            debug!("{} holds a failure sentinel", path);
            return Ok(CacheState::StaleFailure);
        }

        if size <= self.limits.min_bytes(stage) {
            debug!(
                "{} is only {} bytes (minimum {}), treating as failed",
                path,
                size,
                self.limits.min_bytes(stage)
            );
            return Ok(CacheState::StaleFailure);
        }

        Ok(CacheState::Valid)
    }

    /// Writes the artifact and returns its full path.
    pub async fn store(
        &self,
        index: usize,
        name: &str,
        stage: Stage,
        content: &[u8],
    ) -> Result<String> {
        let path = self.artifact_path(index, name, stage);
        self.storage.write(&path, content).await?;
        Ok(path)
    }

    pub async fn record_failure(
        &self,
        index: usize,
        name: &str,
        stage: Stage,
        reason: &str,
    ) -> Result<()> {
        let path = self.artifact_path(index, name, stage);
        let content = format!("{}. {}\n", FAILURE_SENTINEL, reason.trim());
        self.storage.write(&path, content.as_bytes()).await
    }

    pub async fn load_text(&self, index: usize, name: &str, stage: Stage) -> Result<String> {
        let path = self.artifact_path(index, name, stage);
        self.storage.read_to_string(&path).await
    }

    pub async fn load_bytes(&self, index: usize, name: &str, stage: Stage) -> Result<Vec<u8>> {
        let path = self.artifact_path(index, name, stage);
        self.storage.read(&path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::io::NativeStorage;

    fn cache_in(dir: &Path) -> UnitCache {
        UnitCache::new(
            Arc::new(NativeStorage::new()),
            &dir.to_string_lossy(),
            CacheConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_absent_then_valid() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let cache = cache_in(temp_dir.path());

        assert_eq!(cache.check(0, "intro", Stage::Rewrite).await?, CacheState::Absent);

        let text = "The wind carried the smell of rain over the hills. ".repeat(4);
        let path = cache.store(0, "intro", Stage::Rewrite, text.as_bytes()).await?;
        assert!(path.ends_with("narration/00_intro.txt"));
        assert_eq!(cache.check(0, "intro", Stage::Rewrite).await?, CacheState::Valid);
        assert_eq!(cache.load_text(0, "intro", Stage::Rewrite).await?, text);
        Ok(())
    }

    #[tokio::test]
    async fn test_sentinel_is_stale_failure() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let cache = cache_in(temp_dir.path());

        let long_reason = "rate limited by upstream service ".repeat(10);
        cache
            .record_failure(3, "battle", Stage::Synthesis, &long_reason)
            .await?;
        assert_eq!(
            cache.check(3, "battle", Stage::Synthesis).await?,
            CacheState::StaleFailure
        );

        let content = cache.load_text(3, "battle", Stage::Synthesis).await?;
        assert!(content.starts_with(FAILURE_SENTINEL));
        Ok(())
    }

    #[tokio::test]
    async fn test_undersized_artifact_is_stale_failure() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let cache = cache_in(temp_dir.path());

        cache.store(1, "tiny", Stage::Caption, b"1\n").await?;
        assert_eq!(
            cache.check(1, "tiny", Stage::Caption).await?,
            CacheState::StaleFailure
        );

        cache
            .store(1, "tiny", Stage::Caption, b"1\n00:00:00,000 --> 00:00:01,000\nHi\n\n")
            .await?;
        assert_eq!(cache.check(1, "tiny", Stage::Caption).await?, CacheState::Valid);
        Ok(())
    }
}
