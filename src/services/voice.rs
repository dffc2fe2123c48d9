use anyhow::{bail, Result};
use log::{info, warn};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const DEFAULT_VOICE: &str = "default";

/// Cue that hands narration back to the default voice.
pub const NARRATOR_CUE: &str = "Narrator";

/// Speaker names mapped to reference clips for voice cloning.
#[derive(Debug, Clone)]
pub struct VoiceMap {
    voices: BTreeMap<String, PathBuf>,
}

impl VoiceMap {
    pub fn new(voices: BTreeMap<String, PathBuf>) -> Result<Self> {
        if !voices.contains_key(DEFAULT_VOICE) {
            bail!(
                "Voice map has no '{}' entry (available: {})",
                DEFAULT_VOICE,
                voices.keys().cloned().collect::<Vec<_>>().join(", ")
            );
        }
        Ok(Self { voices })
    }

    /// Builds the map from config, dropping entries whose clip is missing.
    pub fn load(entries: &BTreeMap<String, String>) -> Result<Self> {
        let mut voices = BTreeMap::new();
        for (name, path) in entries {
            let path = PathBuf::from(path);
            if path.is_file() {
                info!("Loaded voice: {} ({})", name, path.display());
                voices.insert(name.clone(), path);
            } else {
                warn!("Voice '{}' dropped: {} not found", name, path.display());
            }
        }
        Self::new(voices)
    }

    /// Canonical name for `name`, matching exactly first and then ignoring case.
    pub fn resolve(&self, name: &str) -> Option<&str> {
        let name = name.trim();
        if let Some((key, _)) = self.voices.get_key_value(name) {
            return Some(key.as_str());
        }
        self.voices
            .keys()
            .find(|k| k.eq_ignore_ascii_case(name))
            .map(|k| k.as_str())
    }

    /// Reference clip for a voice; unknown or absent voices use the default.
    pub fn reference(&self, voice: Option<&str>) -> &Path {
        voice
            .and_then(|v| self.voices.get(v))
            .or_else(|| self.voices.get(DEFAULT_VOICE))
            .map(|p| p.as_path())
            .unwrap_or_else(|| Path::new(""))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.voices.keys().map(|k| k.as_str())
    }

    pub fn len(&self) -> usize {
        self.voices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.voices.is_empty()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn map(names: &[&str]) -> VoiceMap {
        VoiceMap::new(
            names
                .iter()
                .map(|n| (n.to_string(), PathBuf::from(format!("voices/{}.wav", n))))
                .collect(),
        )
        .unwrap()
    }

    #[test]
    fn test_default_required() {
        let voices: BTreeMap<String, PathBuf> =
            [("Anna".to_string(), PathBuf::from("a.wav"))].into_iter().collect();
        assert!(VoiceMap::new(voices).is_err());
    }

    #[test]
    fn test_missing_files_dropped() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let narrator = temp_dir.path().join("narrator.wav");
        std::fs::write(&narrator, b"RIFF")?;

        let entries: BTreeMap<String, String> = [
            ("default".to_string(), narrator.to_string_lossy().to_string()),
            ("Ghost".to_string(), temp_dir.path().join("ghost.wav").to_string_lossy().to_string()),
        ]
        .into_iter()
        .collect();

        let voices = VoiceMap::load(&entries)?;
        assert_eq!(voices.len(), 1);
        assert!(voices.resolve("Ghost").is_none());
        Ok(())
    }

    #[test]
    fn test_resolve_and_reference() {
        let voices = map(&["default", "Kestutis"]);
        assert_eq!(voices.resolve("kestutis"), Some("Kestutis"));
        assert_eq!(voices.reference(Some("Kestutis")), Path::new("voices/Kestutis.wav"));
        assert_eq!(voices.reference(None), Path::new("voices/default.wav"));
        assert_eq!(voices.reference(Some("Nobody")), Path::new("voices/default.wav"));
    }
}
