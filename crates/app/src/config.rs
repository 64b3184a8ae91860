use drumseq_core::Settings;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub sequencer: Settings,
    /// Where track snapshots are kept. Defaults to the user data dir.
    #[serde(default)]
    pub store_dir: Option<PathBuf>,
}

impl AppConfig {
    pub fn config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("drumseq").join("config.toml"))
    }

    /// Missing or unreadable config falls back to the defaults.
    pub fn load() -> Self {
        Self::config_path()
            .map(|path| Self::load_from(&path))
            .unwrap_or_default()
    }

    pub fn load_from(path: &Path) -> Self {
        match fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_else(|err| {
                log::warn!("ignoring invalid config {}: {err}", path.display());
                Self::default()
            }),
            Err(_) => Self::default(),
        }
    }

    pub fn save(&self) -> anyhow::Result<PathBuf> {
        let path = Self::config_path()
            .ok_or_else(|| anyhow::anyhow!("no config directory on this platform"))?;
        self.save_to(&path)?;
        Ok(path)
    }

    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn store_dir(&self) -> PathBuf {
        self.store_dir.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .map(|p| p.join("drumseq").join("snapshots"))
                .unwrap_or_else(|| PathBuf::from(".drumseq"))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drumseq_core::TempoPolicy;

    #[test]
    fn test_missing_config_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig::load_from(&dir.path().join("config.toml"));
        assert_eq!(config, AppConfig::default());
    }

    #[test]
    fn test_partial_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            "store_dir = \"/tmp/beats\"\n\n[sequencer]\ndefault_bars = 4\ntempo_policy = \"track_override\"\n",
        )
        .unwrap();

        let config = AppConfig::load_from(&path);
        assert_eq!(config.sequencer.default_bars, 4);
        assert_eq!(config.sequencer.tempo_policy, TempoPolicy::TrackOverride);
        assert_eq!(config.sequencer.tick_interval_ms, 8);
        assert_eq!(config.store_dir(), PathBuf::from("/tmp/beats"));
    }

    #[test]
    fn test_invalid_config_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "sequencer = 12").unwrap();
        assert_eq!(AppConfig::load_from(&path), AppConfig::default());
    }

    #[test]
    fn test_save_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let mut config = AppConfig::default();
        config.sequencer.metronome_enabled = true;

        config.save_to(&path).unwrap();
        assert_eq!(AppConfig::load_from(&path), config);
    }
}
