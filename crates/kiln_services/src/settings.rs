//! Settings management

use kiln_core::EngineConfig;
use kiln_script::ScriptSettings;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to read settings from '{path}': {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to write settings to '{path}': {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid settings in '{path}': {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// Kiln settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub engine: EngineConfig,
    pub script: ScriptSettings,
    pub watch: WatchSettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchSettings {
    pub enabled: bool,
    /// Length of a change batch window, counted from its first event.
    /// Later events do not extend it.
    pub debounce_ms: u64,
    /// Interval of the polling change source.
    pub poll_interval_ms: u64,
}

impl Default for WatchSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            debounce_ms: 200,
            poll_interval_ms: 1_000,
        }
    }
}

impl Settings {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| SettingsError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| SettingsError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Like [`load`](Self::load), but a missing file yields the defaults.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        match Self::load(path) {
            Err(SettingsError::Read { path, source }) if source.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no settings file; using defaults");
                Ok(Self::default())
            }
            other => other,
        }
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), SettingsError> {
        let path = path.as_ref();
        let text = serde_json::to_string_pretty(self).map_err(|source| SettingsError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        std::fs::write(path, text).map_err(|source| SettingsError::Write {
            path: path.to_path_buf(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("kiln.json");
        let mut settings = Settings::default();
        settings.engine.modification_check = true;
        settings.watch.enabled = true;
        settings.script.strict = false;

        settings.save(&path).expect("saves");
        assert_eq!(Settings::load(&path).expect("loads"), settings);
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("kiln.json");
        std::fs::write(&path, r#"{ "watch": { "debounce_ms": 50 } }"#).expect("write");

        let settings = Settings::load(&path).expect("loads");
        assert_eq!(settings.watch.debounce_ms, 50);
        assert_eq!(settings.watch.poll_interval_ms, 1_000);
        assert_eq!(settings.engine, EngineConfig::default());
    }

    #[test]
    fn missing_file_is_default_but_garbage_is_an_error() {
        let dir = tempfile::tempdir().expect("temp dir");
        let missing = dir.path().join("absent.json");
        assert_eq!(Settings::load_or_default(&missing).expect("defaults"), Settings::default());

        let garbage = dir.path().join("garbage.json");
        std::fs::write(&garbage, "{ nope").expect("write");
        assert!(matches!(
            Settings::load_or_default(&garbage),
            Err(SettingsError::Parse { .. })
        ));
    }
}
