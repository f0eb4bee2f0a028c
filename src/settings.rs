//! Transport settings persisted as JSON.
//!
//! Values loaded here are defaults for a DFU run; command line flags
//! override them. Missing keys take the built-in defaults.

use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

use crate::dfu::TransportConfig;

/// Settings file name used when only a directory is given.
pub const SETTINGS_FILENAME: &str = "dfu_settings.json";

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("Failed to read settings file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse settings JSON in {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to write settings file {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize settings: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Manages persistence of transport settings to a JSON file.
pub struct SettingsManager {
    settings_file_path: PathBuf,
}

impl SettingsManager {
    /// Settings stored in `path`. A directory resolves to `SETTINGS_FILENAME` inside it.
    pub fn new(path: &Path) -> Self {
        let settings_file_path = if path.is_dir() {
            path.join(SETTINGS_FILENAME)
        } else {
            path.to_path_buf()
        };
        Self { settings_file_path }
    }

    /// Load settings from disk, returning defaults if file doesn't exist.
    pub fn load(&self) -> Result<TransportConfig, SettingsError> {
        let path = &self.settings_file_path;
        if !path.exists() {
            debug!(path = %path.display(), "no settings file, using defaults");
            return Ok(TransportConfig::default());
        }

        let contents = fs::read_to_string(path).map_err(|source| SettingsError::Read {
            path: path.clone(),
            source,
        })?;

        // Handle empty file gracefully
        if contents.trim().is_empty() {
            return Ok(TransportConfig::default());
        }

        serde_json::from_str(&contents).map_err(|source| SettingsError::Parse {
            path: path.clone(),
            source,
        })
    }

    /// Save settings to disk.
    pub fn save(&self, settings: &TransportConfig) -> Result<(), SettingsError> {
        let path = &self.settings_file_path;
        let write_error = |source| SettingsError::Write {
            path: path.clone(),
            source,
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(write_error)?;
        }

        let contents = serde_json::to_string_pretty(settings)?;
        fs::write(path, contents).map_err(write_error)?;

        Ok(())
    }

    /// Get the path where settings are stored.
    pub fn settings_path(&self) -> &Path {
        &self.settings_file_path
    }
}
