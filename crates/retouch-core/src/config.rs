//! Session configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Default quiescence window before a dirty session is flushed.
pub const DEFAULT_DEBOUNCE_MS: u64 = 1500;

/// Maximum number of undo states to keep.
pub const DEFAULT_HISTORY_DEPTH: usize = 50;

/// Largest decoded image accepted, in pixels.
pub const DEFAULT_MAX_PIXELS: u64 = 40_000_000;

/// Largest encoded source accepted, in bytes (the upload limit).
pub const DEFAULT_MAX_SOURCE_BYTES: usize = 20 * 1024 * 1024;

/// Longest edge of generated thumbnails.
pub const DEFAULT_THUMBNAIL_SIZE: u32 = 300;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {message}")]
    Io { path: String, message: String },
    #[error("Invalid config: {0}")]
    Parse(String),
    #[error("Config value out of range: {0}")]
    Invalid(&'static str),
}

/// Tunables for one editing session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Quiescence window for debounced flushes, in milliseconds.
    pub debounce_ms: u64,
    /// Undo depth; older entries are evicted.
    pub history_depth: usize,
    /// Pixel budget for decoded images.
    pub max_pixels: u64,
    /// Byte budget for encoded source images.
    pub max_source_bytes: usize,
    /// Longest thumbnail edge.
    pub thumbnail_size: u32,
    /// Font used to rasterize text overlays. The bundled DejaVu Sans is used
    /// when unset or unreadable.
    pub font_path: Option<PathBuf>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            debounce_ms: DEFAULT_DEBOUNCE_MS,
            history_depth: DEFAULT_HISTORY_DEPTH,
            max_pixels: DEFAULT_MAX_PIXELS,
            max_source_bytes: DEFAULT_MAX_SOURCE_BYTES,
            thumbnail_size: DEFAULT_THUMBNAIL_SIZE,
            font_path: None,
        }
    }
}

impl SessionConfig {
    /// Parse and validate a JSON config. Missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read a JSON config file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        Self::from_json_str(&json)
    }

    /// Reject values the session cannot operate with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.history_depth == 0 {
            return Err(ConfigError::Invalid("history_depth must be at least 1"));
        }
        if self.max_pixels == 0 {
            return Err(ConfigError::Invalid("max_pixels must be positive"));
        }
        if self.max_source_bytes == 0 {
            return Err(ConfigError::Invalid("max_source_bytes must be positive"));
        }
        if self.thumbnail_size == 0 {
            return Err(ConfigError::Invalid("thumbnail_size must be positive"));
        }
        Ok(())
    }

    /// The debounce window as a duration.
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}
