//! Kernel configuration.
//!
//! Loaded from a JSON file, from environment variables, or both (file first,
//! environment on top).

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{KernelError, Result};

/// Paths of the external tools used by the CLI transcoder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolPaths {
    /// General-purpose converter.
    pub ffmpeg: PathBuf,
    /// Native-codec decoder.
    pub vgmstream: PathBuf,
    /// Native-codec encoder.
    pub wem_encoder: PathBuf,
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self {
            ffmpeg: PathBuf::from("ffmpeg"),
            vgmstream: PathBuf::from("vgmstream-cli"),
            wem_encoder: PathBuf::from("wwise-encoder"),
        }
    }
}

/// Session-wide configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    /// Root of every extraction, staging and export directory.
    pub temp_dir: PathBuf,
    /// Extension of the native audio codec.
    pub native_extension: String,
    /// Extension previews are rendered to.
    pub preview_extension: String,
    /// Extensions accepted by audio import.
    pub import_extensions: Vec<String>,
    /// Capacity of the preview cache.
    pub preview_cache_entries: usize,
    /// External tools.
    pub tools: ToolPaths,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            temp_dir: default_temp_dir(),
            native_extension: "wem".to_string(),
            preview_extension: "wav".to_string(),
            import_extensions: ["wem", "wav", "ogg", "flac", "mp3", "aac"]
                .iter()
                .map(|ext| ext.to_string())
                .collect(),
            preview_cache_entries: 256,
            tools: ToolPaths::default(),
        }
    }
}

fn default_temp_dir() -> PathBuf {
    std::env::temp_dir().join("bank-patch-kernel")
}

impl KernelConfig {
    /// Configuration rooted at a specific temp directory.
    pub fn with_temp_dir(temp_dir: impl Into<PathBuf>) -> Self {
        Self {
            temp_dir: temp_dir.into(),
            ..Self::default()
        }
    }

    /// Read a JSON configuration file. Missing fields take their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| KernelError::Config(format!("{}: {e}", path.display())))?;
        let config: Self = serde_json::from_str(&raw)
            .map_err(|e| KernelError::Config(format!("{}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Create configuration from environment variables.
    ///
    /// Reads `BANK_KERNEL_TEMP_DIR`, `FFMPEG_PATH`, `VGMSTREAM_PATH` and
    /// `WEM_ENCODER_PATH`. Falls back to defaults for anything unset.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if std::env::var_os("BANK_KERNEL_TEMP_DIR").is_none() {
            tracing::warn!(
                temp_dir = %config.temp_dir.display(),
                "BANK_KERNEL_TEMP_DIR not set, using system temp directory"
            );
        }
        config.apply_env();
        config
    }

    /// Apply environment overrides on top of this configuration.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from a key lookup.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|value| !value.is_empty());

        if let Some(dir) = non_empty("BANK_KERNEL_TEMP_DIR") {
            self.temp_dir = PathBuf::from(dir);
        }
        if let Some(path) = non_empty("FFMPEG_PATH") {
            self.tools.ffmpeg = PathBuf::from(path);
        }
        if let Some(path) = non_empty("VGMSTREAM_PATH") {
            self.tools.vgmstream = PathBuf::from(path);
        }
        if let Some(path) = non_empty("WEM_ENCODER_PATH") {
            self.tools.wem_encoder = PathBuf::from(path);
        }
    }

    /// Check invariants the kernel relies on.
    pub fn validate(&self) -> Result<()> {
        if self.native_extension.is_empty() || self.preview_extension.is_empty() {
            return Err(KernelError::Config("extensions must not be empty".into()));
        }
        if self.import_extensions.iter().any(|ext| ext.is_empty()) {
            return Err(KernelError::Config("import extensions must not be empty".into()));
        }
        if self.preview_cache_entries == 0 {
            return Err(KernelError::Config("preview_cache_entries must be at least 1".into()));
        }
        Ok(())
    }

    /// Whether a file can be imported, judged by its extension.
    pub fn accepts_import(&self, path: &Path) -> bool {
        extension_of(path)
            .map(|ext| self.import_extensions.iter().any(|allowed| *allowed == ext))
            .unwrap_or(false)
    }
}

/// Lowercased extension of a path.
pub(crate) fn extension_of(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
}
