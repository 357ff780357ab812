//! Host configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{HostError, HostResult};

fn default_debounce_ms() -> u64 {
    500
}

fn default_compile_timeout_secs() -> u64 {
    30
}

fn default_language_version() -> String {
    "latest".to_string()
}

/// Configuration for the addon host.
#[derive(Debug, Clone, Deserialize)]
pub struct HostConfig {
    /// Debounce window for filesystem change notifications, in milliseconds
    /// (default: 500ms). Notifications within one window coalesce into a
    /// single reload cycle.
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,

    /// Upper bound on a single compile, in seconds (default: 30s). A hung
    /// compiler service fails the cycle instead of wedging the reload
    /// pipeline.
    #[serde(default = "default_compile_timeout_secs")]
    pub compile_timeout_secs: u64,

    /// Language-version tag passed through to the compiler service.
    #[serde(default = "default_language_version")]
    pub language_version: String,

    /// Directory containing addon descriptor files
    /// (default: platform config dir).
    #[serde(default)]
    pub addon_dir: Option<PathBuf>,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
            compile_timeout_secs: default_compile_timeout_secs(),
            language_version: default_language_version(),
            addon_dir: None,
        }
    }
}

impl HostConfig {
    /// Read configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`HostError::Config`] if the file is missing or malformed.
    pub fn load(path: &Path) -> HostResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| HostError::Config {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        toml::from_str(&text).map_err(|e| HostError::Config {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    /// The debounce window as a [`Duration`].
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    /// The compile timeout as a [`Duration`].
    pub fn compile_timeout(&self) -> Duration {
        Duration::from_secs(self.compile_timeout_secs)
    }

    /// Get the addon directory (use provided or default).
    pub fn addon_dir(&self) -> PathBuf {
        self.addon_dir.clone().unwrap_or_else(default_addon_dir)
    }
}

/// Get the default addons directory.
pub fn default_addon_dir() -> PathBuf {
    use directories::ProjectDirs;
    ProjectDirs::from("", "", "addon-host")
        .map(|dirs| dirs.config_dir().join("addons"))
        .unwrap_or_else(|| PathBuf::from("addons"))
}
