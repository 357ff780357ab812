//! Addon descriptor: the metadata record read once at script construction.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{HostError, HostResult};

/// Immutable addon metadata, read from a TOML descriptor file.
///
/// Owned by the lifecycle manager for the lifetime of its script and
/// read-only after construction.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Descriptor {
    /// Title of the addon. Should be nice and pretty.
    pub title: String,
    /// Name of the addon. Much less pretty, used to reference the addon
    /// from commands and to name its execution context.
    pub name: String,
    /// Authors of the addon, in credit order.
    pub authors: Vec<String>,
    /// Website of the addon.
    #[serde(default)]
    pub website: String,
    /// License of the addon (e.g. GPLv3, MIT, etc.).
    #[serde(default)]
    pub license: String,
    /// Short description of the addon.
    #[serde(default)]
    pub description: String,
    /// Directory containing the addon's sources.
    pub source_directory: PathBuf,
    /// Assets this addon contains.
    #[serde(default)]
    pub assets: Vec<PathBuf>,
    /// Names of addons this addon depends on.
    #[serde(default)]
    pub dependencies: Vec<String>,
}

impl Descriptor {
    /// Read and parse a descriptor file.
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
}
