//! Shared config-file helpers
//!
//! The sync core and any binaries built on it read their JSON config
//! files (credentials, engine settings) from one per-user directory,
//! ~/.config/fieldsync/. This crate answers where that directory is
//! and loads files out of it. Nothing here writes: config files are
//! provisioned by the operator, not by the application.

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use std::path::PathBuf;

/// The per-user config directory (~/.config/fieldsync/ on Linux).
///
/// `None` when the platform reports no config location at all.
pub fn config_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("fieldsync"))
}

/// Full path of a named file inside the config directory
pub fn config_path(filename: &str) -> Option<PathBuf> {
    config_dir().map(|p| p.join(filename))
}

/// Whether the named config file is present
pub fn config_exists(filename: &str) -> bool {
    config_path(filename).is_some_and(|p| p.exists())
}

/// Read and deserialize a JSON file from the config directory.
///
/// An unreadable file and one that fails to parse produce distinct
/// errors, each naming the offending path.
pub fn load_json<T: DeserializeOwned>(filename: &str) -> Result<T> {
    let path = config_path(filename).context("Could not determine config directory")?;
    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}
