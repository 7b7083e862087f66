//! Configuration-directory helpers for outtake.
//!
//! Everything outtake keeps outside the Maildir itself (the Google OAuth
//! client credentials) lives in a small per-user config directory. Call
//! [`init`] once at startup to make sure it exists.

use anyhow::{Context, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};

/// Initialize the outtake config directory, creating it if needed.
pub fn init() -> Result<PathBuf> {
    let dir = config_dir().context("could not determine config directory")?;
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create config directory {}", dir.display()))?;
    Ok(dir)
}

/// The outtake config directory (`~/.config/outtake/` on Linux).
pub fn config_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("outtake"))
}

/// Path of a file within the config directory.
pub fn config_path(filename: &str) -> Option<PathBuf> {
    config_dir().map(|p| p.join(filename))
}

/// Whether a file exists in the config directory.
pub fn config_exists(filename: &str) -> bool {
    config_path(filename).is_some_and(|p| p.exists())
}

/// Load and parse a JSON file from the config directory.
pub fn load_json<T: DeserializeOwned>(filename: &str) -> Result<T> {
    let path = config_path(filename).context("could not determine config directory")?;
    load_json_file(&path)
}

/// Load and parse a JSON file from an arbitrary path.
pub fn load_json_file<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("failed to parse {}", path.display()))
}

/// Save a value as pretty-printed JSON into the config directory.
pub fn save_json<T: Serialize>(filename: &str, value: &T) -> Result<()> {
    let path = init()?.join(filename);
    let content = serde_json::to_string_pretty(value)?;
    std::fs::write(&path, content)
        .with_context(|| format!("failed to write {}", path.display()))
}
