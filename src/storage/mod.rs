//! Persistent storage
//!
//! Bridge configuration lives as JSON under the platform data directory.

pub mod settings;

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while reading or writing stored files
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("No data directory available on this platform")]
    NoDataDir,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Platform data directory for the bridge
///
/// Linux: `~/.local/share/llama-bridge`, macOS:
/// `~/Library/Application Support/ai.nexa.llama-bridge`, Android: the
/// process `$HOME` equivalent.
pub fn get_data_dir() -> Result<PathBuf, StorageError> {
    directories::ProjectDirs::from("ai", "nexa", "llama-bridge")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .ok_or(StorageError::NoDataDir)
}
