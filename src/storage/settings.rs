//! Configuration storage
//!
//! Loads and saves [`BridgeConfig`] as JSON. The file is
//! `$LLAMA_BRIDGE_CONFIG` when set, `<data dir>/config.json` otherwise.

use std::fs;
use std::path::{Path, PathBuf};

use crate::storage::{get_data_dir, StorageError};
use crate::types::config::BridgeConfig;

/// Environment variable overriding the config file location
pub const CONFIG_ENV: &str = "LLAMA_BRIDGE_CONFIG";

/// Get the config file path
pub fn get_config_path() -> Result<PathBuf, StorageError> {
    match std::env::var_os(CONFIG_ENV) {
        Some(path) if !path.is_empty() => Ok(PathBuf::from(path)),
        _ => Ok(get_data_dir()?.join("config.json")),
    }
}

/// Load configuration from disk
///
/// Returns defaults if the file doesn't exist or is corrupted
pub fn load_config() -> BridgeConfig {
    let loaded = get_config_path().and_then(|path| load_config_from(&path));
    match loaded {
        Ok(config) => config,
        Err(e) => {
            tracing::warn!("Failed to load config, using defaults: {}", e);
            BridgeConfig::default()
        }
    }
}

/// Load and validate the configuration at `path`; a missing file yields defaults
pub fn load_config_from(path: &Path) -> Result<BridgeConfig, StorageError> {
    if !path.exists() {
        tracing::debug!("Config file {:?} not found, using defaults", path);
        return Ok(BridgeConfig::default());
    }

    let json = fs::read_to_string(path)?;
    let mut config: BridgeConfig = serde_json::from_str(&json)?;
    config.validate();

    tracing::debug!("Loaded config from {:?}", path);
    Ok(config)
}

/// Save configuration to the default location
pub fn save_config(config: &BridgeConfig) -> Result<(), StorageError> {
    save_config_to(&get_config_path()?, config)
}

pub fn save_config_to(path: &Path, config: &BridgeConfig) -> Result<(), StorageError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let json = serde_json::to_string_pretty(config)?;
    fs::write(path, json)?;

    tracing::debug!("Saved config to {:?}", path);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config_from(&dir.path().join("absent.json")).unwrap();
        assert_eq!(config, BridgeConfig::default());
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");

        let mut config = BridgeConfig::default();
        config.n_ctx = 4096;
        config.sampling.temperature = 0.2;
        config.limits.stop_words = vec!["</s>".to_string()];
        save_config_to(&path, &config).unwrap();

        let loaded = load_config_from(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_partial_file_is_validated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{ "n_ctx": 16, "sampling": { "top_p": 3.0 } }"#).unwrap();

        let config = load_config_from(&path).unwrap();
        assert_eq!(config.n_ctx, 256);
        assert_eq!(config.sampling.top_p, 1.0);
        assert_eq!(config.n_batch, 256);
    }

    #[test]
    fn test_corrupted_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "not json").unwrap();
        assert!(matches!(
            load_config_from(&path),
            Err(StorageError::Json(_))
        ));
    }
}
