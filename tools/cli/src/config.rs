//! `tandem.json` loading.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use tandem_common::EntityType;
use tandem_sync::SyncConfig;

/// Overrides `access_token` from the config file.
pub const TOKEN_ENV: &str = "TANDEM_ACCESS_TOKEN";

const DEFAULT_ENTITY_TYPES: [&str; 4] = ["task", "project", "goal", "habit"];

/// Which remote backend to use and how to reach it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteSettings {
    /// Name registered in the store registry, e.g. "http".
    pub provider: String,
    /// Backend-specific settings, passed through to the factory.
    #[serde(default)]
    pub config: serde_json::Value,
}

impl Default for RemoteSettings {
    fn default() -> Self {
        Self {
            provider: "memory".to_string(),
            config: serde_json::Value::Null,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    /// Where records and sync state live. Defaults to the platform data
    /// directory.
    pub data_dir: Option<PathBuf>,
    pub remote: RemoteSettings,
    pub access_token: Option<String>,
    pub sync: SyncConfig,
}

impl Default for CliConfig {
    fn default() -> Self {
        let entity_types = DEFAULT_ENTITY_TYPES
            .iter()
            .filter_map(|name| EntityType::new(*name).ok())
            .collect();
        Self {
            data_dir: None,
            remote: RemoteSettings::default(),
            access_token: None,
            sync: SyncConfig::new(entity_types),
        }
    }
}

impl CliConfig {
    /// Default location: `<config dir>/tandem/tandem.json`.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("tandem").join("tandem.json"))
    }

    /// Load from `path`, or from the default location. A missing file
    /// yields the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(path) => Some(path.to_path_buf()),
            None => Self::default_path(),
        };

        let mut config = match path {
            Some(path) if path.exists() => {
                let raw = std::fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read {}", path.display()))?;
                serde_json::from_str(&raw)
                    .with_context(|| format!("Invalid config in {}", path.display()))?
            }
            _ => Self::default(),
        };

        if let Ok(token) = std::env::var(TOKEN_ENV) {
            config.access_token = Some(token);
        }
        if config.sync.entity_types.is_empty() {
            config.sync.entity_types = Self::default().sync.entity_types;
        }
        Ok(config)
    }

    pub fn data_dir(&self) -> Result<PathBuf> {
        match &self.data_dir {
            Some(dir) => Ok(dir.clone()),
            None => dirs::data_dir()
                .map(|dir| dir.join("tandem"))
                .context("No data directory available; set data_dir in tandem.json"),
        }
    }

    pub fn records_dir(&self) -> Result<PathBuf> {
        Ok(self.data_dir()?.join("records"))
    }

    pub fn state_dir(&self) -> Result<PathBuf> {
        Ok(self.data_dir()?.join("sync"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = TempDir::new().unwrap();
        let config = CliConfig::load(Some(&dir.path().join("absent.json"))).unwrap();

        assert_eq!(config.remote.provider, "memory");
        assert_eq!(config.sync.entity_types.len(), 4);
        assert_eq!(config.sync.batch_size, 50);
    }

    #[test]
    fn test_partial_file_is_merged_with_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tandem.json");
        std::fs::write(
            &path,
            r#"{
                "data_dir": "/var/lib/tandem",
                "remote": { "provider": "http", "config": { "base_url": "https://sync.example.com" } },
                "sync": { "batch_size": 20, "sync_mode": { "mode": "periodic", "interval_secs": 600 } }
            }"#,
        )
        .unwrap();

        let config = CliConfig::load(Some(&path)).unwrap();
        assert_eq!(config.remote.provider, "http");
        assert_eq!(config.sync.batch_size, 20);
        assert_eq!(config.sync.max_retries, 3);
        assert_eq!(config.sync.entity_types.len(), 4);
        assert_eq!(
            config.state_dir().unwrap(),
            PathBuf::from("/var/lib/tandem").join("sync")
        );
    }

    #[test]
    fn test_invalid_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tandem.json");
        std::fs::write(&path, "{ not json").unwrap();

        assert!(CliConfig::load(Some(&path)).is_err());
    }
}
