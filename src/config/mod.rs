//! # Configuration Management Module
//!
//! Two layers of configuration live here:
//!
//! - [`Config`] - the host configuration file (TOML): where the world lives,
//!   where archives go, where schedule settings are persisted, and logging.
//! - [`store`] - the schedule settings themselves (interval and retention
//!   count), read once at startup and rewritten after every change.
//!
//! ## Configuration File Format
//!
//! ```toml
//! [paths]
//! world_dir = "world"
//! backup_dir = "backups"
//! settings_file = "config/tempus_config.json"
//!
//! [logging]
//! level = "info"
//! file = "tempus.log"
//! ```
//!
//! Every section is optional; absent values fall back to the defaults shown.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::fs;

pub mod store;

pub use store::{ConfigStore, JsonConfigStore, MemoryConfigStore, ScheduleConfig};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Live directory tree that gets archived.
    #[serde(default = "default_world_dir")]
    pub world_dir: String,
    /// Directory holding `world_backup_<millis>.tar.gz` files.
    #[serde(default = "default_backup_dir")]
    pub backup_dir: String,
    /// JSON record with `backupInterval` and `maxBackups`.
    #[serde(default = "default_settings_file")]
    pub settings_file: String,
}

fn default_world_dir() -> String {
    "world".to_string()
}

fn default_backup_dir() -> String {
    "backups".to_string()
}

fn default_settings_file() -> String {
    "config/tempus_config.json".to_string()
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            world_dir: default_world_dir(),
            backup_dir: default_backup_dir(),
            settings_file: default_settings_file(),
        }
    }
}

impl PathsConfig {
    pub fn world_dir(&self) -> PathBuf {
        PathBuf::from(&self.world_dir)
    }

    pub fn backup_dir(&self) -> PathBuf {
        PathBuf::from(&self.backup_dir)
    }

    pub fn settings_file(&self) -> PathBuf {
        PathBuf::from(&self.settings_file)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub file: Option<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: Some("tempus.log".to_string()),
        }
    }
}

impl LoggingConfig {
    /// Parsed level; unknown strings fall back to `Info`.
    pub fn level_filter(&self) -> log::LevelFilter {
        self.level.parse().unwrap_or(log::LevelFilter::Info)
    }
}

impl Config {
    /// Load configuration from a file
    pub async fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| anyhow!("Failed to read config file {}: {}", path, e))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow!("Failed to parse config file {}: {}", path, e))?;

        Ok(config)
    }

    /// Load the file if present, otherwise use defaults.
    pub async fn load_or_default(path: &str) -> Result<Self> {
        if fs::try_exists(path).await.unwrap_or(false) {
            Self::load(path).await
        } else {
            Ok(Self::default())
        }
    }

    /// Create a default configuration file
    pub async fn create_default(path: &str) -> Result<()> {
        let config = Config::default();
        let content = toml::to_string_pretty(&config)
            .map_err(|e| anyhow!("Failed to serialize default config: {}", e))?;

        fs::write(path, content)
            .await
            .map_err(|e| anyhow!("Failed to write config file {}: {}", path, e))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_paths() {
        let config = Config::default();
        assert_eq!(config.paths.world_dir, "world");
        assert_eq!(config.paths.backup_dir, "backups");
        assert_eq!(config.paths.settings_file, "config/tempus_config.json");
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: Config = toml::from_str("[paths]\nworld_dir = \"saves/overworld\"\n").unwrap();
        assert_eq!(config.paths.world_dir, "saves/overworld");
        assert_eq!(config.paths.backup_dir, "backups");
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_level_filter_fallback() {
        let logging = LoggingConfig {
            level: "loud".to_string(),
            file: None,
        };
        assert_eq!(logging.level_filter(), log::LevelFilter::Info);

        let logging = LoggingConfig {
            level: "debug".to_string(),
            file: None,
        };
        assert_eq!(logging.level_filter(), log::LevelFilter::Debug);
    }

    #[tokio::test]
    async fn test_create_default_then_load() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("tempus.toml");
        let path = path.to_str().unwrap();
        Config::create_default(path).await.unwrap();
        let loaded = Config::load(path).await.unwrap();
        assert_eq!(loaded.paths.backup_dir, "backups");
        assert_eq!(loaded.logging.file.as_deref(), Some("tempus.log"));
    }
}
