//! Persisted schedule settings.
//!
//! The scheduler reads a [`ScheduleConfig`] once at startup and writes it back
//! after every successful mutation. Persistence goes through the
//! [`ConfigStore`] trait so an embedding host can supply its own settings
//! backend; [`JsonConfigStore`] is the file-backed default.
//!
//! On-disk record:
//!
//! ```json
//! { "backupInterval": 300000, "maxBackups": 5 }
//! ```

use serde::{Deserialize, Deserializer, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::errors::{BackupError, Result};

/// Default period between scheduled backups (5 minutes).
pub const DEFAULT_INTERVAL_MILLIS: u64 = 5 * 60 * 1000;
/// Default number of archives kept on disk.
pub const DEFAULT_MAX_BACKUPS: u32 = 5;

fn default_interval_millis() -> u64 {
    DEFAULT_INTERVAL_MILLIS
}

fn default_max_backups() -> u32 {
    DEFAULT_MAX_BACKUPS
}

// Negative or out-of-range numbers load as 0 so `normalized` replaces them.
fn lenient_u64<'de, D: Deserializer<'de>>(de: D) -> std::result::Result<u64, D::Error> {
    let raw = i64::deserialize(de)?;
    Ok(u64::try_from(raw).unwrap_or(0))
}

fn lenient_u32<'de, D: Deserializer<'de>>(de: D) -> std::result::Result<u32, D::Error> {
    let raw = i64::deserialize(de)?;
    Ok(u32::try_from(raw).unwrap_or(0))
}

/// Interval and retention count. Both values are always positive once a
/// config has passed through [`ScheduleConfig::normalized`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleConfig {
    #[serde(
        rename = "backupInterval",
        default = "default_interval_millis",
        deserialize_with = "lenient_u64"
    )]
    pub interval_millis: u64,
    #[serde(
        rename = "maxBackups",
        default = "default_max_backups",
        deserialize_with = "lenient_u32"
    )]
    pub max_backups: u32,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            interval_millis: DEFAULT_INTERVAL_MILLIS,
            max_backups: DEFAULT_MAX_BACKUPS,
        }
    }
}

impl ScheduleConfig {
    /// Replace any zero field with its default, warning about each one.
    /// Negative or out-of-range stored values arrive here as zero.
    pub fn normalized(mut self) -> Self {
        if self.interval_millis == 0 {
            log::warn!(
                "Stored backupInterval is not positive; using default {}ms",
                DEFAULT_INTERVAL_MILLIS
            );
            self.interval_millis = DEFAULT_INTERVAL_MILLIS;
        }
        if self.max_backups == 0 {
            log::warn!(
                "Stored maxBackups is not positive; using default {}",
                DEFAULT_MAX_BACKUPS
            );
            self.max_backups = DEFAULT_MAX_BACKUPS;
        }
        self
    }
}

/// Load/save contract for schedule settings.
pub trait ConfigStore: Send + Sync {
    /// `Ok(None)` means no record has ever been written.
    fn load(&self) -> Result<Option<ScheduleConfig>>;
    fn save(&self, config: &ScheduleConfig) -> Result<()>;
}

/// Settings persisted as a small JSON document.
#[derive(Debug, Clone)]
pub struct JsonConfigStore {
    path: PathBuf,
}

impl JsonConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConfigStore for JsonConfigStore {
    fn load(&self) -> Result<Option<ScheduleConfig>> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(BackupError::ConfigIo(format!(
                    "failed to read {}: {}",
                    self.path.display(),
                    e
                )))
            }
        };
        let config: ScheduleConfig = serde_json::from_str(&contents)?;
        Ok(Some(config))
    }

    fn save(&self, config: &ScheduleConfig) -> Result<()> {
        let contents = serde_json::to_string_pretty(config)?;
        write_atomically(&self.path, contents.as_bytes()).map_err(|e| {
            BackupError::ConfigIo(format!("failed to write {}: {}", self.path.display(), e))
        })
    }
}

fn write_atomically(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, contents)?;
    fs::rename(&tmp, path)
}

/// In-process store for embedding hosts that manage settings themselves.
#[derive(Debug, Default)]
pub struct MemoryConfigStore {
    record: Mutex<Option<ScheduleConfig>>,
    fail_saves: bool,
}

impl MemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_record(config: ScheduleConfig) -> Self {
        Self {
            record: Mutex::new(Some(config)),
            fail_saves: false,
        }
    }

    /// A store whose `save` always fails, keeping whatever it was built with.
    pub fn failing(initial: Option<ScheduleConfig>) -> Self {
        Self {
            record: Mutex::new(initial),
            fail_saves: true,
        }
    }

    pub fn record(&self) -> Option<ScheduleConfig> {
        self.record.lock().map(|r| *r).unwrap_or(None)
    }
}

impl ConfigStore for MemoryConfigStore {
    fn load(&self) -> Result<Option<ScheduleConfig>> {
        self.record
            .lock()
            .map(|r| *r)
            .map_err(|_| BackupError::ConfigIo("settings mutex poisoned".to_string()))
    }

    fn save(&self, config: &ScheduleConfig) -> Result<()> {
        if self.fail_saves {
            return Err(BackupError::ConfigIo("settings store is read-only".to_string()));
        }
        let mut guard = self
            .record
            .lock()
            .map_err(|_| BackupError::ConfigIo("settings mutex poisoned".to_string()))?;
        *guard = Some(*config);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_file_loads_as_none() {
        let temp = TempDir::new().unwrap();
        let store = JsonConfigStore::new(temp.path().join("config/tempus_config.json"));
        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn save_creates_parent_and_uses_camel_case_keys() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config/tempus_config.json");
        let store = JsonConfigStore::new(&path);
        store
            .save(&ScheduleConfig {
                interval_millis: 3_600_000,
                max_backups: 9,
            })
            .unwrap();

        let raw = fs::read_to_string(&path).unwrap();
        assert!(raw.contains("\"backupInterval\": 3600000"));
        assert!(raw.contains("\"maxBackups\": 9"));
        assert!(!path.with_extension("json.tmp").exists());

        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded.interval_millis, 3_600_000);
        assert_eq!(loaded.max_backups, 9);
    }

    #[test]
    fn absent_fields_take_defaults() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("settings.json");
        fs::write(&path, r#"{"maxBackups": 2}"#).unwrap();
        let loaded = JsonConfigStore::new(&path).load().unwrap().unwrap();
        assert_eq!(loaded.interval_millis, DEFAULT_INTERVAL_MILLIS);
        assert_eq!(loaded.max_backups, 2);
    }

    #[test]
    fn corrupt_record_is_an_error() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("settings.json");
        fs::write(&path, "not json").unwrap();
        assert!(matches!(
            JsonConfigStore::new(&path).load(),
            Err(BackupError::Serialization(_))
        ));
    }

    #[test]
    fn normalized_replaces_zero_values() {
        let cfg = ScheduleConfig {
            interval_millis: 0,
            max_backups: 0,
        }
        .normalized();
        assert_eq!(cfg, ScheduleConfig::default());
    }

    #[test]
    fn negative_values_fall_back_per_field() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("settings.json");
        let store = JsonConfigStore::new(&path);

        fs::write(&path, r#"{"backupInterval": -1, "maxBackups": 9}"#).unwrap();
        let loaded = store.load().unwrap().unwrap().normalized();
        assert_eq!(loaded.interval_millis, DEFAULT_INTERVAL_MILLIS);
        assert_eq!(loaded.max_backups, 9);

        fs::write(&path, r#"{"backupInterval": 60000, "maxBackups": -4}"#).unwrap();
        let loaded = store.load().unwrap().unwrap().normalized();
        assert_eq!(loaded.interval_millis, 60_000);
        assert_eq!(loaded.max_backups, DEFAULT_MAX_BACKUPS);

        fs::write(&path, r#"{"backupInterval": 1000, "maxBackups": 4294967296}"#).unwrap();
        let loaded = store.load().unwrap().unwrap().normalized();
        assert_eq!(loaded.max_backups, DEFAULT_MAX_BACKUPS);
    }

    #[test]
    fn failing_memory_store_keeps_initial_record() {
        let store = MemoryConfigStore::failing(None);
        assert!(store.save(&ScheduleConfig::default()).is_err());
        assert!(store.record().is_none());
    }
}
