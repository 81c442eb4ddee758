use inputlock_common::{tracing, Macro};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::emergency::EmergencyConfig;
use crate::recorder::{RecorderFilters, DEFAULT_MAX_DURATION_MS, DEFAULT_MIN_DELAY_MS};

// Magic number prefixed to the binary macro cache
const CACHE_MAGIC: u32 = 0x4C4F434B; // "LOCK"

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("cache error: {0}")]
    Cache(String),
    #[error("macro '{0}' not found")]
    MacroNotFound(String),
}

/// Daemon configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    pub daemon: DaemonSettings,
    pub devices: DeviceSettings,
    pub emergency: EmergencyConfig,
    pub recorder: RecorderSettings,
    pub player: PlaybackSettings,
    pub triggers: TriggerSettings,
}

/// Daemon-specific settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonSettings {
    pub socket_path: String,
    pub log_level: String,
}

/// Which input devices to grab; empty means auto-detect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSettings {
    pub keyboard_path: Option<String>,
    pub mouse_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecorderSettings {
    pub min_delay_ms: u64,
    pub max_duration_ms: u64,
    pub filters: RecorderFilters,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaybackSettings {
    pub speed: f64,
    /// When false, recorded gaps are ignored and `custom_delay_ms` is used
    /// between events instead.
    pub respect_timing: bool,
    pub custom_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerSettings {
    pub debounce_ms: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            daemon: DaemonSettings {
                socket_path: "/run/inputlock.sock".to_string(),
                log_level: "info".to_string(),
            },
            devices: DeviceSettings {
                keyboard_path: None,
                mouse_path: None,
            },
            emergency: EmergencyConfig::default(),
            recorder: RecorderSettings {
                min_delay_ms: DEFAULT_MIN_DELAY_MS,
                max_duration_ms: DEFAULT_MAX_DURATION_MS,
                filters: RecorderFilters::default(),
            },
            player: PlaybackSettings {
                speed: 1.0,
                respect_timing: true,
                custom_delay_ms: 50,
            },
            triggers: TriggerSettings { debounce_ms: 200 },
        }
    }
}

/// Configuration and macro store for the daemon.
///
/// Settings live in YAML; macros are persisted to YAML with a bincode
/// cache for fast startup. The cache is advisory: a corrupt or missing
/// cache falls back to the YAML file.
pub struct ConfigManager {
    config_path: PathBuf,
    macros_path: PathBuf,
    cache_path: PathBuf,
    bindings_path: PathBuf,
    config: RwLock<DaemonConfig>,
    macros: RwLock<HashMap<String, Macro>>,
}

impl ConfigManager {
    /// Create a manager with the default system paths.
    pub fn new() -> Self {
        Self {
            config_path: PathBuf::from("/etc/inputlockd/config.yaml"),
            macros_path: PathBuf::from("/etc/inputlockd/macros.yaml"),
            cache_path: PathBuf::from("/var/cache/inputlockd/macros.bin"),
            bindings_path: PathBuf::from("/etc/inputlockd/bindings.yaml"),
            config: RwLock::new(DaemonConfig::default()),
            macros: RwLock::new(HashMap::new()),
        }
    }

    /// Create a manager rooted at an arbitrary directory, for tests.
    pub fn with_root(root: &Path) -> Self {
        Self {
            config_path: root.join("config.yaml"),
            macros_path: root.join("macros.yaml"),
            cache_path: root.join("macros.bin"),
            bindings_path: root.join("bindings.yaml"),
            config: RwLock::new(DaemonConfig::default()),
            macros: RwLock::new(HashMap::new()),
        }
    }

    pub fn bindings_path(&self) -> &Path {
        &self.bindings_path
    }

    /// Load settings and macros from disk, writing defaults for anything
    /// missing.
    pub async fn load(&self) -> Result<(), ConfigError> {
        for path in [&self.config_path, &self.macros_path, &self.cache_path] {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).await?;
            }
        }

        if self.config_path.exists() {
            let content = fs::read_to_string(&self.config_path).await?;
            match serde_yaml::from_str(&content) {
                Ok(config) => {
                    *self.config.write().await = config;
                    debug!("Loaded configuration from {}", self.config_path.display());
                }
                Err(e) => {
                    warn!("Failed to parse {}: {}, using defaults", self.config_path.display(), e);
                }
            }
        } else {
            warn!("Configuration file not found, writing defaults");
            self.save_config().await?;
        }

        // Cache first, YAML as the fallback
        if self.cache_path.exists() {
            match self.load_macros_from_cache().await {
                Ok(count) => {
                    debug!("Loaded {} macros from cache", count);
                    return Ok(());
                }
                Err(e) => warn!("Failed to load macro cache: {}", e),
            }
        }

        if self.macros_path.exists() {
            let content = fs::read_to_string(&self.macros_path).await?;
            match serde_yaml::from_str::<HashMap<String, Macro>>(&content) {
                Ok(macros) => {
                    info!("Loaded {} macros from {}", macros.len(), self.macros_path.display());
                    *self.macros.write().await = macros;
                }
                Err(e) => {
                    warn!("Failed to parse {}: {}, starting empty", self.macros_path.display(), e);
                }
            }
        } else {
            self.save_macros().await?;
        }

        Ok(())
    }

    pub async fn settings(&self) -> DaemonConfig {
        self.config.read().await.clone()
    }

    async fn save_config(&self) -> Result<(), ConfigError> {
        let content = serde_yaml::to_string(&*self.config.read().await)?;
        fs::write(&self.config_path, content).await?;
        debug!("Configuration saved to {}", self.config_path.display());
        Ok(())
    }

    async fn load_macros_from_cache(&self) -> Result<usize, ConfigError> {
        let content = fs::read(&self.cache_path).await?;

        if content.len() < 4 {
            return Err(ConfigError::Cache("cache file too short".to_string()));
        }
        let magic = u32::from_le_bytes([content[0], content[1], content[2], content[3]]);
        if magic != CACHE_MAGIC {
            return Err(ConfigError::Cache("invalid cache magic number".to_string()));
        }

        let macros: HashMap<String, Macro> = inputlock_common::deserialize(&content[4..])
            .map_err(|e| ConfigError::Cache(e.to_string()))?;
        let count = macros.len();
        *self.macros.write().await = macros;
        Ok(count)
    }

    /// Persist macros to both the YAML file and the binary cache.
    async fn save_macros(&self) -> Result<(), ConfigError> {
        let macros = self.macros.read().await;

        let mut data = Vec::new();
        data.extend_from_slice(&CACHE_MAGIC.to_le_bytes());
        data.extend_from_slice(&inputlock_common::serialize(&*macros));
        fs::write(&self.cache_path, data).await?;

        let content = serde_yaml::to_string(&*macros)?;
        fs::write(&self.macros_path, content).await?;

        debug!("Saved {} macros to cache and YAML", macros.len());
        Ok(())
    }

    /// Insert or replace a macro by name, assigning an id to new entries.
    /// Returns the stored entry.
    pub async fn save_macro(&self, mut entry: Macro) -> Result<Macro, ConfigError> {
        {
            let mut macros = self.macros.write().await;
            if entry.id == 0 {
                entry.id = macros.values().map(|m| m.id).max().unwrap_or(0) + 1;
            }
            macros.insert(entry.name.clone(), entry.clone());
        }
        self.save_macros().await?;
        info!("Saved macro '{}' ({} events)", entry.name, entry.events.len());
        Ok(entry)
    }

    pub async fn get_macro(&self, name: &str) -> Option<Macro> {
        self.macros.read().await.get(name).cloned()
    }

    /// All macros sorted by name.
    pub async fn list_macros(&self) -> Vec<Macro> {
        let mut entries: Vec<Macro> = self.macros.read().await.values().cloned().collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        entries
    }

    pub async fn macros_count(&self) -> usize {
        self.macros.read().await.len()
    }

    /// Remove a macro. Returns whether it existed.
    pub async fn delete_macro(&self, name: &str) -> Result<bool, ConfigError> {
        let existed = self.macros.write().await.remove(name).is_some();
        if existed {
            self.save_macros().await?;
            info!("Deleted macro '{}'", name);
        }
        Ok(existed)
    }

    /// Bump run statistics after a playback session.
    pub async fn update_macro_stats(&self, name: &str) -> Result<(), ConfigError> {
        {
            let mut macros = self.macros.write().await;
            let entry = macros
                .get_mut(name)
                .ok_or_else(|| ConfigError::MacroNotFound(name.to_string()))?;
            entry.run_count += 1;
            entry.last_run_unix_secs = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .ok()
                .map(|d| d.as_secs());
        }
        self.save_macros().await
    }
}

impl Default for ConfigManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use inputlock_common::{MacroAction, MacroEvent};
    use tempfile::TempDir;

    fn tap_macro(name: &str) -> Macro {
        Macro::new(
            name,
            vec![
                MacroEvent { offset_ms: 0, action: MacroAction::KeyDown(30) },
                MacroEvent { offset_ms: 50, action: MacroAction::KeyUp(30) },
            ],
        )
    }

    #[tokio::test]
    async fn test_load_writes_defaults() {
        let dir = TempDir::new().unwrap();
        let manager = ConfigManager::with_root(dir.path());
        manager.load().await.unwrap();

        assert!(dir.path().join("config.yaml").exists());
        let settings = manager.settings().await;
        assert_eq!(settings.triggers.debounce_ms, 200);
        assert_eq!(settings.player.speed, 1.0);
    }

    #[tokio::test]
    async fn test_macro_persistence_roundtrip() {
        let dir = TempDir::new().unwrap();
        let manager = ConfigManager::with_root(dir.path());
        manager.load().await.unwrap();

        let stored = manager.save_macro(tap_macro("tap")).await.unwrap();
        assert_eq!(stored.id, 1);

        // A fresh manager over the same root reads it back from the cache
        let reloaded = ConfigManager::with_root(dir.path());
        reloaded.load().await.unwrap();
        let entry = reloaded.get_macro("tap").await.unwrap();
        assert_eq!(entry.id, 1);
        assert_eq!(entry.events.len(), 2);
    }

    #[tokio::test]
    async fn test_corrupt_cache_falls_back_to_yaml() {
        let dir = TempDir::new().unwrap();
        let manager = ConfigManager::with_root(dir.path());
        manager.load().await.unwrap();
        manager.save_macro(tap_macro("tap")).await.unwrap();

        std::fs::write(dir.path().join("macros.bin"), b"garbage").unwrap();

        let reloaded = ConfigManager::with_root(dir.path());
        reloaded.load().await.unwrap();
        assert!(reloaded.get_macro("tap").await.is_some());
    }

    #[tokio::test]
    async fn test_ids_are_unique_and_names_replace() {
        let dir = TempDir::new().unwrap();
        let manager = ConfigManager::with_root(dir.path());
        manager.load().await.unwrap();

        let first = manager.save_macro(tap_macro("a")).await.unwrap();
        let second = manager.save_macro(tap_macro("b")).await.unwrap();
        assert_ne!(first.id, second.id);

        // Re-saving under the same name keeps one entry
        let mut replacement = tap_macro("a");
        replacement.id = first.id;
        manager.save_macro(replacement).await.unwrap();
        assert_eq!(manager.macros_count().await, 2);
    }

    #[tokio::test]
    async fn test_delete_and_stats() {
        let dir = TempDir::new().unwrap();
        let manager = ConfigManager::with_root(dir.path());
        manager.load().await.unwrap();
        manager.save_macro(tap_macro("tap")).await.unwrap();

        manager.update_macro_stats("tap").await.unwrap();
        let entry = manager.get_macro("tap").await.unwrap();
        assert_eq!(entry.run_count, 1);
        assert!(entry.last_run_unix_secs.is_some());

        assert!(manager.delete_macro("tap").await.unwrap());
        assert!(!manager.delete_macro("tap").await.unwrap());
        assert!(manager.get_macro("tap").await.is_none());
    }
}
