//! # Sync Configuration
//!
//! Configuration management for the sync service.
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     WARD_SYNC_MODE=manual                                              │
//! │     WARD_DEVICE_ID=abc-123                                             │
//! │     WARD_DB_PATH=/var/lib/ward/ward.db                                 │
//! │     WARD_MAX_RETRIES=8                                                 │
//! │     WARD_FLUSH_INTERVAL_SECS=10                                        │
//! │                                                                         │
//! │  2. TOML Config File                                                   │
//! │     ~/.config/ward-sync/sync.toml (Linux)                              │
//! │     ~/Library/Application Support/org.ward.ward-sync/sync.toml (macOS) │
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! │     SyncMode::Auto, auto-generated device_id                           │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! # sync.toml
//! [device]
//! id = "550e8400-e29b-41d4-a716-446655440000"
//! name = "Ward 3 tablet"
//!
//! [sync]
//! mode = "auto"            # auto | manual | offline
//! flush_interval_secs = 30
//! max_retries = 5
//!
//! [storage]
//! database_path = "/var/lib/ward/ward.db"
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{SyncError, SyncResult};
use ward_core::{DEFAULT_MAX_RETRIES, OUTBOX_RETENTION_HOURS};

// =============================================================================
// Sync Mode
// =============================================================================

/// How the sync service drives delivery.
///
/// ```text
/// AUTO (Default)   background loop: startup flush, interval flush,
///                  flush on reconnect, periodic cleanup
/// MANUAL           no background loop; flushes only when asked
/// OFFLINE          never contacts the remote store; outbox only grows
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    #[default]
    Auto,
    Manual,
    Offline,
}

impl SyncMode {
    /// Returns true if the remote store may be contacted.
    pub fn is_sync_enabled(&self) -> bool {
        !matches!(self, SyncMode::Offline)
    }

    /// Returns true if the background loop should run.
    pub fn runs_background_loop(&self) -> bool {
        matches!(self, SyncMode::Auto)
    }
}

impl std::fmt::Display for SyncMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncMode::Auto => write!(f, "auto"),
            SyncMode::Manual => write!(f, "manual"),
            SyncMode::Offline => write!(f, "offline"),
        }
    }
}

impl std::str::FromStr for SyncMode {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "auto" => Ok(SyncMode::Auto),
            "manual" => Ok(SyncMode::Manual),
            "offline" | "disabled" => Ok(SyncMode::Offline),
            other => Err(SyncError::InvalidConfig(format!(
                "Unknown sync mode: '{}'. Valid options: auto, manual, offline",
                other
            ))),
        }
    }
}

// =============================================================================
// Device Configuration
// =============================================================================

/// Configuration for this device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Unique device identifier (UUID v4), auto-generated if absent.
    /// Sent as the origin of every remote write.
    #[serde(default = "default_device_id")]
    pub id: String,

    /// Human-readable device name.
    #[serde(default = "default_device_name")]
    pub name: String,
}

fn default_device_id() -> String {
    Uuid::new_v4().to_string()
}

fn default_device_name() -> String {
    "Ward Device".to_string()
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            id: default_device_id(),
            name: default_device_name(),
        }
    }
}

// =============================================================================
// Sync Settings
// =============================================================================

/// Sync behavior settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSettings {
    #[serde(default)]
    pub mode: SyncMode,

    /// Interval between background outbox flushes (seconds).
    #[serde(default = "default_flush_interval")]
    pub flush_interval_secs: u64,

    /// Delay before the first flush after startup (milliseconds).
    #[serde(default = "default_startup_delay")]
    pub startup_delay_ms: u64,

    /// Interval between outbox cleanups (seconds).
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,

    /// Failed deliveries after which an entry is demoted to failed_fatal.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// How long failed_fatal entries are kept (hours).
    #[serde(default = "default_retention_hours")]
    pub retention_hours: i64,

    /// Capacity of the immediate-push queue.
    #[serde(default = "default_push_queue_capacity")]
    pub push_queue_capacity: usize,

    /// Initial backoff when re-establishing a subscription (milliseconds).
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    /// Maximum backoff when re-establishing a subscription (seconds).
    #[serde(default = "default_max_backoff")]
    pub max_backoff_secs: u64,
}

fn default_flush_interval() -> u64 {
    30
}
fn default_startup_delay() -> u64 {
    2000
}
fn default_cleanup_interval() -> u64 {
    3600
}
fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}
fn default_retention_hours() -> i64 {
    OUTBOX_RETENTION_HOURS
}
fn default_push_queue_capacity() -> usize {
    64
}
fn default_initial_backoff() -> u64 {
    500
}
fn default_max_backoff() -> u64 {
    60
}

impl Default for SyncSettings {
    fn default() -> Self {
        SyncSettings {
            mode: SyncMode::default(),
            flush_interval_secs: default_flush_interval(),
            startup_delay_ms: default_startup_delay(),
            cleanup_interval_secs: default_cleanup_interval(),
            max_retries: default_max_retries(),
            retention_hours: default_retention_hours(),
            push_queue_capacity: default_push_queue_capacity(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_secs: default_max_backoff(),
        }
    }
}

// =============================================================================
// Storage Settings
// =============================================================================

/// Local storage settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageSettings {
    /// SQLite database file. Defaults to the platform data directory.
    #[serde(default)]
    pub database_path: Option<PathBuf>,
}

// =============================================================================
// Main Sync Configuration
// =============================================================================

/// Complete sync configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default)]
    pub device: DeviceConfig,

    #[serde(default)]
    pub sync: SyncSettings,

    #[serde(default)]
    pub storage: StorageSettings,
}

impl SyncConfig {
    /// Creates a new config with defaults and a generated device ID.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (sync.toml)
    /// 3. Environment variables
    pub fn load(config_path: Option<PathBuf>) -> SyncResult<Self> {
        let mut config = Self::default();

        if let Some(path) = config_path.or_else(Self::default_config_path) {
            if path.exists() {
                info!(?path, "Loading sync config from file");
                let contents = std::fs::read_to_string(&path)?;
                config = toml::from_str(&contents)?;
            } else {
                debug!(?path, "Config file not found, using defaults");
            }
        }

        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;

        Ok(config)
    }

    /// Loads config or returns default if load fails.
    pub fn load_or_default(config_path: Option<PathBuf>) -> Self {
        Self::load(config_path).unwrap_or_else(|e| {
            warn!("Failed to load sync config: {}. Using defaults.", e);
            Self::default()
        })
    }

    /// Saves configuration to file.
    pub fn save(&self, config_path: Option<PathBuf>) -> SyncResult<()> {
        let path = config_path
            .or_else(Self::default_config_path)
            .ok_or_else(|| SyncError::ConfigSaveFailed("No config path available".into()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(&path, contents)?;

        info!(?path, "Sync config saved");
        Ok(())
    }

    /// Validates the configuration.
    pub fn validate(&self) -> SyncResult<()> {
        if self.device.id.trim().is_empty() {
            return Err(SyncError::MissingDeviceId);
        }

        if self.sync.max_retries == 0 {
            return Err(SyncError::InvalidConfig(
                "max_retries must be greater than 0".into(),
            ));
        }

        if self.sync.push_queue_capacity == 0 {
            return Err(SyncError::InvalidConfig(
                "push_queue_capacity must be greater than 0".into(),
            ));
        }

        if self.sync.flush_interval_secs == 0 || self.sync.cleanup_interval_secs == 0 {
            return Err(SyncError::InvalidConfig(
                "flush and cleanup intervals must be greater than 0".into(),
            ));
        }

        if self.sync.retention_hours < 0 {
            return Err(SyncError::InvalidConfig(
                "retention_hours must not be negative".into(),
            ));
        }

        Ok(())
    }

    /// Applies `WARD_*` overrides from the given lookup.
    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(id) = lookup("WARD_DEVICE_ID") {
            debug!(device_id = %id, "Overriding device ID from environment");
            self.device.id = id;
        }

        if let Some(mode) = lookup("WARD_SYNC_MODE") {
            match mode.parse() {
                Ok(parsed) => {
                    debug!(mode = %mode, "Overriding sync mode from environment");
                    self.sync.mode = parsed;
                }
                Err(_) => warn!(mode = %mode, "Unknown sync mode in environment"),
            }
        }

        if let Some(path) = lookup("WARD_DB_PATH") {
            debug!(path = %path, "Overriding database path from environment");
            self.storage.database_path = Some(PathBuf::from(path));
        }

        if let Some(retries) = lookup("WARD_MAX_RETRIES") {
            match retries.parse::<u32>() {
                Ok(n) => self.sync.max_retries = n,
                Err(_) => warn!(value = %retries, "Invalid WARD_MAX_RETRIES"),
            }
        }

        if let Some(secs) = lookup("WARD_FLUSH_INTERVAL_SECS") {
            match secs.parse::<u64>() {
                Ok(n) => self.sync.flush_interval_secs = n,
                Err(_) => warn!(value = %secs, "Invalid WARD_FLUSH_INTERVAL_SECS"),
            }
        }
    }

    fn project_dirs() -> Option<directories::ProjectDirs> {
        directories::ProjectDirs::from("org", "ward", "ward-sync")
    }

    /// Returns the default config file path.
    fn default_config_path() -> Option<PathBuf> {
        Self::project_dirs().map(|dirs| dirs.config_dir().join("sync.toml"))
    }

    // =========================================================================
    // Convenience Methods
    // =========================================================================

    pub fn device_id(&self) -> &str {
        &self.device.id
    }

    pub fn mode(&self) -> SyncMode {
        self.sync.mode
    }

    pub fn is_sync_enabled(&self) -> bool {
        self.sync.mode.is_sync_enabled()
    }

    /// Returns the configured database path, or the platform default.
    pub fn database_path(&self) -> SyncResult<PathBuf> {
        if let Some(path) = &self.storage.database_path {
            return Ok(path.clone());
        }
        Self::project_dirs()
            .map(|dirs| dirs.data_dir().join("ward.db"))
            .ok_or_else(|| SyncError::InvalidConfig("No data directory available".into()))
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.sync.flush_interval_secs)
    }

    pub fn startup_delay(&self) -> Duration {
        Duration::from_millis(self.sync.startup_delay_ms)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.sync.cleanup_interval_secs)
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::hours(self.sync.retention_hours)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_sync_mode_parsing() {
        assert_eq!("auto".parse::<SyncMode>().unwrap(), SyncMode::Auto);
        assert_eq!("Manual".parse::<SyncMode>().unwrap(), SyncMode::Manual);
        assert_eq!("disabled".parse::<SyncMode>().unwrap(), SyncMode::Offline);
        assert!("primary".parse::<SyncMode>().is_err());
    }

    #[test]
    fn test_default_config() {
        let config = SyncConfig::default();
        assert!(!config.device.id.is_empty());
        assert_eq!(config.sync.mode, SyncMode::Auto);
        assert_eq!(config.sync.max_retries, DEFAULT_MAX_RETRIES);
        assert_eq!(config.sync.retention_hours, 24);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = SyncConfig::default();

        config.device.id = String::new();
        assert!(matches!(config.validate(), Err(SyncError::MissingDeviceId)));

        config.device.id = "tablet-1".to_string();
        config.sync.max_retries = 0;
        assert!(config.validate().is_err());

        config.sync.max_retries = 3;
        config.sync.push_queue_capacity = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_overrides() {
        let env: HashMap<&str, &str> = [
            ("WARD_DEVICE_ID", "tablet-7"),
            ("WARD_SYNC_MODE", "manual"),
            ("WARD_DB_PATH", "/tmp/ward-test.db"),
            ("WARD_MAX_RETRIES", "9"),
            ("WARD_FLUSH_INTERVAL_SECS", "not-a-number"),
        ]
        .into_iter()
        .collect();

        let mut config = SyncConfig::default();
        config.apply_overrides(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.device_id(), "tablet-7");
        assert_eq!(config.mode(), SyncMode::Manual);
        assert_eq!(config.database_path().unwrap(), PathBuf::from("/tmp/ward-test.db"));
        assert_eq!(config.sync.max_retries, 9);
        // invalid value keeps the default
        assert_eq!(config.sync.flush_interval_secs, 30);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: SyncConfig = toml::from_str(
            r#"
            [device]
            id = "tablet-2"

            [sync]
            mode = "offline"
            "#,
        )
        .unwrap();

        assert_eq!(config.device.id, "tablet-2");
        assert_eq!(config.device.name, "Ward Device");
        assert_eq!(config.mode(), SyncMode::Offline);
        assert!(!config.is_sync_enabled());
        assert_eq!(config.sync.push_queue_capacity, 64);
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sync.toml");

        let mut config = SyncConfig::default();
        config.sync.mode = SyncMode::Manual;
        config.save(Some(path.clone())).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("[device]"));
        assert!(contents.contains("[sync]"));

        let loaded: SyncConfig = toml::from_str(&contents).unwrap();
        assert_eq!(loaded.device.id, config.device.id);
        assert_eq!(loaded.mode(), SyncMode::Manual);
    }
}
