//! Sync configuration
//!
//! ## Configuration Sources
//!
//! 1. Environment variables (highest priority): `VAULTSYNC_WORKERS`,
//!    `VAULTSYNC_MAX_ATTEMPTS`
//! 2. TOML config file (`vaultsync.toml` in the data directory)
//! 3. Default values
//!
//! ## Configuration File Format
//!
//! ```toml
//! [sync]
//! worker_count = 4
//! batch_size = 64
//! max_remote_attempts = 3
//! initial_backoff_ms = 200
//! max_backoff_ms = 5000
//!
//! [keys]
//! session_timeout_secs = 300
//! presence_reason = "Unlock your synced records"
//!
//! [backup]
//! mem_cost_kib = 65536
//! time_cost = 3
//! parallelism = 1
//!
//! [network]
//! probe_addr = "sync.example.com:443"
//! probe_interval_secs = 15
//! probe_timeout_ms = 3000
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{SyncError, SyncResult};

/// Default config file name inside the data directory
pub const CONFIG_FILE_NAME: &str = "vaultsync.toml";

/// Complete Vaultsync configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub sync: SyncSettings,
    pub keys: KeySettings,
    pub backup: BackupSettings,
    pub network: NetworkSettings,
}

/// Orchestrator tuning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    /// Upper bound on concurrent encrypt/decrypt workers per batch
    pub worker_count: usize,
    /// Records pushed per remote batch call
    pub batch_size: usize,
    /// Attempts per remote call before the failure is surfaced
    pub max_remote_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            worker_count: 4,
            batch_size: 64,
            max_remote_attempts: 3,
            initial_backoff_ms: 200,
            max_backoff_ms: 5_000,
        }
    }
}

impl SyncSettings {
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

/// Key session behaviour
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeySettings {
    /// Idle time after which the unlocked session is dropped (none = never)
    pub session_timeout_secs: Option<u64>,
    /// Reason string shown by the platform presence prompt
    pub presence_reason: String,
}

impl Default for KeySettings {
    fn default() -> Self {
        Self {
            session_timeout_secs: Some(300),
            presence_reason: "Unlock your synced records".to_string(),
        }
    }
}

impl KeySettings {
    pub fn session_timeout(&self) -> Option<Duration> {
        self.session_timeout_secs.map(Duration::from_secs)
    }
}

/// Argon2id parameters for passphrase-protected backups
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupSettings {
    pub mem_cost_kib: u32,
    pub time_cost: u32,
    pub parallelism: u32,
}

impl Default for BackupSettings {
    fn default() -> Self {
        Self {
            mem_cost_kib: 65_536,
            time_cost: 3,
            parallelism: 1,
        }
    }
}

/// Reachability probing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkSettings {
    /// `host:port` dialled by the TCP probe; no probe when unset
    pub probe_addr: Option<String>,
    pub probe_interval_secs: u64,
    pub probe_timeout_ms: u64,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            probe_addr: None,
            probe_interval_secs: 15,
            probe_timeout_ms: 3_000,
        }
    }
}

impl SyncConfig {
    /// Load configuration from a TOML file, falling back to defaults when
    /// the file does not exist. Environment overrides are applied last.
    pub fn load(path: impl AsRef<Path>) -> SyncResult<Self> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            info!(path = %path.display(), "Loaded sync config");
            Self::from_toml_str(&content)?
        } else {
            debug!(path = %path.display(), "No config file, using defaults");
            Self::default()
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> SyncResult<Self> {
        toml::from_str(content).map_err(|e| SyncError::Config(e.to_string()))
    }

    pub fn to_toml_string(&self) -> SyncResult<String> {
        toml::to_string_pretty(self).map_err(|e| SyncError::Config(e.to_string()))
    }

    /// Write the configuration, creating the parent directory if needed.
    pub fn save(&self, path: impl AsRef<Path>) -> SyncResult<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.to_toml_string()?)?;
        Ok(())
    }

    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    /// Apply overrides from an arbitrary variable lookup.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(workers) = lookup("VAULTSYNC_WORKERS").and_then(|v| v.parse().ok()) {
            debug!(workers, "worker_count overridden from environment");
            self.sync.worker_count = workers;
        }
        if let Some(attempts) = lookup("VAULTSYNC_MAX_ATTEMPTS").and_then(|v| v.parse().ok()) {
            debug!(attempts, "max_remote_attempts overridden from environment");
            self.sync.max_remote_attempts = attempts;
        }
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> SyncResult<()> {
        if self.sync.worker_count == 0 {
            return Err(SyncError::Config("sync.worker_count must be at least 1".into()));
        }
        if self.sync.batch_size == 0 {
            return Err(SyncError::Config("sync.batch_size must be at least 1".into()));
        }
        if self.sync.max_remote_attempts == 0 {
            return Err(SyncError::Config(
                "sync.max_remote_attempts must be at least 1".into(),
            ));
        }
        if self.sync.initial_backoff_ms > self.sync.max_backoff_ms {
            return Err(SyncError::Config(
                "sync.initial_backoff_ms exceeds sync.max_backoff_ms".into(),
            ));
        }
        if self.backup.parallelism == 0 || self.backup.time_cost == 0 {
            return Err(SyncError::Config(
                "backup.time_cost and backup.parallelism must be at least 1".into(),
            ));
        }
        if self.backup.mem_cost_kib < 8 * 1024 {
            return Err(SyncError::Config(
                "backup.mem_cost_kib must be at least 8192".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        SyncConfig::default().validate().unwrap();
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = SyncConfig::from_toml_str(
            r#"
            [sync]
            worker_count = 8

            [network]
            probe_addr = "127.0.0.1:9"
            "#,
        )
        .unwrap();

        assert_eq!(config.sync.worker_count, 8);
        assert_eq!(config.sync.batch_size, 64);
        assert_eq!(config.network.probe_addr.as_deref(), Some("127.0.0.1:9"));
        assert_eq!(config.keys, KeySettings::default());
    }

    #[test]
    fn test_invalid_toml_is_config_error() {
        let result = SyncConfig::from_toml_str("[sync\nworker_count = ");
        assert!(matches!(result, Err(SyncError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_zero_workers() {
        let mut config = SyncConfig::default();
        config.sync.worker_count = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_weak_backup_kdf() {
        let mut config = SyncConfig::default();
        config.backup.mem_cost_kib = 1024;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_overrides() {
        let mut config = SyncConfig::default();
        config.apply_overrides(|name| match name {
            "VAULTSYNC_WORKERS" => Some("2".to_string()),
            "VAULTSYNC_MAX_ATTEMPTS" => Some("not-a-number".to_string()),
            _ => None,
        });
        assert_eq!(config.sync.worker_count, 2);
        assert_eq!(config.sync.max_remote_attempts, 3);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);

        let mut config = SyncConfig::default();
        config.sync.batch_size = 16;
        config.keys.presence_reason = "Sync wardrobe".to_string();
        config.save(&path).unwrap();

        let loaded = SyncConfig::load(&path).unwrap();
        assert_eq!(loaded.sync.batch_size, 16);
        assert_eq!(loaded.keys.presence_reason, "Sync wardrobe");
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = SyncConfig::load(dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.sync, SyncSettings::default());
    }
}
