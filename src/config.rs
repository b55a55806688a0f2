//! Sync Configuration
//!
//! Configuration can be loaded from:
//! - Default values
//! - Config file (~/.config/todo-sync/config.toml)
//! - Environment variables (`TODO_SYNC_BASE_URL`)

use crate::error::{Result, SyncError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable overriding `remote.base_url`
pub const BASE_URL_ENV: &str = "TODO_SYNC_BASE_URL";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Remote API
    pub remote: RemoteConfig,
    /// Local durable store
    pub storage: StorageConfig,
    /// Mutation queue retry policy
    pub queue: QueueConfig,
    /// Connectivity polling
    pub connectivity: ConnectivityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// API base URL (without the trailing `/todos`)
    pub base_url: String,
    /// Per-request timeout in seconds
    pub timeout_secs: u64,
    /// Bearer token sent with category requests
    pub auth_token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database file
    pub db_path: PathBuf,
    /// Soft quota for the storage estimate (bytes)
    pub quota_bytes: Option<u64>,
    /// Usage ratio above which a storage warning is reported
    pub warn_ratio: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Failed attempts before a mutation is dead-lettered
    pub max_attempts: u32,
    /// First retry delay
    pub backoff_base_ms: u64,
    /// Upper bound on the retry delay
    pub backoff_max_ms: u64,
    /// What a local write does about flushing
    pub flush_on_write: FlushOnWrite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectivityConfig {
    /// Defensive probe interval
    pub poll_interval_secs: u64,
    /// Timeout for a single probe request
    pub probe_timeout_ms: u64,
}

/// Flush behaviour after an optimistic write
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FlushOnWrite {
    /// Spawn a flush task and return right away
    Background,
    /// Run the flush before returning
    Inline,
    /// Leave flushing to the connectivity monitor
    Never,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            remote: RemoteConfig::default(),
            storage: StorageConfig::default(),
            queue: QueueConfig::default(),
            connectivity: ConnectivityConfig::default(),
        }
    }
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:4000".to_string(),
            timeout_secs: 10,
            auth_token: None,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        let data_dir = dirs::data_dir().unwrap_or_else(|| PathBuf::from("."));
        Self {
            db_path: data_dir.join("todo-sync").join("todo-sync.db"),
            quota_bytes: None,
            warn_ratio: 0.8,
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            backoff_base_ms: 2_000,
            backoff_max_ms: 5 * 60 * 1000,
            flush_on_write: FlushOnWrite::Background,
        }
    }
}

impl Default for ConnectivityConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 30,
            probe_timeout_ms: 3_000,
        }
    }
}

impl SyncConfig {
    /// Get default configuration file path
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("todo-sync")
            .join("config.toml")
    }

    /// Load configuration from file (defaults if it doesn't exist), then apply
    /// environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path.map(PathBuf::from).unwrap_or_else(Self::default_path);

        let mut config = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            toml::from_str(&content)
                .map_err(|e| SyncError::Config(format!("{}: {}", path.display(), e)))?
        } else {
            Self::default()
        };

        if let Ok(url) = std::env::var(BASE_URL_ENV) {
            if !url.trim().is_empty() {
                config.remote.base_url = url;
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self, path: Option<&Path>) -> Result<()> {
        let path = path.map(PathBuf::from).unwrap_or_else(Self::default_path);

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content =
            toml::to_string_pretty(self).map_err(|e| SyncError::Config(e.to_string()))?;
        std::fs::write(&path, content)?;

        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.remote.base_url.trim().is_empty() {
            return Err(SyncError::Config("remote.base_url is empty".into()));
        }
        if self.queue.max_attempts == 0 {
            return Err(SyncError::Config("queue.max_attempts must be at least 1".into()));
        }
        if self.connectivity.poll_interval_secs == 0 {
            return Err(SyncError::Config(
                "connectivity.poll_interval_secs must be at least 1".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.storage.warn_ratio) {
            return Err(SyncError::Config("storage.warn_ratio must be within 0..=1".into()));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.remote.timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.connectivity.poll_interval_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.connectivity.probe_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SyncConfig::default();
        assert_eq!(config.queue.max_attempts, 10);
        assert_eq!(config.queue.flush_on_write, FlushOnWrite::Background);
        assert_eq!(config.poll_interval(), Duration::from_secs(30));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "[queue]\nmax_attempts = 3\nflush_on_write = \"never\"\n",
        )
        .unwrap();

        let config = SyncConfig::load(Some(path.as_path())).unwrap();
        assert_eq!(config.queue.max_attempts, 3);
        assert_eq!(config.queue.flush_on_write, FlushOnWrite::Never);
        assert_eq!(config.queue.backoff_base_ms, 2_000);
        assert_eq!(config.connectivity.probe_timeout_ms, 3_000);
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = SyncConfig::default();
        config.remote.auth_token = Some("simple-token".into());
        config.storage.quota_bytes = Some(1024);
        config.save(Some(path.as_path())).unwrap();

        let loaded = SyncConfig::load(Some(path.as_path())).unwrap();
        assert_eq!(loaded.remote.auth_token.as_deref(), Some("simple-token"));
        assert_eq!(loaded.storage.quota_bytes, Some(1024));
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut config = SyncConfig::default();
        config.queue.max_attempts = 0;
        assert!(matches!(config.validate(), Err(SyncError::Config(_))));

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[storage]\nwarn_ratio = 2.5\n").unwrap();
        assert!(SyncConfig::load(Some(path.as_path())).is_err());

        std::fs::write(&path, "[connectivity]\npoll_interval_secs = 0\n").unwrap();
        assert!(matches!(
            SyncConfig::load(Some(path.as_path())),
            Err(SyncError::Config(_))
        ));
    }
}
