//! Persistent configuration for quiesce.
//!
//! Settings live in `~/.quiesce/config.json`. Every field has a default, so a
//! missing or partial file is fine; binaries layer their command-line flags on
//! top of whatever [`SyncConfig::load`] returns.
//!
//! # Example
//!
//! ```no_run
//! use quiesce_core::config::SyncConfig;
//!
//! // Load (returns defaults if the file doesn't exist)
//! let config = SyncConfig::load();
//! println!("polling every {:?}", config.poll_interval());
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

const CONFIG_FILENAME: &str = "config.json";

/// Errors that can occur while reading or writing the config file.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The home directory could not be determined.
    #[error("could not determine home directory")]
    NoHomeDir,

    /// Reading or writing the file failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The file is not valid JSON for [`SyncConfig`].
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Returns the quiesce directory path (`~/.quiesce/`), creating it if needed.
pub fn quiesce_dir() -> Result<PathBuf, ConfigError> {
    let dir = dirs::home_dir().ok_or(ConfigError::NoHomeDir)?.join(".quiesce");
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}

/// Returns the logs directory path (`~/.quiesce/logs/`), creating it if needed.
pub fn logs_dir() -> Result<PathBuf, ConfigError> {
    let dir = quiesce_dir()?.join("logs");
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}

/// Synchronization and transport settings shared by both processes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// How often the idle condition is re-checked while waiting.
    pub poll_interval_ms: u64,
    /// Timeout applied to synchronized work when the caller gives none.
    pub default_timeout_ms: u64,
    /// When false, synchronized tasks run without waiting for idle.
    pub synchronization_enabled: bool,
    /// Address the bridge host binds to and the driver connects to.
    pub bridge_host: String,
    /// TCP port of the bridge host.
    pub bridge_port: u16,
    /// Timeout for establishing a bridge connection.
    pub connect_timeout_ms: u64,
    /// Read timeout for a bridge call that carries no timeout of its own.
    pub call_timeout_ms: u64,
    /// How many times the transport re-dials after a failed connect.
    pub connect_retries: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 100,
            default_timeout_ms: 30_000,
            synchronization_enabled: true,
            bridge_host: "127.0.0.1".to_string(),
            bridge_port: 7357,
            connect_timeout_ms: 5_000,
            call_timeout_ms: 60_000,
            connect_retries: 2,
        }
    }
}

impl SyncConfig {
    /// Load config from `~/.quiesce/config.json`.
    ///
    /// Returns [`Default`] if the file does not exist or cannot be parsed.
    pub fn load() -> Self {
        quiesce_dir()
            .ok()
            .and_then(|dir| Self::load_from(dir.join(CONFIG_FILENAME)).ok())
            .unwrap_or_default()
    }

    /// Load config from an explicit path.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Save config to `~/.quiesce/config.json`.
    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to(quiesce_dir()?.join(CONFIG_FILENAME))
    }

    /// Save config to an explicit path.
    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    /// `host:port` of the bridge.
    pub fn bridge_addr(&self) -> String {
        format!("{}:{}", self.bridge_host, self.bridge_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_enable_synchronization() {
        let config = SyncConfig::default();
        assert!(config.synchronization_enabled);
        assert_eq!(config.poll_interval(), Duration::from_millis(100));
        assert_eq!(config.bridge_addr(), "127.0.0.1:7357");
    }

    #[test]
    fn deserialize_empty_json() {
        let loaded: SyncConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(loaded, SyncConfig::default());
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let loaded: SyncConfig =
            serde_json::from_str(r#"{"poll_interval_ms": 25, "bridge_port": 9000}"#).unwrap();
        assert_eq!(loaded.poll_interval_ms, 25);
        assert_eq!(loaded.bridge_port, 9000);
        assert_eq!(loaded.default_timeout_ms, 30_000);
    }

    #[test]
    fn save_and_load_from_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let config = SyncConfig {
            synchronization_enabled: false,
            connect_retries: 5,
            ..SyncConfig::default()
        };
        config.save_to(&path).unwrap();
        assert_eq!(SyncConfig::load_from(&path).unwrap(), config);
    }

    #[test]
    fn load_from_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = SyncConfig::load_from(dir.path().join("nope.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
