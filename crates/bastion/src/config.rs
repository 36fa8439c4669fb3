//! Application configuration (`bastion.toml`)
//!
//! ```toml
//! [scan]
//! clamscan_path = "/usr/bin/clamscan"
//! remote_size_limit = 33554432
//!
//! [remote]
//! api_key = "..."
//! requests_per_minute = 4
//!
//! [watcher]
//! directories = ["/home/me/Downloads"]
//!
//! [tunnel]
//! default_peer = "de-fra"
//!
//! [logging]
//! level = "info"
//! ```

use bastion_guard::{TunnelConfig, WatcherConfig};
use bastion_scan::{LocalEngineConfig, PipelineConfig, RemoteEngineConfig};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Config file used when `--config` is not given
pub const DEFAULT_CONFIG_FILE: &str = "bastion.toml";

/// Environment variable overriding `[remote] api_key`
pub const API_KEY_ENV: &str = "BASTION_VT_API_KEY";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Invalid configuration in {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// `[scan]`: local engine plus pipeline policy
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanSection {
    #[serde(flatten)]
    pub local: LocalEngineConfig,
    #[serde(flatten)]
    pub pipeline: PipelineConfig,
}

/// `[logging]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter used when `RUST_LOG` is unset
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub scan: ScanSection,
    pub remote: RemoteEngineConfig,
    pub watcher: WatcherConfig,
    pub tunnel: TunnelConfig,
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Load the configuration.
    ///
    /// An explicit path must exist. Without one, `bastion.toml` in the
    /// working directory is used if present, defaults otherwise.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match explicit {
            Some(path) => Self::from_file(path)?,
            None => {
                let path = Path::new(DEFAULT_CONFIG_FILE);
                if path.exists() {
                    Self::from_file(path)?
                } else {
                    Self::default()
                }
            }
        };

        config.apply_api_key_override(std::env::var(API_KEY_ENV).ok());
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    fn apply_api_key_override(&mut self, key: Option<String>) {
        if let Some(key) = key.filter(|k| !k.trim().is_empty()) {
            self.remote.api_key = Some(key.trim().to_string());
        }
    }
}
