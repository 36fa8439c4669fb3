//! Scan engine and pipeline configuration
//!
//! Every struct deserializes with `#[serde(default)]` so a partial TOML
//! section only overrides what it names.

use crate::rate_limiter::DEFAULT_REQUESTS_PER_WINDOW;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Default ceiling for files sent to the remote engine (32 MiB)
const DEFAULT_REMOTE_SIZE_LIMIT: u64 = 32 * 1024 * 1024;

/// Local signature engine (clamscan) settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalEngineConfig {
    /// Scanner binary
    pub clamscan_path: PathBuf,
    /// Arguments placed before the file path
    pub clamscan_args: Vec<String>,
}

impl Default for LocalEngineConfig {
    fn default() -> Self {
        Self {
            clamscan_path: PathBuf::from("clamscan"),
            clamscan_args: vec!["--no-summary".to_string()],
        }
    }
}

/// Remote reputation engine (VirusTotal v3) settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteEngineConfig {
    /// Disable to scan with the local engine only
    pub enabled: bool,
    /// API key sent as `x-apikey`
    pub api_key: Option<String>,
    /// API root, without trailing slash
    pub base_url: String,
    /// Uploads allowed per rolling minute
    pub requests_per_minute: usize,
    /// Delay between analysis status polls
    pub poll_interval_secs: u64,
    /// Per-request HTTP timeout
    pub request_timeout_secs: u64,
}

impl RemoteEngineConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Whether the engine can actually be used
    pub fn is_usable(&self) -> bool {
        self.enabled && self.api_key.as_deref().is_some_and(|k| !k.is_empty())
    }
}

impl Default for RemoteEngineConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            api_key: None,
            base_url: "https://www.virustotal.com/api/v3".to_string(),
            requests_per_minute: DEFAULT_REQUESTS_PER_WINDOW,
            poll_interval_secs: 15,
            request_timeout_secs: 60,
        }
    }
}

/// Pipeline policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Files larger than this are never sent to the remote engine
    pub remote_size_limit: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            remote_size_limit: DEFAULT_REMOTE_SIZE_LIMIT,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_needs_key() {
        let mut config = RemoteEngineConfig::default();
        assert!(!config.is_usable());

        config.api_key = Some(String::new());
        assert!(!config.is_usable());

        config.api_key = Some("key".to_string());
        assert!(config.is_usable());

        config.enabled = false;
        assert!(!config.is_usable());
    }

    #[test]
    fn test_partial_deserialize() {
        let config: RemoteEngineConfig =
            serde_json::from_str(r#"{"requests_per_minute": 10}"#).unwrap();
        assert_eq!(config.requests_per_minute, 10);
        assert_eq!(config.poll_interval(), Duration::from_secs(15));
    }
}
