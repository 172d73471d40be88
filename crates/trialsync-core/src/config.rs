//! Engine configuration.
//!
//! Every section has defaults, so an empty JSON object is a complete
//! configuration. Environment variables override the endpoint and storage
//! settings after the file is read.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::lock::LockConfig;
use crate::network::NetworkConfig;
use crate::pipeline::{
    BandwidthConfig, CoalescerConfig, CompressionConfig, DedupConfig, RetryConfig,
};
use crate::util::{is_http_url, normalize_text_option};

/// Base URL of the remote document store.
pub const ENV_REMOTE_URL: &str = "TRIALSYNC_REMOTE_URL";
/// Path of the local SQLite file.
pub const ENV_DEVICE_DB: &str = "TRIALSYNC_DEVICE_DB";
/// Bearer token sent to the remote store.
pub const ENV_REMOTE_TOKEN: &str = "TRIALSYNC_REMOTE_TOKEN";
/// Reachability endpoint for the connectivity monitor.
pub const ENV_VERIFY_URL: &str = "TRIALSYNC_VERIFY_URL";
/// Resource downloaded by the bandwidth probe.
pub const ENV_PROBE_URL: &str = "TRIALSYNC_PROBE_URL";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    pub remote_url: Option<String>,
    #[serde(skip_serializing)]
    pub remote_token: Option<String>,
    pub remote_timeout_ms: u64,
    pub device_db: Option<PathBuf>,
    pub lock: LockConfig,
    pub retry: RetryConfig,
    pub dedup: DedupConfig,
    pub bandwidth: BandwidthConfig,
    pub network: NetworkConfig,
    pub coalescer: CoalescerConfig,
    pub compression: CompressionConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            remote_url: None,
            remote_token: None,
            remote_timeout_ms: 15_000,
            device_db: None,
            lock: LockConfig::default(),
            retry: RetryConfig::sync(),
            dedup: DedupConfig::default(),
            bandwidth: BandwidthConfig::default(),
            network: NetworkConfig::default(),
            coalescer: CoalescerConfig::default(),
            compression: CompressionConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_json_str(raw: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Read `path` (when given) and apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_json_str(&std::fs::read_to_string(path)?)?,
            None => Self::default(),
        };
        config.apply_env_overrides_from(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from `lookup`. Blank values are ignored.
    pub fn apply_env_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let read = |key: &str| normalize_text_option(lookup(key));

        if let Some(url) = read(ENV_REMOTE_URL) {
            self.remote_url = Some(url);
        }
        if let Some(token) = read(ENV_REMOTE_TOKEN) {
            self.remote_token = Some(token);
        }
        if let Some(path) = read(ENV_DEVICE_DB) {
            self.device_db = Some(PathBuf::from(path));
        }
        if let Some(url) = read(ENV_VERIFY_URL) {
            self.network.verify_url = Some(url);
        }
        if let Some(url) = read(ENV_PROBE_URL) {
            self.bandwidth.probe_url = Some(url);
        }
    }

    pub fn validate(&self) -> Result<()> {
        let urls = [
            ("remote_url", self.remote_url.as_deref()),
            ("network.verify_url", self.network.verify_url.as_deref()),
            ("bandwidth.probe_url", self.bandwidth.probe_url.as_deref()),
        ];
        for (field, url) in urls {
            if let Some(url) = url {
                if !is_http_url(url) {
                    return Err(Error::InvalidInput(format!(
                        "{field} must include http:// or https://"
                    )));
                }
            }
        }
        if self.retry.max_attempts == 0 {
            return Err(Error::InvalidInput(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.lock.timeout_ms == 0 {
            return Err(Error::InvalidInput("lock.timeout_ms must be positive".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    #[test]
    fn empty_object_yields_defaults() {
        let config = EngineConfig::from_json_str("{}").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.lock.timeout_ms, 30_000);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.dedup.cache_ms, 5_000);
        assert_eq!(config.network.stabilization_delay_ms, 1_000);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config =
            EngineConfig::from_json_str(r#"{"lock": {"timeout_ms": 5000}, "coalescer": {"batch_size": 3}}"#)
                .unwrap();
        assert_eq!(config.lock.timeout_ms, 5_000);
        assert_eq!(config.lock.sweep_interval_ms, 1_000);
        assert_eq!(config.coalescer.batch_size, 3);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(EngineConfig::from_json_str(r#"{"remote": "x"}"#).is_err());
    }

    #[test]
    fn env_overrides_replace_file_values() {
        let env: HashMap<&str, &str> = HashMap::from([
            (ENV_REMOTE_URL, "https://sync.example.org"),
            (ENV_DEVICE_DB, "/tmp/trialsync.db"),
            (ENV_VERIFY_URL, "  "),
        ]);
        let mut config = EngineConfig::from_json_str(
            r#"{"remote_url": "https://old.example.org", "network": {"verify_url": "https://health.example.org"}}"#,
        )
        .unwrap();
        config.apply_env_overrides_from(|key| env.get(key).map(|value| (*value).to_string()));

        assert_eq!(config.remote_url.as_deref(), Some("https://sync.example.org"));
        assert_eq!(config.device_db, Some(PathBuf::from("/tmp/trialsync.db")));
        assert_eq!(
            config.network.verify_url.as_deref(),
            Some("https://health.example.org")
        );
    }

    #[test]
    fn validation_rejects_bad_urls() {
        let config = EngineConfig {
            remote_url: Some("sync.example.org".to_string()),
            ..EngineConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trialsync.json");
        std::fs::write(&path, r#"{"remote_timeout_ms": 2500}"#).unwrap();
        let config = EngineConfig::load(Some(&path)).unwrap();
        assert_eq!(config.remote_timeout_ms, 2_500);
    }
}
