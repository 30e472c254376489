//! Intercom configuration types and loading

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Bus protocol settings: shared key names, lock timing and TTLs
///
/// Every peer sharing a store must agree on the key names; the timings may
/// differ per peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusConfig {
    /// Key holding the message log
    #[serde(rename = "log-key", default = "default_log_key")]
    pub log_key: String,

    /// Key holding the once-table
    #[serde(rename = "once-key", default = "default_once_key")]
    pub once_key: String,

    /// Key holding the lock record
    #[serde(rename = "lock-key", default = "default_lock_key")]
    pub lock_key: String,

    /// Age after which a held lock is considered abandoned
    #[serde(rename = "lock-timeout-ms", default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,

    /// Fallback poll interval while waiting for the lock
    #[serde(rename = "lock-wait-ms", default = "default_lock_wait_ms")]
    pub lock_wait_ms: u64,

    /// How long packets stay in the log
    #[serde(rename = "emit-ttl-ms", default = "default_emit_ttl_ms")]
    pub emit_ttl_ms: u64,

    /// How long once-table claims last
    #[serde(rename = "once-ttl-ms", default = "default_once_ttl_ms")]
    pub once_ttl_ms: u64,

    /// Minimum interval between two prune passes of the same kind
    #[serde(rename = "prune-throttle-ms", default = "default_prune_throttle_ms")]
    pub prune_throttle_ms: u64,

    /// Delay between an emit or claim and its prune pass
    #[serde(rename = "prune-delay-ms", default = "default_prune_delay_ms")]
    pub prune_delay_ms: u64,
}

fn default_log_key() -> String {
    "intercom".to_string()
}

fn default_once_key() -> String {
    "intercom_once".to_string()
}

fn default_lock_key() -> String {
    "intercom_lock".to_string()
}

fn default_lock_timeout_ms() -> u64 {
    1_000
}

fn default_lock_wait_ms() -> u64 {
    20
}

fn default_emit_ttl_ms() -> u64 {
    50_000
}

fn default_once_ttl_ms() -> u64 {
    3_600_000
}

fn default_prune_throttle_ms() -> u64 {
    100
}

fn default_prune_delay_ms() -> u64 {
    50
}

impl Default for BusConfig {
    fn default() -> Self {
        debug!("BusConfig::default: called");
        Self {
            log_key: default_log_key(),
            once_key: default_once_key(),
            lock_key: default_lock_key(),
            lock_timeout_ms: default_lock_timeout_ms(),
            lock_wait_ms: default_lock_wait_ms(),
            emit_ttl_ms: default_emit_ttl_ms(),
            once_ttl_ms: default_once_ttl_ms(),
            prune_throttle_ms: default_prune_throttle_ms(),
            prune_delay_ms: default_prune_delay_ms(),
        }
    }
}

impl BusConfig {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn lock_wait(&self) -> Duration {
        Duration::from_millis(self.lock_wait_ms)
    }

    pub fn prune_throttle(&self) -> Duration {
        Duration::from_millis(self.prune_throttle_ms)
    }

    pub fn prune_delay(&self) -> Duration {
        Duration::from_millis(self.prune_delay_ms)
    }

    /// The three keys this bus owns in the store
    pub fn keys(&self) -> [&str; 3] {
        [&self.lock_key, &self.log_key, &self.once_key]
    }
}

/// Backing store settings for the command-line peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// SQLite database shared by all peers
    pub path: PathBuf,

    /// How often to check for other peers' writes
    #[serde(rename = "poll-interval-ms")]
    pub poll_interval_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: kvstore::default_db_path(),
            poll_interval_ms: kvstore::DEFAULT_POLL_INTERVAL_MS,
        }
    }
}

impl StoreConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Top-level configuration for the `ic` binary
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Log level (trace, debug, info, warn, error)
    #[serde(rename = "log-level")]
    pub log_level: Option<String>,

    /// Backing store
    pub store: StoreConfig,

    /// Bus protocol settings
    pub bus: BusConfig,
}

impl Config {
    /// Load configuration with fallback chain
    ///
    /// Explicit path, then `./.intercom.yml`, then
    /// `<config dir>/intercom/intercom.yml`, then defaults.
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        for candidate in Self::default_locations() {
            if candidate.exists() {
                match Self::load_from_file(&candidate) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        tracing::warn!("Failed to load config from {}: {}", candidate.display(), e);
                    }
                }
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    /// Read only the log level, before logging is set up
    ///
    /// Errors are swallowed: a broken config file is reported later by [`Config::load`].
    pub fn load_log_level(config_path: Option<&PathBuf>) -> Option<String> {
        let path = match config_path {
            Some(path) => path.clone(),
            None => Self::default_locations().into_iter().find(|p| p.exists())?,
        };
        Self::load_from_file(&path).ok()?.log_level
    }

    fn default_locations() -> Vec<PathBuf> {
        let mut locations = vec![PathBuf::from(".intercom.yml")];
        if let Some(config_dir) = dirs::config_dir() {
            locations.push(config_dir.join("intercom").join("intercom.yml"));
        }
        locations
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;
        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;
        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_bus_config() {
        let config = BusConfig::default();
        assert_eq!(config.keys(), ["intercom_lock", "intercom", "intercom_once"]);
        assert_eq!(config.lock_timeout(), Duration::from_secs(1));
        assert_eq!(config.lock_wait(), Duration::from_millis(20));
        assert_eq!(config.emit_ttl_ms, 50_000);
        assert_eq!(config.once_ttl_ms, 3_600_000);
        assert_eq!(config.prune_throttle(), Duration::from_millis(100));
        assert_eq!(config.prune_delay(), Duration::from_millis(50));
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let yaml = r#"
log-level: debug
store:
  path: /tmp/shared.db
bus:
  log-key: app_bus
  emit-ttl-ms: 5000
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.log_level.as_deref(), Some("debug"));
        assert_eq!(config.store.path, PathBuf::from("/tmp/shared.db"));
        assert_eq!(config.store.poll_interval_ms, kvstore::DEFAULT_POLL_INTERVAL_MS);
        assert_eq!(config.bus.log_key, "app_bus");
        assert_eq!(config.bus.emit_ttl_ms, 5_000);
        assert_eq!(config.bus.once_key, "intercom_once");
        assert_eq!(config.bus.lock_timeout_ms, 1_000);
    }

    #[test]
    fn test_load_explicit_path() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("intercom.yml");
        fs::write(&path, "bus:\n  lock-wait-ms: 7\n").unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.bus.lock_wait_ms, 7);
        assert_eq!(Config::load_log_level(Some(&path)), None);
    }

    #[test]
    fn test_load_missing_explicit_path_fails() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("missing.yml");
        assert!(Config::load(Some(&path)).is_err());
        assert_eq!(Config::load_log_level(Some(&path)), None);
    }
}
