//! Configuration for dieah-relay

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Longest retention window accepted, in days (about a century)
const MAX_RETENTION_DAYS: i64 = 36_500;

/// Longest TTL or grace period accepted, in seconds
const MAX_WINDOW_SECS: u64 = MAX_RETENTION_DAYS as u64 * 86_400;

/// Configuration for the relay. Every field can be set from the JSON config
/// file; anything missing falls back to [`Config::default`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Base directory for all storage
    pub data_dir: PathBuf,

    /// Base URL of the memory worker
    pub worker_url: String,

    /// Consecutive failures before the breaker opens
    pub failure_threshold: u32,

    /// Seconds the breaker stays open before allowing a probe
    pub recovery_timeout_secs: u64,

    /// Genuine send failures before a capture is marked failed
    pub max_retries: u32,

    /// Captures claimed per drain cycle
    pub max_per_cycle: usize,

    /// Pause between two sends inside a drain cycle
    pub delay_between_ms: u64,

    /// Seconds between drain cycles
    pub processor_interval_secs: u64,

    /// Upper bound on cached context entries
    pub cache_max_entries: usize,

    /// Seconds a cached context entry counts as fresh
    pub cache_ttl_secs: u64,

    /// Days to keep sent captures
    pub sent_retention_days: i64,

    /// Days to keep failed captures
    pub failed_retention_days: i64,

    /// Timeout applied to every call to the memory worker
    pub request_timeout_secs: u64,

    /// How long a capture may sit in `sending` before startup resets it
    pub sending_grace_secs: u64,

    /// Seconds between retention cleanups
    pub cleanup_interval_secs: u64,

    /// Try one send right after a capture is written
    pub opportunistic_send: bool,

    /// Queue depth that raises a warning
    pub queue_warning_depth: u64,

    /// Queue depth that raises a critical alert
    pub queue_critical_depth: u64,

    /// Age of the oldest pending capture that raises a warning
    pub oldest_pending_warning_secs: i64,

    /// How long the breaker may stay open before a critical alert
    pub breaker_open_critical_secs: u64,

    /// HTTP server port
    pub server_port: u16,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("dieah-relay");

        Self {
            data_dir,
            worker_url: "http://127.0.0.1:8420".to_string(),
            failure_threshold: 5,
            recovery_timeout_secs: 30,
            max_retries: 5,
            max_per_cycle: 10,
            delay_between_ms: 2_000,
            processor_interval_secs: 30,
            cache_max_entries: 50,
            cache_ttl_secs: 3_600,
            sent_retention_days: 7,
            failed_retention_days: 30,
            request_timeout_secs: 5,
            sending_grace_secs: 300,
            cleanup_interval_secs: 86_400,
            opportunistic_send: true,
            queue_warning_depth: 50,
            queue_critical_depth: 200,
            oldest_pending_warning_secs: 3_600,
            breaker_open_critical_secs: 1_800,
            server_port: 8421,
        }
    }
}

impl Config {
    /// Create a new config with a custom data directory
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    /// Load a config file, then apply environment overrides
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let data = std::fs::read_to_string(path.as_ref())?;
        let mut config: Config = serde_json::from_str(&data)?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Load from `DIEAH_RELAY_CONFIG` if set, defaults otherwise
    pub fn from_env() -> Result<Self> {
        match std::env::var("DIEAH_RELAY_CONFIG") {
            Ok(path) => Self::load(path),
            Err(_) => {
                let mut config = Self::default();
                config.apply_env();
                config.validate()?;
                Ok(config)
            }
        }
    }

    fn apply_env(&mut self) {
        if let Ok(dir) = std::env::var("DIEAH_RELAY_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
        if let Ok(url) = std::env::var("DIEAH_RELAY_WORKER_URL") {
            self.worker_url = url;
        }
        if let Some(port) = std::env::var("DIEAH_RELAY_PORT")
            .ok()
            .and_then(|p| p.parse::<u16>().ok())
        {
            self.server_port = port;
        }
    }

    /// Reject settings that would disable a safety bound
    pub fn validate(&self) -> Result<()> {
        if self.failure_threshold == 0 {
            return Err(Error::config("failure_threshold must be at least 1"));
        }
        if self.max_retries == 0 {
            return Err(Error::config("max_retries must be at least 1"));
        }
        if self.max_per_cycle == 0 {
            return Err(Error::config("max_per_cycle must be at least 1"));
        }
        if self.cache_max_entries == 0 {
            return Err(Error::config("cache_max_entries must be at least 1"));
        }
        if self.request_timeout_secs == 0 {
            return Err(Error::config("request_timeout_secs must be at least 1"));
        }
        if self.processor_interval_secs == 0 || self.cleanup_interval_secs == 0 {
            return Err(Error::config("processor and cleanup intervals must be non-zero"));
        }
        if self.sent_retention_days < 0 || self.failed_retention_days < 0 {
            return Err(Error::config("retention windows cannot be negative"));
        }
        if self.sent_retention_days > MAX_RETENTION_DAYS || self.failed_retention_days > MAX_RETENTION_DAYS {
            return Err(Error::config(format!(
                "retention windows cannot exceed {} days",
                MAX_RETENTION_DAYS
            )));
        }
        if self.cache_ttl_secs > MAX_WINDOW_SECS || self.sending_grace_secs > MAX_WINDOW_SECS {
            return Err(Error::config(format!(
                "cache_ttl_secs and sending_grace_secs cannot exceed {}",
                MAX_WINDOW_SECS
            )));
        }
        if self.oldest_pending_warning_secs < 0 {
            return Err(Error::config("oldest_pending_warning_secs cannot be negative"));
        }
        Ok(())
    }

    /// Get the path to the SQLite database
    pub fn sqlite_path(&self) -> PathBuf {
        self.data_dir.join("outbox.db")
    }

    /// Ensure all required directories exist
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.data_dir)
    }

    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_secs(self.recovery_timeout_secs)
    }

    pub fn delay_between(&self) -> Duration {
        Duration::from_millis(self.delay_between_ms)
    }

    pub fn processor_interval(&self) -> Duration {
        Duration::from_secs(self.processor_interval_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn cache_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.cache_ttl_secs as i64)
    }

    pub fn sending_grace(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.sending_grace_secs as i64)
    }

    pub fn sent_retention(&self) -> chrono::Duration {
        chrono::Duration::days(self.sent_retention_days)
    }

    pub fn failed_retention(&self) -> chrono::Duration {
        chrono::Duration::days(self.failed_retention_days)
    }
}
