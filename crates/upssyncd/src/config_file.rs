//! Configuration file support for upssyncd
//!
//! Loads and validates upssyncd configuration from TOML files.
//! Default location: /etc/sonic/upssyncd.conf
//!
//! # NIST 800-53 Rev 5 Control Mappings
//! - CM-6: Configuration Settings - Validated before the daemon starts
//! - SI-10: Information Input Validation - Strict address and range checks

use crate::error::{Result, UpssyncError};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::warn;

/// Default configuration path
pub const DEFAULT_CONFIG_PATH: &str = "/etc/sonic/upssyncd.conf";

/// apcupsd NIS default port
pub const DEFAULT_NIS_PORT: u16 = 3551;

/// Accepted polling interval range in milliseconds
pub const MIN_POLLING_INTERVAL_MS: u64 = 1000;
pub const MAX_POLLING_INTERVAL_MS: u64 = 60000;

static IPV4_RE: Lazy<Regex> = Lazy::new(|| {
    // Each octet 0-255, nothing before or after
    Regex::new(r"^((25[0-5]|2[0-4][0-9]|1[0-9][0-9]|[1-9]?[0-9])\.){3}(25[0-5]|2[0-4][0-9]|1[0-9][0-9]|[1-9]?[0-9])$")
        .expect("static IPv4 pattern")
});

/// Whether `address` is a strict dotted-quad IPv4 address
pub fn is_valid_ipv4(address: &str) -> bool {
    IPV4_RE.is_match(address)
}

/// How NIS connections are managed across polls
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionMode {
    /// Connect, query and disconnect on every poll
    #[default]
    PerPoll,
    /// Keep one connection per target, with ping and reconnect
    Persistent,
}

/// Storage backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Memory,
    Redis,
}

/// One monitored apcupsd instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetConfig {
    pub address: String,
    #[serde(default = "default_nis_port")]
    pub port: u16,
}

impl TargetConfig {
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
        }
    }

    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

/// NIS client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NisConfig {
    /// TCP connect timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Request/response timeout in seconds
    #[serde(default = "default_socket_timeout")]
    pub socket_timeout_secs: u64,

    /// Ping cadence in persistent mode, in seconds
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,

    /// Delay before a reconnect attempt, in seconds
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_secs: u64,

    /// Consecutive failed reconnects before the daemon gives up
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
}

/// Availability watchdog configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchdogConfig {
    /// Tick interval in milliseconds
    #[serde(default = "default_watchdog_interval")]
    pub interval_ms: u64,

    /// Staleness window as a multiple of the polling interval
    #[serde(default = "default_staleness_factor")]
    pub staleness_factor: u32,
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    /// Redis host
    #[serde(default = "default_redis_host")]
    pub redis_host: String,

    /// Redis port
    #[serde(default = "default_redis_port")]
    pub redis_port: u16,

    /// Redis database number for STATE_DB
    #[serde(default = "default_state_db_number")]
    pub redis_db: u32,
}

/// Complete upssyncd configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpssyncConfig {
    #[serde(default = "default_polling_interval")]
    pub polling_interval_ms: u64,

    #[serde(default)]
    pub connection_mode: ConnectionMode,

    #[serde(default = "default_targets")]
    pub targets: Vec<TargetConfig>,

    #[serde(default)]
    pub nis: NisConfig,

    #[serde(default)]
    pub watchdog: WatchdogConfig,

    #[serde(default)]
    pub database: DatabaseConfig,
}

// Default functions
fn default_nis_port() -> u16 {
    DEFAULT_NIS_PORT
}

fn default_polling_interval() -> u64 {
    10000
}

fn default_targets() -> Vec<TargetConfig> {
    vec![TargetConfig::new("127.0.0.1", DEFAULT_NIS_PORT)]
}

fn default_connect_timeout() -> u64 {
    15
}

fn default_socket_timeout() -> u64 {
    15
}

fn default_ping_interval() -> u64 {
    10
}

fn default_reconnect_delay() -> u64 {
    5
}

fn default_max_reconnect_attempts() -> u32 {
    5
}

fn default_watchdog_interval() -> u64 {
    1000
}

fn default_staleness_factor() -> u32 {
    2
}

fn default_redis_host() -> String {
    "127.0.0.1".to_string()
}

fn default_redis_port() -> u16 {
    6379
}

fn default_state_db_number() -> u32 {
    6
}

// Default implementations
impl Default for NisConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout(),
            socket_timeout_secs: default_socket_timeout(),
            ping_interval_secs: default_ping_interval(),
            reconnect_delay_secs: default_reconnect_delay(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
        }
    }
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_watchdog_interval(),
            staleness_factor: default_staleness_factor(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            redis_host: default_redis_host(),
            redis_port: default_redis_port(),
            redis_db: default_state_db_number(),
        }
    }
}

impl Default for UpssyncConfig {
    fn default() -> Self {
        Self {
            polling_interval_ms: default_polling_interval(),
            connection_mode: ConnectionMode::default(),
            targets: default_targets(),
            nis: NisConfig::default(),
            watchdog: WatchdogConfig::default(),
            database: DatabaseConfig::default(),
        }
    }
}

impl UpssyncConfig {
    /// Load configuration from file, falling back to defaults if file not found
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        match fs::read_to_string(path) {
            Ok(content) => Self::from_toml(&content).map_err(|e| {
                UpssyncError::Configuration(format!(
                    "Failed to parse config file {}: {}",
                    path.display(),
                    e
                ))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %path.display(), "Config file not found, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(UpssyncError::Io(e)),
        }
    }

    /// Load from default location or defaults
    pub fn load() -> Result<Self> {
        Self::load_or_default(DEFAULT_CONFIG_PATH)
    }

    pub fn from_toml(content: &str) -> std::result::Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Save configuration to file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let content = toml::to_string_pretty(self).map_err(|e| {
            UpssyncError::Configuration(format!("Failed to serialize config: {}", e))
        })?;
        fs::write(path.as_ref(), content)?;
        Ok(())
    }

    pub fn polling_interval(&self) -> Duration {
        Duration::from_millis(self.polling_interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.nis.connect_timeout_secs)
    }

    pub fn socket_timeout(&self) -> Duration {
        Duration::from_secs(self.nis.socket_timeout_secs)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.nis.ping_interval_secs)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.nis.reconnect_delay_secs)
    }

    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_millis(self.watchdog.interval_ms)
    }

    /// Elapsed time after which a target without a fresh poll is unavailable
    pub fn staleness_window(&self) -> Duration {
        self.polling_interval() * self.watchdog.staleness_factor
    }

    /// Whether the ping sub-cycle runs: persistent mode with a polling
    /// interval longer than the socket timeout
    pub fn ping_enabled(&self) -> bool {
        self.connection_mode == ConnectionMode::Persistent
            && self.polling_interval() > self.socket_timeout()
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.targets.is_empty() {
            return Err(UpssyncError::Configuration(
                "at least one target must be configured".to_string(),
            ));
        }

        for target in &self.targets {
            if !is_valid_ipv4(&target.address) {
                return Err(UpssyncError::Configuration(format!(
                    "target address {:?} is not a dotted-quad IPv4 address",
                    target.address
                )));
            }
            if target.port == 0 {
                return Err(UpssyncError::Configuration(format!(
                    "target {} port must be > 0",
                    target.address
                )));
            }
        }

        if !(MIN_POLLING_INTERVAL_MS..=MAX_POLLING_INTERVAL_MS).contains(&self.polling_interval_ms)
        {
            return Err(UpssyncError::Configuration(format!(
                "polling_interval_ms must be {}-{}, got {}",
                MIN_POLLING_INTERVAL_MS, MAX_POLLING_INTERVAL_MS, self.polling_interval_ms
            )));
        }

        if self.nis.connect_timeout_secs == 0 || self.nis.socket_timeout_secs == 0 {
            return Err(UpssyncError::Configuration(
                "NIS timeouts must be > 0".to_string(),
            ));
        }

        if self.nis.ping_interval_secs == 0 {
            return Err(UpssyncError::Configuration(
                "ping_interval_secs must be > 0".to_string(),
            ));
        }

        if self.nis.max_reconnect_attempts == 0 {
            return Err(UpssyncError::Configuration(
                "max_reconnect_attempts must be > 0".to_string(),
            ));
        }

        if self.watchdog.interval_ms == 0 || self.watchdog.staleness_factor == 0 {
            return Err(UpssyncError::Configuration(
                "watchdog interval and staleness factor must be > 0".to_string(),
            ));
        }

        if self.database.backend == StoreBackend::Redis && self.database.redis_port == 0 {
            return Err(UpssyncError::Configuration(
                "redis_port must be > 0".to_string(),
            ));
        }

        Ok(())
    }
}
