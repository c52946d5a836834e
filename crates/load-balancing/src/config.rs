//! Configuration for load balancing and replica discovery.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{LbResult, LoadBalancingError};

/// Configuration for routing queries between the primary and its replicas.
///
/// # Example
///
/// ```
/// use helios_load_balancing::LoadBalancingConfig;
///
/// let config: LoadBalancingConfig = serde_json::from_str(
///     r#"{ "hosts": ["replica-1:5432", "replica-2:5432"], "max_replication_lag_time": "30s" }"#,
/// ).unwrap();
/// assert!(config.enabled());
/// assert_eq!(config.max_replication_difference, 8 * 1024 * 1024);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadBalancingConfig {
    /// Static replica addresses (`host` or `host:port`).
    #[serde(default)]
    pub hosts: Vec<String>,

    /// Maximum replication lag in bytes before a replica is considered stale.
    #[serde(default = "default_max_replication_difference")]
    pub max_replication_difference: u64,

    /// Maximum replication lag in time before a replica is considered stale.
    #[serde(with = "humantime_serde", default = "default_max_replication_lag_time")]
    pub max_replication_lag_time: Duration,

    /// How long a replica's online status is cached. Zero checks every time.
    #[serde(with = "humantime_serde", default = "default_replica_check_interval")]
    pub replica_check_interval: Duration,

    /// Lifetime of sticking records in the shared store.
    #[serde(with = "humantime_serde", default = "default_sticking_expiration")]
    pub sticking_expiration: Duration,

    /// Connection pool size for each replica.
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// DNS service discovery. When set, `hosts` is only the initial list.
    #[serde(default)]
    pub discover: Option<DiscoveryConfig>,
}

fn default_max_replication_difference() -> u64 {
    8 * 1024 * 1024
}

fn default_max_replication_lag_time() -> Duration {
    Duration::from_secs(60)
}

fn default_replica_check_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_sticking_expiration() -> Duration {
    Duration::from_secs(30)
}

fn default_pool_size() -> usize {
    10
}

impl Default for LoadBalancingConfig {
    fn default() -> Self {
        Self {
            hosts: Vec::new(),
            max_replication_difference: default_max_replication_difference(),
            max_replication_lag_time: default_max_replication_lag_time(),
            replica_check_interval: default_replica_check_interval(),
            sticking_expiration: default_sticking_expiration(),
            pool_size: default_pool_size(),
            discover: None,
        }
    }
}

impl LoadBalancingConfig {
    /// Returns true if reads may be sent to replicas at all.
    pub fn enabled(&self) -> bool {
        !self.hosts.is_empty() || self.discover.is_some()
    }

    /// Returns true if replicas are discovered through DNS.
    pub fn service_discovery_enabled(&self) -> bool {
        self.discover.is_some()
    }

    /// Validates the configuration.
    pub fn validate(&self) -> LbResult<()> {
        if self.pool_size == 0 {
            return Err(config_error("pool_size must be at least 1"));
        }
        if self.max_replication_difference == 0 {
            return Err(config_error("max_replication_difference must be positive"));
        }
        if self.max_replication_lag_time.is_zero() {
            return Err(config_error("max_replication_lag_time must be positive"));
        }
        if self.sticking_expiration.is_zero() {
            return Err(config_error("sticking_expiration must be positive"));
        }
        if self.hosts.iter().any(|h| h.trim().is_empty()) {
            return Err(config_error("hosts must not contain empty addresses"));
        }
        if let Some(discover) = &self.discover {
            discover.validate()?;
        }
        Ok(())
    }
}

/// DNS record type queried during service discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum RecordType {
    /// One address per record, using the primary's port.
    #[default]
    A,
    /// Target and port per record.
    Srv,
}

/// Configuration for DNS based replica discovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Nameserver to query.
    #[serde(default = "default_nameserver")]
    pub nameserver: String,

    /// Nameserver port.
    #[serde(default = "default_discovery_port")]
    pub port: u16,

    /// Record name to resolve.
    pub record: String,

    /// Record type to query.
    #[serde(default)]
    pub record_type: RecordType,

    /// Minimum time between two lookups.
    #[serde(with = "humantime_serde", default = "default_discovery_interval")]
    pub interval: Duration,

    /// How long a removed host may keep busy connections before it is closed.
    #[serde(with = "humantime_serde", default = "default_disconnect_timeout")]
    pub disconnect_timeout: Duration,

    /// Query the nameserver over TCP instead of UDP.
    #[serde(default)]
    pub use_tcp: bool,

    /// Upper bound of the random jitter added to each sleep.
    #[serde(with = "humantime_serde", default = "default_max_sleep_adjustment")]
    pub max_sleep_adjustment: Duration,
}

fn default_nameserver() -> String {
    "localhost".to_string()
}

fn default_discovery_port() -> u16 {
    8600
}

fn default_discovery_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_disconnect_timeout() -> Duration {
    Duration::from_secs(120)
}

fn default_max_sleep_adjustment() -> Duration {
    Duration::from_secs(10)
}

impl DiscoveryConfig {
    /// Creates a discovery configuration for `record` with default settings.
    pub fn new(record: impl Into<String>) -> Self {
        Self {
            nameserver: default_nameserver(),
            port: default_discovery_port(),
            record: record.into(),
            record_type: RecordType::default(),
            interval: default_discovery_interval(),
            disconnect_timeout: default_disconnect_timeout(),
            use_tcp: false,
            max_sleep_adjustment: default_max_sleep_adjustment(),
        }
    }

    /// Validates the configuration.
    pub fn validate(&self) -> LbResult<()> {
        if self.record.trim().is_empty() {
            return Err(config_error("discover.record must not be empty"));
        }
        if self.nameserver.trim().is_empty() {
            return Err(config_error("discover.nameserver must not be empty"));
        }
        if self.interval.is_zero() {
            return Err(config_error("discover.interval must be positive"));
        }
        Ok(())
    }
}

fn config_error(message: &str) -> LoadBalancingError {
    LoadBalancingError::Config {
        message: message.to_string(),
    }
}

mod humantime_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
