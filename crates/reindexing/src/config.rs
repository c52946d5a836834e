//! Configuration for automatic reindexing.

use std::time::Duration;

use chrono::{DateTime, Datelike, Utc, Weekday};
use serde::{Deserialize, Serialize};

use crate::error::{ReindexError, ReindexResult};

const GIB: u64 = 1024 * 1024 * 1024;

/// How indexes are rebuilt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StrategyKind {
    /// Build a replacement index concurrently, swap names, drop the original.
    #[default]
    Replacement,
    /// `REINDEX INDEX CONCURRENTLY`.
    Native,
}

/// Configuration for automatic reindexing.
///
/// # Example
///
/// ```
/// use helios_reindexing::{ReindexingConfig, StrategyKind};
///
/// let config: ReindexingConfig = serde_json::from_str(
///     r#"{ "strategy": "native", "selection": { "cooldown": "7days" } }"#,
/// ).unwrap();
/// assert_eq!(config.strategy, StrategyKind::Native);
/// assert_eq!(config.max_indexes_per_invocation, 2);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReindexingConfig {
    /// Rebuild strategy.
    #[serde(default)]
    pub strategy: StrategyKind,

    /// Maximum number of indexes rebuilt per run.
    #[serde(default = "default_max_indexes_per_invocation")]
    pub max_indexes_per_invocation: usize,

    /// Lifetime of the cluster-wide reindexing lease.
    #[serde(with = "humantime_serde", default = "default_lease_timeout")]
    pub lease_timeout: Duration,

    /// Days on which rebuilds may run.
    #[serde(default)]
    pub schedule: ScheduleConfig,

    /// Candidate selection rules.
    #[serde(default)]
    pub selection: SelectionConfig,

    /// Annotation sink.
    #[serde(default)]
    pub notifier: NotifierConfig,

    /// Let the replacement strategy rebuild expression indexes.
    #[serde(default)]
    pub allow_expression_indexes: bool,

    /// Statement timeout while building a replacement index.
    #[serde(with = "humantime_serde", default = "default_replacement_statement_timeout")]
    pub replacement_statement_timeout: Duration,

    /// Statement timeout for `REINDEX INDEX CONCURRENTLY`.
    #[serde(with = "humantime_serde", default = "default_native_statement_timeout")]
    pub native_statement_timeout: Duration,
}

fn default_max_indexes_per_invocation() -> usize {
    2
}

fn default_lease_timeout() -> Duration {
    Duration::from_secs(24 * 60 * 60)
}

fn default_replacement_statement_timeout() -> Duration {
    Duration::from_secs(9 * 60 * 60)
}

fn default_native_statement_timeout() -> Duration {
    Duration::from_secs(24 * 60 * 60)
}

impl Default for ReindexingConfig {
    fn default() -> Self {
        Self {
            strategy: StrategyKind::default(),
            max_indexes_per_invocation: default_max_indexes_per_invocation(),
            lease_timeout: default_lease_timeout(),
            schedule: ScheduleConfig::default(),
            selection: SelectionConfig::default(),
            notifier: NotifierConfig::default(),
            allow_expression_indexes: false,
            replacement_statement_timeout: default_replacement_statement_timeout(),
            native_statement_timeout: default_native_statement_timeout(),
        }
    }
}

impl ReindexingConfig {
    /// Validates the configuration.
    pub fn validate(&self) -> ReindexResult<()> {
        if self.max_indexes_per_invocation == 0 {
            return Err(config_error("max_indexes_per_invocation must be at least 1"));
        }
        if self.lease_timeout.is_zero() {
            return Err(config_error("lease_timeout must be positive"));
        }
        if self.replacement_statement_timeout.is_zero() || self.native_statement_timeout.is_zero()
        {
            return Err(config_error("statement timeouts must be positive"));
        }
        self.selection.validate()?;
        Ok(())
    }
}

/// Days of the week on which rebuilds may start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleConfig {
    /// Allowed days, in UTC.
    #[serde(default = "default_days")]
    pub days: Vec<Weekday>,
}

fn default_days() -> Vec<Weekday> {
    vec![Weekday::Sat, Weekday::Sun]
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            days: default_days(),
        }
    }
}

impl ScheduleConfig {
    /// Every day of the week.
    pub fn always() -> Self {
        Self {
            days: vec![
                Weekday::Mon,
                Weekday::Tue,
                Weekday::Wed,
                Weekday::Thu,
                Weekday::Fri,
                Weekday::Sat,
                Weekday::Sun,
            ],
        }
    }

    /// Returns true if a rebuild may start at `now`.
    pub fn allows(&self, now: DateTime<Utc>) -> bool {
        self.days.contains(&now.weekday())
    }
}

/// Rules for picking indexes worth rebuilding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectionConfig {
    /// Indexes smaller than this are never rebuilt.
    #[serde(default = "default_minimum_index_size")]
    pub minimum_index_size: u64,

    /// Minimum share of estimated bloat.
    #[serde(default = "default_minimum_relative_bloat")]
    pub minimum_relative_bloat: f64,

    /// Indexes at least this large qualify regardless of relative bloat.
    #[serde(default = "default_large_index_size")]
    pub large_index_size: u64,

    /// Indexes rebuilt within this window are skipped.
    #[serde(with = "humantime_serde", default = "default_cooldown")]
    pub cooldown: Duration,

    /// Tables whose indexes are only rebuilt on `restricted_weekday`.
    #[serde(default)]
    pub restricted_tables: Vec<String>,

    /// The only day `restricted_tables` are eligible, in UTC.
    #[serde(default = "default_restricted_weekday")]
    pub restricted_weekday: Weekday,
}

fn default_minimum_index_size() -> u64 {
    GIB
}

fn default_minimum_relative_bloat() -> f64 {
    0.2
}

fn default_large_index_size() -> u64 {
    100 * GIB
}

fn default_cooldown() -> Duration {
    Duration::from_secs(10 * 24 * 60 * 60)
}

fn default_restricted_weekday() -> Weekday {
    Weekday::Sun
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            minimum_index_size: default_minimum_index_size(),
            minimum_relative_bloat: default_minimum_relative_bloat(),
            large_index_size: default_large_index_size(),
            cooldown: default_cooldown(),
            restricted_tables: Vec::new(),
            restricted_weekday: default_restricted_weekday(),
        }
    }
}

impl SelectionConfig {
    /// Validates the configuration.
    pub fn validate(&self) -> ReindexResult<()> {
        if !(0.0..=1.0).contains(&self.minimum_relative_bloat) {
            return Err(config_error(
                "selection.minimum_relative_bloat must be between 0 and 1",
            ));
        }
        if self.large_index_size < self.minimum_index_size {
            return Err(config_error(
                "selection.large_index_size must not be below minimum_index_size",
            ));
        }
        Ok(())
    }
}

/// Annotation sink settings. Without both URL and key, nothing is sent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotifierConfig {
    /// Base URL of the annotation API.
    #[serde(default)]
    pub api_url: Option<String>,

    /// Bearer token for the annotation API.
    #[serde(default)]
    pub api_key: Option<String>,

    /// Extra tag added to every annotation.
    #[serde(default)]
    pub additional_tag: Option<String>,
}

impl NotifierConfig {
    /// Returns true if annotations can be sent.
    pub fn enabled(&self) -> bool {
        self.api_url.as_deref().is_some_and(|u| !u.is_empty())
            && self.api_key.as_deref().is_some_and(|k| !k.is_empty())
    }
}

fn config_error(message: &str) -> ReindexError {
    ReindexError::Config {
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
