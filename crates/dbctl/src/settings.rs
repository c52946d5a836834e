//! Settings file shared by every command.

use std::path::Path;

use anyhow::Context;
use helios_load_balancing::LoadBalancingConfig;
use helios_reindexing::ReindexingConfig;
use serde::Deserialize;

/// Library configurations read from the JSON settings file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Settings {
    /// Replica hosts and discovery.
    #[serde(default)]
    pub load_balancing: LoadBalancingConfig,

    /// Rebuild strategy, schedule, selection and notifier.
    #[serde(default)]
    pub reindexing: ReindexingConfig,
}

impl Settings {
    /// Reads `path`, or returns the defaults without one.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings file {}", path.display()))?;
        Self::parse(&raw).with_context(|| format!("Invalid settings file {}", path.display()))
    }

    /// Parses and validates settings.
    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        let settings: Settings = serde_json::from_str(raw)?;
        settings.load_balancing.validate()?;
        settings.reindexing.validate()?;
        Ok(settings)
    }
}
