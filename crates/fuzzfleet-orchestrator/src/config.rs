// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for fuzzfleet-orchestrator.

use std::path::PathBuf;
use std::time::Duration;

use tracing::warn;

/// How nodes that are ready for reset are disposed of.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum NodeDisposalStrategy {
    /// Reimage or delete through the cloud API and release protection.
    #[default]
    ScaleIn,
    /// Only release scale-in protection and let the autoscaler reap the VM.
    Decommission,
}

impl NodeDisposalStrategy {
    /// Parse a configured value. Unknown values fall back to `ScaleIn`.
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "scale_in" | "scalein" | "" => NodeDisposalStrategy::ScaleIn,
            // legacy misspelling still accepted
            "decommission" | "decomission" => NodeDisposalStrategy::Decommission,
            other => {
                warn!(
                    value = other,
                    error_code = "INVALID_CONFIGURATION",
                    "Unknown node disposal strategy, using scale_in"
                );
                NodeDisposalStrategy::ScaleIn
            }
        }
    }
}

/// Orchestrator configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite database file. `None` keeps everything in memory.
    pub database_path: Option<PathBuf>,
    /// Disposal strategy for reset-ready nodes.
    pub node_disposal_strategy: NodeDisposalStrategy,
    /// Period of the reconciliation loop.
    pub reconcile_interval: Duration,
    /// Run the retention worker.
    pub retention_enabled: bool,
    /// Period of the retention worker.
    pub retention_interval: Duration,
    /// Version agents and proxies are compared against.
    pub service_version: String,
    /// Region used when nothing else names one.
    pub base_region: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: None,
            node_disposal_strategy: NodeDisposalStrategy::ScaleIn,
            reconcile_interval: Duration::from_secs(30),
            retention_enabled: true,
            retention_interval: Duration::from_secs(24 * 60 * 60),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            base_region: "eastus".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let database_path = lookup("FUZZFLEET_DATABASE_PATH")
            .filter(|v| !v.is_empty())
            .map(PathBuf::from);

        let node_disposal_strategy = lookup("FUZZFLEET_NODE_DISPOSAL_STRATEGY")
            .map(|v| NodeDisposalStrategy::parse(&v))
            .unwrap_or_default();

        let reconcile_interval = parse_secs(
            &lookup,
            "FUZZFLEET_RECONCILE_INTERVAL_SECS",
            defaults.reconcile_interval,
        )?;

        let retention_enabled = lookup("FUZZFLEET_RETENTION_ENABLED")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(defaults.retention_enabled);

        let retention_interval = parse_secs(
            &lookup,
            "FUZZFLEET_RETENTION_INTERVAL_SECS",
            defaults.retention_interval,
        )?;

        let service_version =
            lookup("FUZZFLEET_SERVICE_VERSION").unwrap_or(defaults.service_version);

        let base_region = lookup("FUZZFLEET_BASE_REGION").unwrap_or(defaults.base_region);

        Ok(Self {
            database_path,
            node_disposal_strategy,
            reconcile_interval,
            retention_enabled,
            retention_interval,
            service_version,
            base_region,
        })
    }
}

fn parse_secs<F>(lookup: &F, var: &'static str, default: Duration) -> Result<Duration, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(var) {
        None => Ok(default),
        Some(value) => value
            .parse::<u64>()
            .ok()
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
            .ok_or(ConfigError::InvalidValue { var, value }),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A variable holds a value that cannot be used.
    #[error("Invalid value for {var}: {value}")]
    InvalidValue {
        /// Variable name.
        var: &'static str,
        /// Offending value.
        value: String,
    },
}
