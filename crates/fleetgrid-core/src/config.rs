//! fleetd.toml configuration parser.
//!
//! Every section is optional; missing keys fall back to the defaults below.
//! Command line flags of `fleetd` are applied on top of the parsed file.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Upper bound for the number of groups a single rollout may be split into.
pub const DEFAULT_MAX_GROUPS: u32 = 500;
/// Upper bound for `scheduler.lease_ttl_secs` (one day).
pub const MAX_LEASE_TTL_SECS: u64 = 86_400;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("cannot parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    pub store: StoreConfig,
    pub scheduler: SchedulerConfig,
    pub engine: EngineConfig,
    pub api: ApiConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub data_dir: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/fleetgrid"),
        }
    }
}

impl StoreConfig {
    /// Path of the redb file inside `data_dir`.
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("fleetgrid.redb")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub interval_secs: u64,
    pub lease_ttl_secs: u64,
    pub max_parallel: usize,
    pub node_id: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval_secs: 10,
            lease_ttl_secs: 60,
            max_parallel: 4,
            node_id: "standalone".to_string(),
        }
    }
}

/// Integer rounding applied when comparing a count against a percentage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PercentRounding {
    /// `n * 100 / d >= p`
    #[default]
    Truncate,
    /// `(n * 100 + d / 2) / d >= p`
    RoundHalfUp,
}

/// What a tripped error condition with error action `none` does.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoneErrorAction {
    /// Logged and published, progress is unaffected.
    #[default]
    Informational,
    /// The group moves to ERROR and the rollout continues with the next group.
    MarkGroupError,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub percent_rounding: PercentRounding,
    pub none_error_action: NoneErrorAction,
    pub max_groups: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            percent_rounding: PercentRounding::default(),
            none_error_action: NoneErrorAction::default(),
            max_groups: DEFAULT_MAX_GROUPS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub port: u16,
    /// Check caller permissions on every operator call. Off by default, in
    /// which case every caller may do everything.
    pub enforce_permissions: bool,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            port: 8443,
            enforce_permissions: false,
        }
    }
}

impl FleetConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: FleetConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scheduler.interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "scheduler.interval_secs must be positive".into(),
            ));
        }
        if self.scheduler.lease_ttl_secs == 0 || self.scheduler.lease_ttl_secs > MAX_LEASE_TTL_SECS
        {
            return Err(ConfigError::Invalid(format!(
                "scheduler.lease_ttl_secs must be within 1..={MAX_LEASE_TTL_SECS}"
            )));
        }
        if self.scheduler.max_parallel == 0 {
            return Err(ConfigError::Invalid(
                "scheduler.max_parallel must be positive".into(),
            ));
        }
        if self.scheduler.node_id.trim().is_empty() {
            return Err(ConfigError::Invalid("scheduler.node_id is empty".into()));
        }
        if self.engine.max_groups == 0 || self.engine.max_groups > DEFAULT_MAX_GROUPS {
            return Err(ConfigError::Invalid(format!(
                "engine.max_groups must be within 1..={DEFAULT_MAX_GROUPS}"
            )));
        }
        Ok(())
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Scaffold a fleetd.toml for a node storing its data under `data_dir`.
    pub fn scaffold(node_id: &str, data_dir: &Path) -> Self {
        FleetConfig {
            store: StoreConfig {
                data_dir: data_dir.to_path_buf(),
            },
            scheduler: SchedulerConfig {
                node_id: node_id.to_string(),
                ..SchedulerConfig::default()
            },
            engine: EngineConfig::default(),
            api: ApiConfig::default(),
        }
    }
}
