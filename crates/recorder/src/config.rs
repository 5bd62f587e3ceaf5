//! Recorder configuration

use anyhow::{Context, Result};
use recorder_lib::{EngineConfig, ManagerIdentity};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

/// Base name of the optional config file (`.toml`, `.yaml` or `.json`)
pub const CONFIG_FILE: &str = "kube-recorder";

/// Prefix of the environment overrides, e.g. `RECORDER_DATABASE_PATH`
pub const ENV_PREFIX: &str = "RECORDER";

/// Recorder configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RecorderConfig {
    /// SQLite database file
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,

    /// Snapshot file rewritten by the cluster poller
    #[serde(default = "default_snapshot_path")]
    pub snapshot_path: PathBuf,

    /// JSON schema definition; the built-in catalog when unset
    #[serde(default)]
    pub schema_path: Option<PathBuf>,

    /// Recording tick in seconds
    #[serde(default = "default_short_interval")]
    pub short_interval_secs: u64,

    /// Average rollup period in seconds
    #[serde(default = "default_long_interval")]
    pub long_interval_secs: u64,

    /// Cluster name used when the snapshot carries none
    #[serde(default = "default_cluster_name")]
    pub cluster_name: String,

    #[serde(default = "default_manager_name")]
    pub manager_name: String,

    #[serde(default = "default_manager_ip")]
    pub manager_ip: String,

    /// Minutes between the tick counter and the agent time
    #[serde(default)]
    pub bias_minutes: i64,

    /// Advance the shared clock record on every tick
    #[serde(default = "default_manage_clock")]
    pub manage_clock: bool,

    /// API server port for health/metrics
    #[serde(default = "default_api_port")]
    pub api_port: u16,
}

fn default_database_path() -> PathBuf {
    PathBuf::from("/var/lib/kube-recorder/recorder.db")
}

fn default_snapshot_path() -> PathBuf {
    PathBuf::from("/var/lib/kube-recorder/snapshot.json")
}

fn default_short_interval() -> u64 {
    10
}

fn default_long_interval() -> u64 {
    600
}

fn default_cluster_name() -> String {
    "kubernetes".to_string()
}

fn default_manager_name() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "kube-recorder".to_string())
}

fn default_manager_ip() -> String {
    std::env::var("POD_IP").unwrap_or_else(|_| "127.0.0.1".to_string())
}

fn default_manage_clock() -> bool {
    true
}

fn default_api_port() -> u16 {
    8080
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            snapshot_path: default_snapshot_path(),
            schema_path: None,
            short_interval_secs: default_short_interval(),
            long_interval_secs: default_long_interval(),
            cluster_name: default_cluster_name(),
            manager_name: default_manager_name(),
            manager_ip: default_manager_ip(),
            bias_minutes: 0,
            manage_clock: default_manage_clock(),
            api_port: default_api_port(),
        }
    }
}

impl RecorderConfig {
    /// Load configuration from the optional config file and the environment
    pub fn load() -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::with_name(CONFIG_FILE).required(false))
            .add_source(config::Environment::with_prefix(ENV_PREFIX).try_parsing(true))
            .build()
            .context("Failed to read recorder configuration")?;

        let config: Self = config
            .try_deserialize()
            .context("Invalid recorder configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the loop cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.short_interval_secs == 0 {
            anyhow::bail!("short_interval_secs must be positive");
        }
        if self.long_interval_secs == 0 {
            anyhow::bail!("long_interval_secs must be positive");
        }
        if self.long_interval_secs % self.short_interval_secs != 0 {
            warn!(
                short = self.short_interval_secs,
                long = self.long_interval_secs,
                "Long interval is not a multiple of the short interval; rollups fire on common multiples only"
            );
        }
        Ok(())
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            manager: ManagerIdentity {
                name: self.manager_name.clone(),
                ip: self.manager_ip.clone(),
            },
            cluster_name: self.cluster_name.clone(),
            short_interval: Duration::from_secs(self.short_interval_secs),
            long_interval: Duration::from_secs(self.long_interval_secs),
            bias_minutes: self.bias_minutes,
            manage_clock: self.manage_clock,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = RecorderConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.short_interval_secs, 10);
        assert_eq!(config.long_interval_secs, 600);
        assert!(config.schema_path.is_none());
    }

    #[test]
    fn test_zero_intervals_rejected() {
        let short = RecorderConfig {
            short_interval_secs: 0,
            ..RecorderConfig::default()
        };
        assert!(short.validate().is_err());

        let long = RecorderConfig {
            long_interval_secs: 0,
            ..RecorderConfig::default()
        };
        assert!(long.validate().is_err());
    }

    #[test]
    fn test_non_multiple_intervals_allowed() {
        let config = RecorderConfig {
            short_interval_secs: 7,
            long_interval_secs: 10,
            ..RecorderConfig::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_deserialize_partial_file() {
        let config: RecorderConfig = config::Config::builder()
            .add_source(config::File::from_str(
                "database_path = \"/tmp/r.db\"\nlong_interval_secs = 300\nmanage_clock = false",
                config::FileFormat::Toml,
            ))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert_eq!(config.database_path, PathBuf::from("/tmp/r.db"));
        assert_eq!(config.long_interval_secs, 300);
        assert_eq!(config.short_interval_secs, 10);
        assert!(!config.manage_clock);
    }

    #[test]
    fn test_engine_config_mapping() {
        let config = RecorderConfig {
            manager_name: "mgr".to_string(),
            manager_ip: "10.1.1.1".to_string(),
            bias_minutes: 540,
            ..RecorderConfig::default()
        };
        let engine = config.engine_config();

        assert_eq!(engine.manager.name, "mgr");
        assert_eq!(engine.manager.ip, "10.1.1.1");
        assert_eq!(engine.short_interval, Duration::from_secs(10));
        assert_eq!(engine.long_interval, Duration::from_secs(600));
        assert_eq!(engine.bias_minutes, 540);
    }
}
