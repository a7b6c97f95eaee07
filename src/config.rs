//! Configuration for the capacity engine
//!
//! CLI arguments and environment variable handling using clap, plus the
//! runtime knobs library consumers set directly through [`EngineConfig`].

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};

use crate::error::{CapacityError, Result};
use crate::model::{InitiativeId, ProjectId, WorkerId};

/// Capacity engine operator tool
#[derive(Parser, Debug, Clone)]
#[command(name = "capacity-engine")]
#[command(about = "Workload capacity checks and alerts over the allocation store")]
pub struct Args {
    /// SQLite database holding workers and commitments
    #[arg(long, env = "CAPACITY_DB_PATH", default_value = "capacity.db")]
    pub db_path: PathBuf,

    /// JSON file backing the fallback store (in-memory only if unset)
    #[arg(long, env = "CAPACITY_FALLBACK_PATH")]
    pub fallback_path: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Emit logs as JSON lines
    #[arg(long, env = "LOG_JSON", default_value = "false")]
    pub log_json: bool,

    /// Dashboard cache TTL in seconds
    #[arg(long, env = "CACHE_TTL_SECS", default_value = "300")]
    pub cache_ttl_secs: u64,

    /// Interval between expired-entry sweeps in seconds
    #[arg(long, env = "CACHE_SWEEP_INTERVAL_SECS", default_value = "60")]
    pub cache_sweep_interval_secs: u64,

    /// Interval between capacity alert passes in seconds
    #[arg(long, env = "ALERT_INTERVAL_SECS", default_value = "300")]
    pub alert_interval_secs: u64,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Print a worker's live workload snapshot
    Snapshot {
        worker: WorkerId,
    },

    /// Check whether a project involvement would be admitted
    Validate {
        worker: WorkerId,
        /// Proposed involvement, in percent
        percent: f64,
        /// Commitment being revised, excluded from the current total
        #[arg(long)]
        exclude_project: Option<ProjectId>,
    },

    /// Check whether an initiative workload would be admitted
    ValidateInitiative {
        worker: WorkerId,
        /// Proposed workload, in percent
        percent: f64,
        #[arg(long)]
        exclude_initiative: Option<InitiativeId>,
    },

    /// Print snapshots for every active worker
    Fleet,

    /// Evaluate capacity alerts
    Alerts {
        /// Run a single pass and exit instead of looping until interrupted
        #[arg(long)]
        once: bool,
    },
}

impl Args {
    pub fn validate(&self) -> Result<()> {
        if self.cache_ttl_secs == 0 {
            return Err(CapacityError::Config("CACHE_TTL_SECS must be greater than 0".into()));
        }
        if self.cache_sweep_interval_secs == 0 {
            return Err(CapacityError::Config(
                "CACHE_SWEEP_INTERVAL_SECS must be greater than 0".into(),
            ));
        }
        if self.alert_interval_secs == 0 {
            return Err(CapacityError::Config("ALERT_INTERVAL_SECS must be greater than 0".into()));
        }
        if self.fallback_path.as_ref() == Some(&self.db_path) {
            return Err(CapacityError::Config(
                "CAPACITY_FALLBACK_PATH must differ from CAPACITY_DB_PATH".into(),
            ));
        }
        Ok(())
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            cache_ttl: Duration::from_secs(self.cache_ttl_secs),
            sweep_interval: Duration::from_secs(self.cache_sweep_interval_secs),
            alert_interval: Duration::from_secs(self.alert_interval_secs),
        }
    }
}

/// Runtime settings for the engine's components
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// How long a dashboard snapshot may be served from cache
    pub cache_ttl: Duration,
    pub sweep_interval: Duration,
    pub alert_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(300),     // 5 minutes
            sweep_interval: Duration::from_secs(60), // Every minute
            alert_interval: Duration::from_secs(300),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Args {
        Args::try_parse_from(std::iter::once("capacity-engine").chain(args.iter().copied()))
            .unwrap()
    }

    #[test]
    fn test_defaults_and_engine_config() {
        let args = parse(&["fleet"]);
        assert!(args.validate().is_ok());

        let config = args.engine_config();
        assert_eq!(config.cache_ttl, Duration::from_secs(300));
        assert_eq!(config.sweep_interval, Duration::from_secs(60));
    }

    #[test]
    fn test_validate_subcommand_parses_ids() {
        let args = parse(&["validate", "4", "12.5", "--exclude-project", "9"]);
        match args.command {
            Command::Validate { worker, percent, exclude_project } => {
                assert_eq!(worker.get(), 4);
                assert_eq!(percent, 12.5);
                assert_eq!(exclude_project.map(|p| p.get()), Some(9));
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_rejects_non_positive_worker() {
        let result = Args::try_parse_from(["capacity-engine", "snapshot", "0"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_validate_rejects_zero_ttl() {
        let args = parse(&["--cache-ttl-secs", "0", "fleet"]);
        assert!(matches!(args.validate(), Err(CapacityError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_shared_path() {
        let args = parse(&["--db-path", "a.db", "--fallback-path", "a.db", "fleet"]);
        assert!(args.validate().is_err());
    }
}
