use core::time::Duration;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use object_store::ObjectStore;
use object_store::local::LocalFileSystem;

use crate::tuning::{
    EnsembleConfig, MonitorConfig, OrchestratorConfig, PromotionThresholds, SchedulerConfig,
    StatusConfig, TriggerThresholds,
};

const DEFAULT_DATABASE_URL: &str = "sqlite:aqi_forecast.db?mode=rwc";
const DEFAULT_DATA_DIR: &str = "./data";
const DEFAULT_EVALUATION_INTERVAL_MINUTES: u64 = 30;
const DEFAULT_MAX_CONCURRENT_RETRAINS: usize = 2;

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Database connection URL
    pub database_url: String,

    /// Root directory for persisted JSON documents (weights, schedule)
    pub data_dir: PathBuf,

    /// How often the trigger evaluator runs
    pub evaluation_interval: Duration,

    /// Upper bound on retraining runs executing at once
    pub max_concurrent_retrains: usize,

    /// Orchestrator timeouts, retries and promotion gate
    pub orchestrator: OrchestratorConfig,

    pub ensemble: EnsembleConfig,
    pub triggers: TriggerThresholds,
    pub scheduler: SchedulerConfig,
    pub monitor: MonitorConfig,
    pub status: StatusConfig,

    /// Optional file to mirror logs into
    pub log_file: Option<PathBuf>,
}

impl Config {
    /// Loads configuration from environment variables.
    ///
    /// All variables are optional:
    /// - `DATABASE_URL`: `SQLite` connection string (default: `sqlite:aqi_forecast.db?mode=rwc`)
    /// - `DATA_DIR`: directory for persisted documents (default: `./data`)
    /// - `EVALUATION_INTERVAL_MINUTES`: trigger evaluation cadence (default: 30)
    /// - `MAX_CONCURRENT_RETRAINS`: worker pool size (default: 2)
    /// - `RETRAIN_TIMEOUT_SECONDS`: hard limit on one training call (default: 3600)
    /// - `MAX_RMSE_THRESHOLD`: promotion gate on validation RMSE (default: 25.0)
    /// - `MIN_ACCURACY_THRESHOLD`: promotion gate on accuracy-within-20% (default: 70.0)
    /// - `LOG_FILE`: mirror logs into this file
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is set but cannot be parsed.
    pub fn from_env() -> anyhow::Result<Self> {
        // Load .env file
        dotenvy::dotenv().ok();

        let database_url =
            std::env::var("DATABASE_URL").unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string());

        let data_dir = std::env::var("DATA_DIR")
            .map_or_else(|_| PathBuf::from(DEFAULT_DATA_DIR), PathBuf::from);

        let evaluation_minutes: u64 =
            parse_var("EVALUATION_INTERVAL_MINUTES", DEFAULT_EVALUATION_INTERVAL_MINUTES)?;
        let max_concurrent_retrains: usize =
            parse_var("MAX_CONCURRENT_RETRAINS", DEFAULT_MAX_CONCURRENT_RETRAINS)?;

        let defaults = OrchestratorConfig::default();
        let retrain_timeout_seconds: u64 =
            parse_var("RETRAIN_TIMEOUT_SECONDS", defaults.retrain_timeout.as_secs())?;
        let max_rmse: f64 = parse_var("MAX_RMSE_THRESHOLD", defaults.promotion.max_rmse)?;
        let min_accuracy: f64 =
            parse_var("MIN_ACCURACY_THRESHOLD", defaults.promotion.min_accuracy)?;

        let orchestrator = OrchestratorConfig {
            retrain_timeout: Duration::from_secs(retrain_timeout_seconds),
            promotion: PromotionThresholds {
                max_rmse,
                min_accuracy,
            },
            ..defaults
        };

        let log_file = std::env::var("LOG_FILE").ok().map(PathBuf::from);

        Ok(Self {
            database_url,
            data_dir,
            evaluation_interval: Duration::from_secs(evaluation_minutes.max(1) * 60),
            max_concurrent_retrains: max_concurrent_retrains.max(1),
            orchestrator,
            ensemble: EnsembleConfig::default(),
            triggers: TriggerThresholds::default(),
            scheduler: SchedulerConfig::default(),
            monitor: MonitorConfig::default(),
            status: StatusConfig::default(),
            log_file,
        })
    }

    /// Creates the object store holding persisted JSON documents.
    ///
    /// # Errors
    ///
    /// Returns an error if the data directory cannot be created.
    pub fn object_store(&self) -> anyhow::Result<Arc<dyn ObjectStore>> {
        std::fs::create_dir_all(&self.data_dir).with_context(|| {
            format!("Failed to create data directory {}", self.data_dir.display())
        })?;

        let store = LocalFileSystem::new_with_prefix(&self.data_dir)
            .context("Failed to create object store")?;

        Ok(Arc::new(store))
    }
}

/// Reads and parses an environment variable, using `default` when unset.
fn parse_var<T>(name: &str, default: T) -> anyhow::Result<T>
where
    T: core::str::FromStr,
    T::Err: core::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|error| anyhow::anyhow!("Invalid value for {name} ({raw}): {error}")),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_var_default_when_unset() {
        let value: u64 = parse_var("AQI_TEST_SURELY_UNSET_VARIABLE", 42).expect("default");
        assert_eq!(value, 42);
    }
}
