//! Health status and run-history aggregates.

use std::collections::BTreeMap;

use config::StatusConfig;
use database::{RetrainingResultRepository, StoreError};
use forecast_structs::{EnsembleWeights, ModelKind, RetrainingResult, VersionComparison};
use serde::Serialize;
use sqlx::SqlitePool;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SystemStatus {
    Healthy,
    Degraded,
}

/// Derives health from the most recent results (newest first) and the queue load.
#[must_use]
pub fn system_status(
    recent: &[RetrainingResult],
    active_tasks: usize,
    capacity: usize,
    config: &StatusConfig,
) -> SystemStatus {
    if active_tasks > capacity {
        return SystemStatus::Degraded;
    }

    let window = &recent[..recent.len().min(config.recent_results)];
    if window.is_empty() {
        return SystemStatus::Healthy;
    }

    let successes = window.iter().filter(|result| result.success).count();
    if (successes as f64 / window.len() as f64) < config.min_success_rate {
        SystemStatus::Degraded
    } else {
        SystemStatus::Healthy
    }
}

/// Aggregates over persisted retraining runs.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetrainingReport {
    pub total_runs: usize,
    pub successful_runs: usize,
    pub success_rate: f64,
    pub mean_duration_seconds: f64,
    /// Times each model was promoted.
    pub promotions: BTreeMap<ModelKind, usize>,
}

impl RetrainingReport {
    #[must_use]
    pub fn from_results(results: &[RetrainingResult]) -> Self {
        let total_runs = results.len();
        let successful_runs = results.iter().filter(|result| result.success).count();

        let mut promotions: BTreeMap<ModelKind, usize> =
            ModelKind::all().map(|kind| (kind, 0)).collect();
        for kind in results.iter().flat_map(RetrainingResult::promoted_models) {
            *promotions.entry(kind).or_default() += 1;
        }

        let (success_rate, mean_duration_seconds) = if total_runs == 0 {
            (0.0, 0.0)
        } else {
            let total_duration: f64 = results.iter().map(|result| result.duration_seconds).sum();
            (
                successful_runs as f64 / total_runs as f64,
                total_duration / total_runs as f64,
            )
        };

        Self {
            total_runs,
            successful_runs,
            success_rate,
            mean_duration_seconds,
            promotions,
        }
    }
}

/// Everything the status surface shows.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusReport {
    pub status: SystemStatus,
    pub active_tasks: usize,
    pub capacity: usize,
    pub weights: EnsembleWeights,
    pub report: RetrainingReport,
    /// Newest registered versions per model with their validation RMSE.
    pub versions: BTreeMap<ModelKind, Vec<VersionComparison>>,
}

impl StatusReport {
    /// Reads the last `history` results and combines them with the live state.
    ///
    /// # Errors
    ///
    /// Returns an error if the result history cannot be read.
    pub async fn collect(
        pool: &SqlitePool,
        weights: EnsembleWeights,
        active_tasks: usize,
        capacity: usize,
        history: u32,
        config: &StatusConfig,
    ) -> Result<Self, StoreError> {
        let results = RetrainingResultRepository::list_recent(pool, history).await?;

        Ok(Self {
            status: system_status(&results, active_tasks, capacity, config),
            active_tasks,
            capacity,
            weights,
            report: RetrainingReport::from_results(&results),
            versions: BTreeMap::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use forecast_structs::{ModelScope, RetrainingTrigger, RunFailure};
    use uuid::Uuid;

    use super::*;
    use crate::test_support::pool;

    fn result(success: bool, duration_seconds: f64, promoted: &[ModelKind]) -> RetrainingResult {
        RetrainingResult {
            id: Uuid::new_v4(),
            trigger: RetrainingTrigger::manual(ModelScope::Ensemble, "test"),
            models_retrained: ModelKind::all().collect(),
            duration_seconds,
            validation_results: BTreeMap::new(),
            promotion_results: ModelKind::all()
                .map(|kind| (kind, promoted.contains(&kind)))
                .collect(),
            success,
            error: (!success).then(|| RunFailure::fatal("gate")),
            completed_at: Utc::now(),
        }
    }

    #[test]
    fn test_no_history_is_healthy() {
        assert_eq!(system_status(&[], 0, 2, &StatusConfig::default()), SystemStatus::Healthy);
    }

    #[test]
    fn test_low_success_rate_is_degraded() {
        let config = StatusConfig::default();
        let mut results: Vec<_> = (0..6).map(|_| result(false, 10.0, &[])).collect();
        results.extend((0..4).map(|_| result(true, 10.0, &[ModelKind::Recurrent])));
        assert_eq!(system_status(&results, 0, 2, &config), SystemStatus::Degraded);

        let results: Vec<_> = (0..10).map(|i| result(i % 2 == 0, 10.0, &[])).collect();
        let status = system_status(&results, 0, 2, &config);
        assert_eq!(status, SystemStatus::Healthy, "exactly half");
    }

    #[test]
    fn test_only_recent_results_count() {
        let config = StatusConfig::default();
        // Newest first: ten successes, then a long failing tail.
        let mut results: Vec<_> = (0..10).map(|_| result(true, 10.0, &[])).collect();
        results.extend((0..30).map(|_| result(false, 10.0, &[])));
        assert_eq!(system_status(&results, 0, 2, &config), SystemStatus::Healthy);
    }

    #[test]
    fn test_overloaded_queue_is_degraded() {
        let results = vec![result(true, 10.0, &[])];
        let config = StatusConfig::default();
        assert_eq!(system_status(&results, 2, 2, &config), SystemStatus::Healthy);
        assert_eq!(system_status(&results, 3, 2, &config), SystemStatus::Degraded);
    }

    #[test]
    fn test_report_aggregates() {
        let results = vec![
            result(true, 30.0, &[ModelKind::Recurrent, ModelKind::GradientBoost]),
            result(true, 50.0, &[ModelKind::Recurrent]),
            result(false, 10.0, &[]),
            result(false, 30.0, &[]),
        ];
        let report = RetrainingReport::from_results(&results);

        assert_eq!(report.total_runs, 4);
        assert_eq!(report.successful_runs, 2);
        assert!((report.success_rate - 0.5).abs() < f64::EPSILON);
        assert!((report.mean_duration_seconds - 30.0).abs() < f64::EPSILON);
        assert_eq!(report.promotions[&ModelKind::Recurrent], 2);
        assert_eq!(report.promotions[&ModelKind::GradientBoost], 1);
        assert_eq!(report.promotions[&ModelKind::GraphSpatial], 0);
    }

    #[test]
    fn test_empty_report() {
        let report = RetrainingReport::from_results(&[]);
        assert_eq!(report.total_runs, 0);
        assert!(report.success_rate.abs() < f64::EPSILON);
        assert!(report.mean_duration_seconds.abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_collect_reads_history() {
        let pool = pool().await;
        for success in [true, false, false] {
            RetrainingResultRepository::insert(&pool, &result(success, 20.0, &[]))
                .await
                .expect("insert");
        }

        let weights = EnsembleWeights::equal(ModelKind::all());
        let config = StatusConfig::default();
        let status = StatusReport::collect(&pool, weights.clone(), 0, 2, 100, &config)
            .await
            .expect("collect");

        assert_eq!(status.status, SystemStatus::Degraded);
        assert_eq!(status.report.total_runs, 3);
        assert_eq!(status.weights, weights);

        let json = serde_json::to_value(&status).expect("json");
        assert_eq!(json["status"], "degraded");
    }
}
