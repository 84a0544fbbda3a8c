//! Trigger evaluation.
//!
//! The checks are pure functions over recent data. [`TriggerEvaluator`] only
//! gathers their inputs and concatenates their output; it never starts work.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use config::TriggerThresholds;
use forecast_structs::{
    ModelKind, ModelScope, PerformanceSample, Pollutant, RetrainingTrigger, Severity, TriggerType,
};
use strum::IntoEnumIterator;
use tracing::{debug, info, warn};

use crate::data_source::TrainingDataSource;
use crate::monitor::PerformanceMonitor;
use crate::scheduler::ScheduleStore;
use crate::tracker::ExperimentTracker;

/// Compares a model's newest samples with its earlier ones.
///
/// `samples` must be ordered newest first. Fewer than the configured minimum
/// produces nothing.
#[must_use]
pub fn check_performance(
    model: ModelKind,
    samples: &[PerformanceSample],
    thresholds: &TriggerThresholds,
) -> Vec<RetrainingTrigger> {
    let recent_count = thresholds.recent_sample_count.max(1);
    if samples.len() < thresholds.min_performance_samples.max(recent_count + 1) {
        return Vec::new();
    }

    let (recent, historical) = samples.split_at(recent_count);
    let mut triggers = Vec::new();

    let recent_rmse = mean(recent.iter().map(|sample| sample.rmse));
    let historical_rmse = mean(historical.iter().map(|sample| sample.rmse));
    if historical_rmse > 0.0 {
        let degradation = (recent_rmse - historical_rmse) / historical_rmse;
        if degradation > thresholds.rmse_degradation {
            let severity = if degradation > thresholds.rmse_degradation_critical {
                Severity::Critical
            } else {
                Severity::High
            };
            triggers.push(
                RetrainingTrigger::new(
                    TriggerType::Performance,
                    model.into(),
                    thresholds.rmse_degradation,
                    degradation,
                    severity,
                )
                .with_metadata("metric", "rmse")
                .with_metadata("recent", recent_rmse)
                .with_metadata("historical", historical_rmse),
            );
        }
    }

    let recent_accuracy = mean(recent.iter().map(|sample| sample.accuracy));
    let historical_accuracy = mean(historical.iter().map(|sample| sample.accuracy));
    if historical_accuracy > 0.0 {
        let drop = (historical_accuracy - recent_accuracy) / historical_accuracy;
        if drop > thresholds.accuracy_drop {
            let severity = if drop > thresholds.accuracy_drop_critical {
                Severity::Critical
            } else {
                Severity::High
            };
            triggers.push(
                RetrainingTrigger::new(
                    TriggerType::Performance,
                    model.into(),
                    thresholds.accuracy_drop,
                    drop,
                    severity,
                )
                .with_metadata("metric", "accuracy")
                .with_metadata("recent", recent_accuracy)
                .with_metadata("historical", historical_accuracy),
            );
        }
    }

    triggers
}

/// Compares the recent distribution of a pollutant with an earlier window.
///
/// Skipped when either window is below the minimum sample count, and for
/// each statistic whose historical value is zero.
#[must_use]
pub fn check_drift(
    pollutant: Pollutant,
    recent: &[f64],
    historical: &[f64],
    thresholds: &TriggerThresholds,
) -> Vec<RetrainingTrigger> {
    let minimum = thresholds.drift_min_samples;
    if recent.len() < minimum || historical.len() < minimum {
        return Vec::new();
    }

    let mut triggers = Vec::new();
    let recent_mean = mean(recent.iter().copied());
    let historical_mean = mean(historical.iter().copied());

    if historical_mean.abs() > 0.0 {
        let shift = (recent_mean - historical_mean).abs() / historical_mean.abs();
        if shift > thresholds.mean_shift {
            let severity = if shift > thresholds.mean_shift_critical {
                Severity::Critical
            } else {
                Severity::High
            };
            triggers.push(
                RetrainingTrigger::new(
                    TriggerType::Drift,
                    ModelScope::Ensemble,
                    thresholds.mean_shift,
                    shift,
                    severity,
                )
                .with_metadata("pollutant", pollutant.to_string())
                .with_metadata("drift_type", "mean_shift")
                .with_metadata("recent_mean", recent_mean)
                .with_metadata("historical_mean", historical_mean),
            );
        }
    }

    let historical_std = sample_std(historical, historical_mean);
    if historical_std > 0.0 {
        let ratio = sample_std(recent, recent_mean) / historical_std;
        let breached = if ratio < thresholds.variance_ratio_low {
            Some(thresholds.variance_ratio_low)
        } else if ratio > thresholds.variance_ratio_high {
            Some(thresholds.variance_ratio_high)
        } else {
            None
        };

        if let Some(bound) = breached {
            let severity = if ratio > thresholds.variance_ratio_severe_high
                || ratio < thresholds.variance_ratio_severe_low
            {
                Severity::High
            } else {
                Severity::Medium
            };
            triggers.push(
                RetrainingTrigger::new(
                    TriggerType::Drift,
                    ModelScope::Ensemble,
                    bound,
                    ratio,
                    severity,
                )
                .with_metadata("pollutant", pollutant.to_string())
                .with_metadata("drift_type", "variance_shift"),
            );
        }
    }

    triggers
}

/// Flags a model whose newest version is older than its interval.
///
/// A model with no registered version gets a bootstrap trigger.
#[must_use]
pub fn check_schedule(
    model: ModelKind,
    latest_version_at: Option<DateTime<Utc>>,
    interval_days: f64,
    now: DateTime<Utc>,
) -> Option<RetrainingTrigger> {
    let Some(trained_at) = latest_version_at else {
        return Some(
            RetrainingTrigger::new(
                TriggerType::Schedule,
                model.into(),
                interval_days,
                0.0,
                Severity::High,
            )
            .with_metadata("reason", "no_registered_version"),
        );
    };

    let age_days = (now - trained_at).num_seconds() as f64 / 86_400.0;
    if age_days <= interval_days {
        return None;
    }

    let severity = if age_days > interval_days * 2.0 {
        Severity::Critical
    } else {
        Severity::Medium
    };
    Some(
        RetrainingTrigger::new(
            TriggerType::Schedule,
            model.into(),
            interval_days,
            age_days,
            severity,
        )
        .with_metadata("trained_at", trained_at.to_rfc3339()),
    )
}

/// Gathers inputs for the three checks and returns every trigger they raise.
pub struct TriggerEvaluator {
    thresholds: TriggerThresholds,
    call_timeout: Duration,
    monitor: Arc<PerformanceMonitor>,
    tracker: Arc<dyn ExperimentTracker>,
    data: Arc<dyn TrainingDataSource>,
    schedule: ScheduleStore,
}

impl TriggerEvaluator {
    #[must_use]
    pub fn new(
        thresholds: TriggerThresholds,
        call_timeout: Duration,
        monitor: Arc<PerformanceMonitor>,
        tracker: Arc<dyn ExperimentTracker>,
        data: Arc<dyn TrainingDataSource>,
        schedule: ScheduleStore,
    ) -> Self {
        Self {
            thresholds,
            call_timeout,
            monitor,
            tracker,
            data,
            schedule,
        }
    }

    /// Runs every check. A check whose inputs cannot be read is skipped.
    pub async fn evaluate(&self) -> Vec<RetrainingTrigger> {
        let mut triggers = self.evaluate_performance().await;
        triggers.extend(self.evaluate_drift().await);
        triggers.extend(self.evaluate_schedule().await);

        if triggers.is_empty() {
            debug!("No retraining triggers");
        } else {
            info!(count = triggers.len(), "Retraining triggers raised");
        }
        triggers
    }

    async fn evaluate_performance(&self) -> Vec<RetrainingTrigger> {
        let mut triggers = Vec::new();
        for model in ModelKind::all() {
            let samples = self
                .monitor
                .get_model_performance(Some(model.as_str()), self.thresholds.performance_window)
                .await;
            triggers.extend(check_performance(model, &samples, &self.thresholds));
        }
        triggers
    }

    async fn evaluate_drift(&self) -> Vec<RetrainingTrigger> {
        let now = Utc::now();
        let recent_start = now - chrono::Duration::days(self.thresholds.drift_recent_days);
        let history_start = now - chrono::Duration::days(self.thresholds.drift_history_days);

        let mut triggers = Vec::new();
        for pollutant in Pollutant::iter() {
            let windows = tokio::time::timeout(self.call_timeout, async {
                let recent = self.data.pollutant_values(pollutant, recent_start, now).await?;
                let historical = self
                    .data
                    .pollutant_values(pollutant, history_start, recent_start)
                    .await?;
                Ok::<_, database::StoreError>((recent, historical))
            })
            .await;

            match windows {
                Ok(Ok((recent, historical))) => {
                    triggers.extend(check_drift(pollutant, &recent, &historical, &self.thresholds));
                }
                Ok(Err(error)) => warn!(%error, %pollutant, "Drift check skipped"),
                Err(_) => warn!(%pollutant, "Drift check timed out"),
            }
        }
        triggers
    }

    async fn evaluate_schedule(&self) -> Vec<RetrainingTrigger> {
        let schedule = self.schedule.load().await;
        let now = Utc::now();

        let mut triggers = Vec::new();
        for model in ModelKind::all() {
            let lookup = self.tracker.get_latest_versions(model, &[]);
            let versions = tokio::time::timeout(self.call_timeout, lookup).await;

            let latest = match versions {
                Ok(Ok(versions)) => versions.iter().map(|version| version.created_at).max(),
                Ok(Err(error)) => {
                    warn!(%error, model = %model, "Schedule check skipped");
                    continue;
                }
                Err(_) => {
                    warn!(model = %model, "Schedule check timed out");
                    continue;
                }
            };

            triggers.extend(check_schedule(model, latest, schedule.days_for(model), now));
        }
        triggers
    }
}

fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, count) = values.fold((0.0, 0usize), |(sum, count), value| (sum + value, count + 1));
    if count == 0 { 0.0 } else { sum / count as f64 }
}

/// Sample standard deviation (n − 1).
fn sample_std(values: &[f64], mean: f64) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let squared: f64 = values.iter().map(|value| (value - mean).powi(2)).sum();
    (squared / (values.len() - 1) as f64).sqrt()
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::Duration as ChronoDuration;
    use config::MonitorConfig;
    use database::ObservationRepository;
    use forecast_structs::{ModelStage, RunRecord};

    use super::*;
    use crate::data_source::{SqlDataSource, fixtures};
    use crate::test_support::{pool, store};
    use crate::tracker::SqlTracker;

    /// Newest first: `recent` repeated three times, then `historical` five times.
    fn samples(recent: (f64, f64), historical: (f64, f64)) -> Vec<PerformanceSample> {
        let now = Utc::now();
        let sample = |(rmse, accuracy): (f64, f64), age: i64| PerformanceSample {
            model_name: "recurrent".to_string(),
            model_version: "4".to_string(),
            rmse,
            mae: rmse * 0.75,
            accuracy,
            prediction_count: 24,
            avg_response_time: 11.0,
            timestamp: now - ChronoDuration::hours(age),
        };
        (0..3)
            .map(|age| sample(recent, age))
            .chain((3..8).map(|age| sample(historical, age)))
            .collect()
    }

    #[test]
    fn test_rmse_degradation_is_high() {
        let triggers = check_performance(
            ModelKind::Recurrent,
            &samples((22.0, 80.0), (18.0, 80.0)),
            &TriggerThresholds::default(),
        );

        assert_eq!(triggers.len(), 1);
        let trigger = &triggers[0];
        assert_eq!(trigger.trigger_type, TriggerType::Performance);
        assert_eq!(trigger.severity, Severity::High);
        assert!((trigger.current_value - 4.0 / 18.0).abs() < 1e-9);
        assert_eq!(trigger.model, ModelScope::Model(ModelKind::Recurrent));
    }

    #[test]
    fn test_rmse_degradation_severity_cutoffs() {
        let thresholds = TriggerThresholds::default();
        let severity_for = |recent_rmse: f64| {
            let samples = samples((recent_rmse, 80.0), (20.0, 80.0));
            check_performance(ModelKind::Recurrent, &samples, &thresholds)
                .first()
                .map(|trigger| trigger.severity)
        };

        assert_eq!(severity_for(22.9), None, "14.5% is below the cutoff");
        assert_eq!(severity_for(23.1), Some(Severity::High));
        assert_eq!(severity_for(26.0), Some(Severity::High), "exactly 30% is not critical");
        assert_eq!(severity_for(26.1), Some(Severity::Critical));
    }

    #[test]
    fn test_accuracy_drop_triggers_separately() {
        let triggers = check_performance(
            ModelKind::GradientBoost,
            &samples((30.0, 60.0), (20.0, 80.0)),
            &TriggerThresholds::default(),
        );

        assert_eq!(triggers.len(), 2);
        assert_eq!(triggers[1].metadata["metric"], "accuracy");
        assert_eq!(triggers[1].severity, Severity::Critical);
    }

    #[test]
    fn test_too_few_samples_is_skipped() {
        let mut few = samples((40.0, 10.0), (10.0, 90.0));
        few.truncate(4);
        let thresholds = TriggerThresholds::default();
        assert!(check_performance(ModelKind::Recurrent, &few, &thresholds).is_empty());
    }

    #[test]
    fn test_mean_shift() {
        let thresholds = TriggerThresholds::default();
        let historical: Vec<f64> = (0..60).map(|i| 20.0 + f64::from(i % 5)).collect();
        let recent: Vec<f64> = historical.iter().map(|value| value * 1.3).collect();

        let triggers = check_drift(Pollutant::Pm25, &recent, &historical, &thresholds);
        assert_eq!(triggers.len(), 1);
        assert_eq!(triggers[0].severity, Severity::High);
        assert_eq!(triggers[0].metadata["drift_type"], "mean_shift");
        assert_eq!(triggers[0].model, ModelScope::Ensemble);

        let doubled: Vec<f64> = historical.iter().map(|value| value * 1.6).collect();
        let critical = check_drift(Pollutant::Pm25, &doubled, &historical, &thresholds);
        assert_eq!(critical[0].severity, Severity::Critical);
    }

    #[test]
    fn test_variance_shift() {
        let thresholds = TriggerThresholds::default();
        let historical: Vec<f64> = (0..60).map(|i| if i % 2 == 0 { 18.0 } else { 22.0 }).collect();
        let wider: Vec<f64> = (0..60).map(|i| if i % 2 == 0 { 15.0 } else { 25.0 }).collect();
        let far_wider: Vec<f64> = (0..60).map(|i| if i % 2 == 0 { 12.0 } else { 28.0 }).collect();

        let medium = check_drift(Pollutant::No2, &wider, &historical, &thresholds);
        assert_eq!(medium.len(), 1);
        assert_eq!(medium[0].severity, Severity::Medium);
        assert!((medium[0].current_value - 2.5).abs() < 1e-9);

        let high = check_drift(Pollutant::No2, &far_wider, &historical, &thresholds);
        assert_eq!(high[0].severity, Severity::High);
    }

    #[test]
    fn test_drift_needs_enough_samples() {
        let thresholds = TriggerThresholds::default();
        let historical = vec![20.0; 49];
        let recent = vec![80.0; 60];
        assert!(check_drift(Pollutant::Pm25, &recent, &historical, &thresholds).is_empty());
    }

    #[test]
    fn test_schedule_check() {
        let now = Utc::now();

        let bootstrap = check_schedule(ModelKind::Recurrent, None, 14.0, now).expect("bootstrap");
        assert_eq!(bootstrap.severity, Severity::High);

        let trained_days_ago = |days| Some(now - ChronoDuration::days(days));
        let model = ModelKind::GradientBoost;
        assert!(check_schedule(model, trained_days_ago(5), 7.0, now).is_none());

        let overdue = check_schedule(model, trained_days_ago(10), 7.0, now).expect("overdue");
        assert_eq!(overdue.severity, Severity::Medium);

        let stale = check_schedule(model, trained_days_ago(15), 7.0, now).expect("stale");
        assert_eq!(stale.severity, Severity::Critical);
    }

    #[tokio::test]
    async fn test_evaluator_combines_checks() {
        let pool = pool().await;
        let monitor = Arc::new(PerformanceMonitor::start(pool.clone(), MonitorConfig::default()));
        let tracker = Arc::new(SqlTracker::new(pool.clone()));

        for kind in [ModelKind::GradientBoost, ModelKind::Recurrent] {
            let run_id = tracker.log_run(RunRecord::new(kind)).await.expect("run");
            let version = tracker
                .register_version(kind, run_id, BTreeMap::new(), None)
                .await
                .expect("version");
            tracker
                .promote(kind, version.version, ModelStage::Production)
                .await
                .expect("promote");
        }

        let now = Utc::now();
        ObservationRepository::insert_many(&pool, &fixtures::hourly_observations(now, 10, 30.0))
            .await
            .expect("observations");

        for sample in samples((22.0, 80.0), (18.0, 80.0)) {
            monitor.record_model_performance(sample);
        }
        monitor.flush().await;

        let evaluator = TriggerEvaluator::new(
            TriggerThresholds::default(),
            Duration::from_secs(5),
            monitor,
            tracker,
            Arc::new(SqlDataSource::new(pool)),
            ScheduleStore::new(store()),
        );

        let triggers = evaluator.evaluate().await;
        let kinds: Vec<_> = triggers
            .iter()
            .map(|trigger| (trigger.trigger_type, trigger.model))
            .collect();
        let recurrent = ModelScope::Model(ModelKind::Recurrent);
        let spatial = ModelScope::Model(ModelKind::GraphSpatial);
        assert!(kinds.contains(&(TriggerType::Performance, recurrent)));
        assert!(kinds.contains(&(TriggerType::Schedule, spatial)));
        let drifted = kinds.iter().any(|(kind, _)| *kind == TriggerType::Drift);
        assert!(!drifted, "stable levels raise no drift");
        assert_eq!(triggers.len(), 2);
    }
}
