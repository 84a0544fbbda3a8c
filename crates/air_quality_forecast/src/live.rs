//! Scoring the serving models against recent observations.
//!
//! Each pass scores every trained slot on the last `live_window` of actual
//! readings and records the result as a performance sample. Those samples are
//! what the performance triggers compare, and they drive the blend weights
//! between retraining runs.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use forecast_structs::{ModelKind, ModelStage, PerformanceSample, PerformanceSnapshot};
use ml_model::{EvaluationMetrics, Forecaster, TrainingData};
use tracing::{debug, info, warn};

use crate::data_source::TrainingDataSource;
use crate::ensemble::EnsembleForecaster;
use crate::monitor::PerformanceMonitor;
use crate::tracker::ExperimentTracker;
use crate::window_start;

/// Hours of history before the window needed for the lag features.
const LAG_LOOKBACK_HOURS: i64 = 48;

pub struct LiveEvaluator {
    ensemble: Arc<EnsembleForecaster>,
    data: Arc<dyn TrainingDataSource>,
    tracker: Arc<dyn ExperimentTracker>,
    monitor: Arc<PerformanceMonitor>,
    window: Duration,
    call_timeout: Duration,
}

impl LiveEvaluator {
    #[must_use]
    pub fn new(
        ensemble: Arc<EnsembleForecaster>,
        data: Arc<dyn TrainingDataSource>,
        tracker: Arc<dyn ExperimentTracker>,
        monitor: Arc<PerformanceMonitor>,
        window: Duration,
        call_timeout: Duration,
    ) -> Self {
        Self {
            ensemble,
            data,
            tracker,
            monitor,
            window,
            call_timeout,
        }
    }

    /// Scores every trained model on the recent window.
    ///
    /// Records one performance sample per scored model, waits for the samples
    /// to be written, and reweights the blend. Returns the snapshots taken;
    /// models that could not be scored are skipped.
    pub async fn evaluate(&self) -> BTreeMap<ModelKind, PerformanceSnapshot> {
        let mut snapshots = BTreeMap::new();
        let Some(data) = self.recent_samples().await else {
            return snapshots;
        };

        let now = Utc::now();
        for slot in self.ensemble.slots() {
            if !slot.is_trained() {
                continue;
            }
            let kind = slot.kind();
            let started = Instant::now();
            let Some(evaluation) = self.score(kind, slot.load(), &data).await else {
                continue;
            };
            let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;

            self.monitor.record_model_performance(PerformanceSample {
                model_name: kind.as_str().to_string(),
                model_version: self.serving_version(kind).await,
                rmse: evaluation.rmse,
                mae: evaluation.mae,
                accuracy: evaluation.accuracy_within_20pct,
                prediction_count: evaluation.sample_count as u64,
                avg_response_time: elapsed_ms / evaluation.sample_count.max(1) as f64,
                timestamp: now,
            });
            snapshots.insert(
                kind,
                PerformanceSnapshot {
                    rmse: evaluation.rmse,
                    mae: evaluation.mae,
                    accuracy: evaluation.accuracy_within_20pct,
                    recorded_at: now,
                },
            );
        }

        self.monitor.flush().await;
        if !snapshots.is_empty() {
            self.ensemble.update_weights(&snapshots).await;
        }
        info!(models = snapshots.len(), samples = data.len(), "Live evaluation complete");
        snapshots
    }

    async fn recent_samples(&self) -> Option<Arc<TrainingData>> {
        let now = Utc::now();
        let start = window_start(now, self.window);
        let lookback = start - chrono::Duration::hours(LAG_LOOKBACK_HOURS);

        let observations =
            match tokio::time::timeout(self.call_timeout, self.data.observations(lookback, now))
                .await
            {
                Ok(Ok(observations)) => observations,
                Ok(Err(error)) => {
                    warn!(%error, "Could not load recent observations");
                    return None;
                }
                Err(_) => {
                    warn!(timeout = ?self.call_timeout, "Loading recent observations timed out");
                    return None;
                }
            };

        let samples: Vec<_> = feature_extractor::build_samples(&observations)
            .into_iter()
            .filter(|sample| sample.row.timestamp >= start)
            .collect();
        if samples.is_empty() {
            debug!("No recent observations to score against");
            return None;
        }
        Some(Arc::new(TrainingData::from_samples(samples)))
    }

    async fn score(
        &self,
        kind: ModelKind,
        model: Arc<Box<dyn Forecaster>>,
        data: &Arc<TrainingData>,
    ) -> Option<EvaluationMetrics> {
        let data = Arc::clone(data);
        let task = tokio::task::spawn_blocking(move || model.evaluate(&data));

        match tokio::time::timeout(self.call_timeout, task).await {
            Ok(Ok(Ok(evaluation))) => Some(evaluation),
            Ok(Ok(Err(error))) => {
                warn!(model = %kind, %error, "Live evaluation failed");
                None
            }
            Ok(Err(error)) => {
                warn!(model = %kind, %error, "Live evaluation task aborted");
                None
            }
            Err(_) => {
                warn!(model = %kind, timeout = ?self.call_timeout, "Live evaluation timed out");
                None
            }
        }
    }

    /// Production version number, or `unregistered` for a model never promoted.
    async fn serving_version(&self, kind: ModelKind) -> String {
        match self.tracker.get_latest_versions(kind, &[ModelStage::Production]).await {
            Ok(versions) => versions
                .first()
                .map_or_else(|| "unregistered".to_string(), |version| version.version.to_string()),
            Err(error) => {
                warn!(model = %kind, %error, "Could not look up the serving version");
                "unregistered".to_string()
            }
        }
    }
}
