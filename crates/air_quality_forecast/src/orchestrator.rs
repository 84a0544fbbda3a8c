//! Retraining orchestrator: retrain, validate, promote.
//!
//! One run handles one trigger. For every target model the steps run strictly
//! in order, and each blocking call carries a hard timeout. Transient failures
//! are retried inline with exponential backoff; anything left over ends up in
//! the returned [`RetrainingResult`], never as a panic or an error.
//!
//! Every attempt is logged to the experiment tracker, failed ones included.
//! A model stays claimed until its training thread has exited.

use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use backon::{ExponentialBuilder, Retryable};
use chrono::Utc;
use config::{OrchestratorConfig, PromotionThresholds};
use database::{RetrainingResultRepository, StoreError};
use forecast_structs::{
    FailureKind, ModelKind, ModelStage, PerformanceSample, PerformanceSnapshot, RetrainingResult,
    RetrainingTrigger, RunFailure, RunRecord, ValidationMetrics,
};
use ml_model::{
    CancelToken, EvaluationMetrics, ForecastError, Forecaster, TrainingData, TrainingMetrics,
};
use sqlx::SqlitePool;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::artifacts::{ArtifactError, ArtifactStore};
use crate::data_source::TrainingDataSource;
use crate::ensemble::EnsembleForecaster;
use crate::monitor::PerformanceMonitor;
use crate::scheduler::AdaptiveScheduler;
use crate::tracker::{ExperimentTracker, TrackerError};

/// Builds a fresh, untrained forecaster for a model kind.
pub type ForecasterFactory = Arc<dyn Fn(ModelKind) -> Box<dyn Forecaster> + Send + Sync>;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Tracker(#[from] TrackerError),

    #[error(transparent)]
    Forecast(#[from] ForecastError),

    #[error("saving model parameters: {0}")]
    Artifact(#[from] ArtifactError),

    #[error("worker task aborted: {0}")]
    TaskAborted(String),

    #[error("invalid trigger payload: {0}")]
    InvalidTrigger(#[from] serde_json::Error),
}

impl OrchestratorError {
    /// Timeouts and lost connections may succeed on retry.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        match self {
            Self::Timeout { .. } => true,
            Self::Store(error) => error.is_connection(),
            Self::Tracker(error) => error.is_transient(),
            Self::Forecast(_)
            | Self::Artifact(_)
            | Self::TaskAborted(_)
            | Self::InvalidTrigger(_) => false,
        }
    }

    fn failure_kind(&self) -> FailureKind {
        if self.is_transient() {
            FailureKind::Transient
        } else {
            FailureKind::Fatal
        }
    }
}

/// What happened to a dispatched trigger.
#[derive(Debug, Clone, PartialEq)]
pub enum OrchestrationOutcome {
    /// The run finished; its result has been persisted.
    Completed(RetrainingResult),
    /// Every target model was already being retrained; nothing ran.
    Coalesced {
        trigger_id: Uuid,
        busy: Vec<ModelKind>,
    },
}

impl OrchestrationOutcome {
    #[must_use]
    pub const fn result(&self) -> Option<&RetrainingResult> {
        match self {
            Self::Completed(result) => Some(result),
            Self::Coalesced { .. } => None,
        }
    }
}

/// Whether validation metrics clear the promotion thresholds.
#[must_use]
pub fn passes_gate(thresholds: &PromotionThresholds, metrics: &ValidationMetrics) -> bool {
    metrics.rmse <= thresholds.max_rmse && metrics.accuracy_within_20pct >= thresholds.min_accuracy
}

/// Models currently being retrained.
type InFlight = Arc<Mutex<HashSet<ModelKind>>>;

/// Releases claimed models when the run ends, however it ends.
struct InFlightGuard {
    in_flight: InFlight,
    claimed: Vec<ModelKind>,
}

impl InFlightGuard {
    /// Claims every free target. Returns the guard and the targets already busy.
    fn claim(in_flight: &InFlight, targets: &[ModelKind]) -> (Self, Vec<ModelKind>) {
        let mut active = in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        let (claimed, busy): (Vec<ModelKind>, Vec<ModelKind>) =
            targets.iter().copied().partition(|kind| !active.contains(kind));
        active.extend(claimed.iter().copied());

        (
            Self {
                in_flight: Arc::clone(in_flight),
                claimed,
            },
            busy,
        )
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut active = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        for kind in &self.claimed {
            active.remove(kind);
        }
    }
}

/// Training and validation sets for one run.
struct RunData {
    training: Arc<TrainingData>,
    validation: Arc<TrainingData>,
}

/// Outcome of retraining a single model.
struct ModelRun {
    trained: bool,
    validation: Option<ValidationMetrics>,
    promoted: bool,
    version: Option<i64>,
    failure: Option<OrchestratorError>,
    validation_time_ms: f64,
}

/// Runs the retrain → validate → promote pipeline for triggers.
pub struct RetrainingOrchestrator {
    config: OrchestratorConfig,
    pool: SqlitePool,
    data: Arc<dyn TrainingDataSource>,
    tracker: Arc<dyn ExperimentTracker>,
    ensemble: Arc<EnsembleForecaster>,
    scheduler: Arc<AdaptiveScheduler>,
    monitor: Arc<PerformanceMonitor>,
    artifacts: ArtifactStore,
    factory: ForecasterFactory,
    in_flight: InFlight,
}

impl RetrainingOrchestrator {
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: OrchestratorConfig,
        pool: SqlitePool,
        data: Arc<dyn TrainingDataSource>,
        tracker: Arc<dyn ExperimentTracker>,
        ensemble: Arc<EnsembleForecaster>,
        scheduler: Arc<AdaptiveScheduler>,
        monitor: Arc<PerformanceMonitor>,
        artifacts: ArtifactStore,
    ) -> Self {
        Self {
            config,
            pool,
            data,
            tracker,
            ensemble,
            scheduler,
            monitor,
            artifacts,
            factory: Arc::new(ml_model::create_forecaster),
            in_flight: Arc::default(),
        }
    }

    /// Replaces how fresh forecasters are built.
    #[must_use]
    pub fn with_factory(mut self, factory: ForecasterFactory) -> Self {
        self.factory = factory;
        self
    }

    /// Models with a run in progress.
    #[must_use]
    pub fn active_models(&self) -> Vec<ModelKind> {
        let active = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        let mut models: Vec<ModelKind> = active.iter().copied().collect();
        models.sort();
        models
    }

    /// Runs a trigger received as JSON.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::InvalidTrigger`] if the payload does not
    /// decode. Run failures are reported in the result instead.
    pub async fn execute_serialized(
        &self,
        payload: &str,
    ) -> Result<OrchestrationOutcome, OrchestratorError> {
        let trigger = RetrainingTrigger::from_json(payload)?;
        Ok(self.execute(trigger).await)
    }

    /// Retrains, validates and conditionally promotes every model the trigger targets.
    ///
    /// Targets already being retrained by another run are skipped; if all of
    /// them are, the trigger is coalesced and nothing runs.
    pub async fn execute(&self, trigger: RetrainingTrigger) -> OrchestrationOutcome {
        let targets = trigger.model.targets();
        let (guard, busy) = InFlightGuard::claim(&self.in_flight, &targets);

        if guard.claimed.is_empty() {
            info!(
                trigger = %trigger.id,
                busy = ?busy,
                "Retraining already in progress, trigger coalesced"
            );
            return OrchestrationOutcome::Coalesced {
                trigger_id: trigger.id,
                busy,
            };
        }
        if !busy.is_empty() {
            info!(trigger = %trigger.id, busy = ?busy, "Skipping models already being retrained");
        }

        info!(
            trigger = %trigger.id,
            trigger_type = %trigger.trigger_type,
            severity = %trigger.severity,
            models = ?guard.claimed,
            "Retraining run started"
        );

        let started = Instant::now();
        let runs = match self.load_data().await {
            Ok(data) => {
                let mut runs = BTreeMap::new();
                for kind in &guard.claimed {
                    runs.insert(*kind, self.run_model(*kind, &trigger, &data).await);
                }
                runs
            }
            Err(error) => {
                error!(%error, trigger = %trigger.id, "Could not load training data");
                for kind in &guard.claimed {
                    let record = self.run_record(*kind, &trigger, None);
                    self.log_failed_run(record, "loading data", &error).await;
                }
                let failure = RunFailure {
                    kind: error.failure_kind(),
                    message: format!("loading training data: {error}"),
                };
                let result = self.finish(trigger, BTreeMap::new(), Some(failure), started).await;
                drop(guard);
                return OrchestrationOutcome::Completed(result);
            }
        };

        self.feed_back(&runs).await;

        let failure = summarize_failures(&runs);
        let result = self.finish(trigger, runs, failure, started).await;
        drop(guard);
        OrchestrationOutcome::Completed(result)
    }

    async fn load_data(&self) -> Result<RunData, OrchestratorError> {
        let now = Utc::now();
        let start = now - chrono::Duration::days(self.config.training_window_days);
        let cutoff = now - chrono::Duration::days(self.config.validation_window_days);

        let observations = self
            .with_retry("loading observations", self.config.call_timeout, || {
                let data = Arc::clone(&self.data);
                async move { Ok(data.observations(start, now).await?) }
            })
            .await?;

        let (validation, training): (Vec<_>, Vec<_>) =
            feature_extractor::build_samples(&observations)
                .into_iter()
                .partition(|sample| sample.row.timestamp >= cutoff);

        info!(
            observations = observations.len(),
            training = training.len(),
            validation = validation.len(),
            "Training data loaded"
        );

        Ok(RunData {
            training: Arc::new(TrainingData::from_samples(training)),
            validation: Arc::new(TrainingData::from_samples(validation)),
        })
    }

    async fn run_model(
        &self,
        kind: ModelKind,
        trigger: &RetrainingTrigger,
        data: &RunData,
    ) -> ModelRun {
        let mut run = ModelRun {
            trained: false,
            validation: None,
            promoted: false,
            version: None,
            failure: None,
            validation_time_ms: 0.0,
        };
        let mut record = self.run_record(kind, trigger, Some(data));

        let (model, training) = match self.train(kind, &data.training).await {
            Ok(trained) => trained,
            Err(error) => {
                warn!(model = %kind, %error, "Retraining failed");
                self.log_failed_run(record, "training", &error).await;
                run.failure = Some(error);
                return run;
            }
        };
        run.trained = true;
        record.metrics.insert("train_rmse".to_string(), training.rmse);
        record.metrics.insert("train_mae".to_string(), training.mae);

        let evaluation_started = Instant::now();
        let evaluation = match self.validate(&model, &data.validation).await {
            Ok(evaluation) => evaluation,
            Err(error) => {
                warn!(model = %kind, %error, "Validation failed");
                self.log_failed_run(record, "validation", &error).await;
                run.failure = Some(error);
                return run;
            }
        };
        run.validation_time_ms = evaluation_started.elapsed().as_secs_f64() * 1000.0;

        let validation = ValidationMetrics {
            rmse: evaluation.rmse,
            mae: evaluation.mae,
            accuracy_within_20pct: evaluation.accuracy_within_20pct,
            sample_count: evaluation.sample_count,
        };
        run.validation = Some(validation);
        let eligible = passes_gate(&self.config.promotion, &validation);
        record.metrics.extend(validation_metrics(&evaluation));
        record.tags.insert("passed_gate".to_string(), eligible.to_string());

        let artifact = match self.save_parameters(&model, record.run_id).await {
            Ok(path) => path,
            Err(error) => {
                warn!(model = %kind, %error, "Could not save model parameters");
                self.log_failed_run(record, "saving parameters", &error).await;
                run.failure = Some(error);
                return run;
            }
        };

        match self.register(record, artifact, eligible).await {
            Ok((version, promoted)) => {
                run.version = Some(version);
                run.promoted = promoted;
            }
            Err(error) => {
                warn!(model = %kind, %error, "Could not record run in the registry");
                run.failure = Some(error);
                return run;
            }
        }

        if run.promoted {
            if let Some(slot) = self.ensemble.slot(kind) {
                slot.install(model);
            }
            info!(model = %kind, version = ?run.version, rmse = validation.rmse, "Model promoted");
        } else {
            info!(
                model = %kind,
                rmse = validation.rmse,
                accuracy = validation.accuracy_within_20pct,
                "Model did not pass the promotion gate"
            );
        }

        run
    }

    async fn train(
        &self,
        kind: ModelKind,
        data: &Arc<TrainingData>,
    ) -> Result<(Arc<Box<dyn Forecaster>>, TrainingMetrics), OrchestratorError> {
        let timeout = self.config.retrain_timeout;
        let (model, metrics) = self
            .retrying("training", || {
                let factory = Arc::clone(&self.factory);
                let data = Arc::clone(data);
                let cancel = CancelToken::new();
                let worker = cancel.clone();
                let mut task = tokio::task::spawn_blocking(move || {
                    let mut model = factory(kind);
                    let metrics = model.train_cancellable(&data, &worker)?;
                    Ok::<_, ForecastError>((model, metrics))
                });
                async move {
                    let Ok(joined) = tokio::time::timeout(timeout, &mut task).await else {
                        // The next attempt must not start until this thread has stopped.
                        cancel.cancel();
                        let stopped = task.await;
                        let clean = stopped.is_ok();
                        debug!(model = %kind, clean, "Timed-out training stopped");
                        return Err(OrchestratorError::Timeout {
                            operation: "training",
                            timeout,
                        });
                    };
                    joined
                        .map_err(|error| OrchestratorError::TaskAborted(error.to_string()))?
                        .map_err(OrchestratorError::from)
                }
            })
            .await?;

        info!(
            model = %kind,
            rmse = metrics.rmse,
            samples = metrics.sample_count,
            "Model retrained"
        );
        Ok((Arc::new(model), metrics))
    }

    async fn validate(
        &self,
        model: &Arc<Box<dyn Forecaster>>,
        validation: &Arc<TrainingData>,
    ) -> Result<EvaluationMetrics, OrchestratorError> {
        self.with_retry("validation", self.config.call_timeout, || {
            let model = Arc::clone(model);
            let validation = Arc::clone(validation);
            let task = tokio::task::spawn_blocking(move || model.evaluate(&validation));
            async move {
                task.await
                    .map_err(|error| OrchestratorError::TaskAborted(error.to_string()))?
                    .map_err(OrchestratorError::from)
            }
        })
        .await
    }

    /// Parameters and trigger tags shared by every attempt on `kind`.
    fn run_record(
        &self,
        kind: ModelKind,
        trigger: &RetrainingTrigger,
        data: Option<&RunData>,
    ) -> RunRecord {
        let mut record = RunRecord::new(kind);
        record.params.insert(
            "training_window_days".to_string(),
            self.config.training_window_days.into(),
        );
        record.params.insert(
            "validation_window_days".to_string(),
            self.config.validation_window_days.into(),
        );
        if let Some(data) = data {
            record.params.insert("training_samples".to_string(), data.training.len().into());
            record.params.insert("validation_samples".to_string(), data.validation.len().into());
        }
        record.tags = BTreeMap::from([
            ("trigger_id".to_string(), trigger.id.to_string()),
            ("trigger_type".to_string(), trigger.trigger_type.to_string()),
            ("severity".to_string(), trigger.severity.to_string()),
        ]);
        record
    }

    /// Logs an attempt that stopped at `step`. A logging failure is only reported.
    async fn log_failed_run(
        &self,
        mut record: RunRecord,
        step: &'static str,
        failure: &OrchestratorError,
    ) {
        let model = record.model;
        record.tags.insert("status".to_string(), "failed".to_string());
        record.tags.insert("failed_step".to_string(), step.to_string());
        record.tags.insert("error".to_string(), failure.to_string());

        let logged = self
            .with_retry("logging failed run", self.config.call_timeout, || {
                let tracker = Arc::clone(&self.tracker);
                let record = record.clone();
                async move { Ok(tracker.log_run(record).await?) }
            })
            .await;
        if let Err(error) = logged {
            warn!(%model, %error, "Could not log failed run");
        }
    }

    async fn save_parameters(
        &self,
        model: &Arc<Box<dyn Forecaster>>,
        run_id: Uuid,
    ) -> Result<String, OrchestratorError> {
        self.with_retry("saving parameters", self.config.call_timeout, || {
            let artifacts = self.artifacts.clone();
            let model = Arc::clone(model);
            async move { Ok(artifacts.save(&**model, run_id).await?) }
        })
        .await
    }

    /// Logs the run, registers a version and promotes it when `eligible`.
    /// Returns the version and whether it now serves production.
    async fn register(
        &self,
        mut record: RunRecord,
        artifact: String,
        eligible: bool,
    ) -> Result<(i64, bool), OrchestratorError> {
        let kind = record.model;
        record.tags.insert("status".to_string(), "completed".to_string());

        let run_id = self
            .with_retry("logging run", self.config.call_timeout, || {
                let tracker = Arc::clone(&self.tracker);
                let record = record.clone();
                async move { Ok(tracker.log_run(record).await?) }
            })
            .await?;

        let metrics = record.metrics.clone();
        let version = self
            .with_retry("registering version", self.config.call_timeout, || {
                let tracker = Arc::clone(&self.tracker);
                let metrics = metrics.clone();
                let artifact = Some(artifact.clone());
                async move { Ok(tracker.register_version(kind, run_id, metrics, artifact).await?) }
            })
            .await?;

        if !eligible {
            return Ok((version.version, false));
        }

        let promoted = self
            .with_retry("promoting version", self.config.call_timeout, || {
                let tracker = Arc::clone(&self.tracker);
                let number = version.version;
                async move { Ok(tracker.promote(kind, number, ModelStage::Production).await?) }
            })
            .await?;

        Ok((version.version, promoted))
    }

    /// Feeds validation results into the monitor, the blend weights and the schedule.
    async fn feed_back(&self, runs: &BTreeMap<ModelKind, ModelRun>) {
        let now = Utc::now();
        let snapshot = |metrics: &ValidationMetrics| PerformanceSnapshot {
            rmse: metrics.rmse,
            mae: metrics.mae,
            accuracy: metrics.accuracy_within_20pct,
            recorded_at: now,
        };

        let validated: BTreeMap<ModelKind, PerformanceSnapshot> = runs
            .iter()
            .filter_map(|(kind, run)| Some((*kind, snapshot(run.validation.as_ref()?))))
            .collect();
        let serving: BTreeMap<ModelKind, PerformanceSnapshot> = validated
            .iter()
            .filter(|(kind, _)| runs.get(kind).is_some_and(|run| run.promoted))
            .map(|(kind, snapshot)| (*kind, *snapshot))
            .collect();

        for (kind, run) in runs {
            let (Some(metrics), Some(version)) = (&run.validation, run.version) else {
                continue;
            };
            if !run.promoted {
                continue;
            }
            self.monitor.record_model_performance(PerformanceSample {
                model_name: kind.as_str().to_string(),
                model_version: version.to_string(),
                rmse: metrics.rmse,
                mae: metrics.mae,
                accuracy: metrics.accuracy_within_20pct,
                prediction_count: metrics.sample_count as u64,
                avg_response_time: if metrics.sample_count == 0 {
                    0.0
                } else {
                    run.validation_time_ms / metrics.sample_count as f64
                },
                timestamp: now,
            });
        }

        if !serving.is_empty() {
            self.ensemble.update_weights(&serving).await;
        }
        if !validated.is_empty() {
            self.scheduler.update(&validated).await;
        }
    }

    async fn finish(
        &self,
        trigger: RetrainingTrigger,
        runs: BTreeMap<ModelKind, ModelRun>,
        failure: Option<RunFailure>,
        started: Instant,
    ) -> RetrainingResult {
        let result = RetrainingResult {
            id: Uuid::new_v4(),
            models_retrained: runs
                .iter()
                .filter(|(_, run)| run.trained)
                .map(|(kind, _)| *kind)
                .collect(),
            duration_seconds: started.elapsed().as_secs_f64(),
            validation_results: runs
                .iter()
                .filter_map(|(kind, run)| Some((*kind, run.validation?)))
                .collect(),
            promotion_results: runs.iter().map(|(kind, run)| (*kind, run.promoted)).collect(),
            success: runs.values().any(|run| run.promoted),
            error: failure,
            completed_at: Utc::now(),
            trigger,
        };

        info!(
            trigger = %result.trigger.id,
            success = result.success,
            duration_seconds = result.duration_seconds,
            promoted = ?result.promoted_models().collect::<Vec<_>>(),
            "Retraining run finished"
        );

        if let Err(error) = RetrainingResultRepository::insert(&self.pool, &result).await {
            error!(%error, result = %result.id, "Failed to persist retraining result");
        }
        result
    }

    /// Runs `operation` with a hard timeout, retrying transient failures.
    async fn with_retry<T, F, Fut>(
        &self,
        operation: &'static str,
        timeout: Duration,
        mut call: F,
    ) -> Result<T, OrchestratorError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, OrchestratorError>>,
    {
        self.retrying(operation, || {
            let pending = call();
            async move {
                tokio::time::timeout(timeout, pending)
                    .await
                    .map_err(|_| OrchestratorError::Timeout { operation, timeout })?
            }
        })
        .await
    }

    /// Retries transient failures of `operation` with exponential backoff.
    async fn retrying<T, F, Fut>(
        &self,
        operation: &'static str,
        call: F,
    ) -> Result<T, OrchestratorError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, OrchestratorError>>,
    {
        call.retry(
            ExponentialBuilder::default()
                .with_min_delay(self.config.step_backoff)
                .with_max_times(self.config.step_retries),
        )
        .when(OrchestratorError::is_transient)
        .notify(|error, delay| {
            warn!(operation, %error, ?delay, "Transient failure, retrying");
        })
        .await
    }
}

/// Validation metrics as logged to the tracker.
fn validation_metrics(evaluation: &EvaluationMetrics) -> [(String, f64); 4] {
    [
        ("val_rmse".to_string(), evaluation.rmse),
        ("val_mae".to_string(), evaluation.mae),
        ("val_accuracy_10pct".to_string(), evaluation.accuracy_within_10pct),
        ("val_accuracy_20pct".to_string(), evaluation.accuracy_within_20pct),
    ]
}

/// Folds per-model failures into one run failure. Transient if any of them is.
fn summarize_failures(runs: &BTreeMap<ModelKind, ModelRun>) -> Option<RunFailure> {
    let failures: Vec<(ModelKind, &OrchestratorError)> = runs
        .iter()
        .filter_map(|(kind, run)| Some((*kind, run.failure.as_ref()?)))
        .collect();
    if failures.is_empty() {
        return None;
    }

    let kind = if failures.iter().any(|(_, error)| error.is_transient()) {
        FailureKind::Transient
    } else {
        FailureKind::Fatal
    };
    let message = failures
        .iter()
        .map(|(model, error)| format!("{model}: {error}"))
        .collect::<Vec<_>>()
        .join("; ");

    Some(RunFailure { kind, message })
}
