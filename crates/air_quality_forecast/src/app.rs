//! Component wiring.
//!
//! Every long-lived component is built once here and shared through `Arc`.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use config::Config;
use database::TriggerLogRepository;
use forecast_structs::{ModelKind, ModelScope, RetrainingTrigger};
use object_store::ObjectStore;
use sqlx::SqlitePool;
use tracing::info;

use crate::artifacts::ArtifactStore;
use crate::control_loop::ControlLoop;
use crate::data_source::{SqlDataSource, TrainingDataSource};
use crate::ensemble::EnsembleForecaster;
use crate::live::LiveEvaluator;
use crate::monitor::PerformanceMonitor;
use crate::orchestrator::{ForecasterFactory, RetrainingOrchestrator};
use crate::queue::RetrainingQueue;
use crate::reporting::StatusReport;
use crate::scheduler::{AdaptiveScheduler, ScheduleStore};
use crate::tracker::{ExperimentTracker, SqlTracker};
use crate::triggers::TriggerEvaluator;
use crate::window_start;

/// Results considered by the status report.
const STATUS_HISTORY: u32 = 100;

/// Versions per model listed in the status report.
const STATUS_VERSIONS: usize = 5;

pub struct App {
    pub config: Config,
    pub pool: SqlitePool,
    pub monitor: Arc<PerformanceMonitor>,
    pub tracker: Arc<dyn ExperimentTracker>,
    pub data: Arc<dyn TrainingDataSource>,
    pub ensemble: Arc<EnsembleForecaster>,
    pub schedules: ScheduleStore,
    pub artifacts: ArtifactStore,
    pub orchestrator: Arc<RetrainingOrchestrator>,
}

impl App {
    /// Builds every component on top of a migrated pool.
    ///
    /// # Errors
    ///
    /// Returns an error if the object store cannot be created.
    pub async fn build(config: Config, pool: SqlitePool) -> Result<Self> {
        let store = config.object_store().context("Failed to open document store")?;
        Ok(Self::with_store(config, pool, store).await)
    }

    /// Builds every component and puts the saved production models back in service.
    pub async fn with_store(
        config: Config,
        pool: SqlitePool,
        store: Arc<dyn ObjectStore>,
    ) -> Self {
        let monitor = Arc::new(PerformanceMonitor::start(pool.clone(), config.monitor.clone()));
        let tracker: Arc<dyn ExperimentTracker> = Arc::new(SqlTracker::new(pool.clone()));
        let data: Arc<dyn TrainingDataSource> = Arc::new(SqlDataSource::new(pool.clone()));
        let factory: ForecasterFactory = Arc::new(ml_model::create_forecaster);

        let ensemble = Arc::new(
            EnsembleForecaster::load(
                config.ensemble.clone(),
                Arc::clone(&store),
                ModelKind::all().map(|kind| factory(kind)),
            )
            .await,
        );

        let artifacts = ArtifactStore::new(Arc::clone(&store));
        let restored = artifacts.restore_production(&ensemble, &*tracker, &factory).await;

        let schedules = ScheduleStore::new(store);
        let scheduler = AdaptiveScheduler::new(config.scheduler.clone(), schedules.clone());

        let orchestrator = Arc::new(RetrainingOrchestrator::new(
            config.orchestrator.clone(),
            pool.clone(),
            Arc::clone(&data),
            Arc::clone(&tracker),
            Arc::clone(&ensemble),
            Arc::new(scheduler),
            Arc::clone(&monitor),
            artifacts.clone(),
        ));

        info!(
            restored = ?restored,
            max_concurrent_retrains = config.max_concurrent_retrains,
            evaluation_interval = ?config.evaluation_interval,
            "Components initialized"
        );

        Self {
            config,
            pool,
            monitor,
            tracker,
            data,
            ensemble,
            schedules,
            artifacts,
            orchestrator,
        }
    }

    #[must_use]
    pub fn live_evaluator(&self) -> LiveEvaluator {
        LiveEvaluator::new(
            Arc::clone(&self.ensemble),
            Arc::clone(&self.data),
            Arc::clone(&self.tracker),
            Arc::clone(&self.monitor),
            self.config.monitor.live_window,
            self.config.orchestrator.call_timeout,
        )
    }

    #[must_use]
    pub fn evaluator(&self) -> TriggerEvaluator {
        TriggerEvaluator::new(
            self.config.triggers.clone(),
            self.config.orchestrator.call_timeout,
            Arc::clone(&self.monitor),
            Arc::clone(&self.tracker),
            Arc::clone(&self.data),
            self.schedules.clone(),
        )
    }

    #[must_use]
    pub fn start_queue(&self) -> Arc<RetrainingQueue> {
        Arc::new(RetrainingQueue::start(
            Arc::clone(&self.orchestrator),
            self.config.max_concurrent_retrains,
            self.config.orchestrator.task_retry,
        ))
    }

    #[must_use]
    pub fn control_loop(&self, queue: Arc<RetrainingQueue>) -> ControlLoop {
        ControlLoop::new(
            self.config.evaluation_interval,
            self.pool.clone(),
            self.live_evaluator(),
            self.evaluator(),
            queue,
            Arc::clone(&self.monitor),
        )
    }

    /// Manual triggers for models that have no trained parameters yet.
    #[must_use]
    pub fn warm_start_triggers(&self) -> Vec<RetrainingTrigger> {
        self.ensemble
            .slots()
            .filter(|slot| !slot.is_trained())
            .map(|slot| RetrainingTrigger::manual(ModelScope::Model(slot.kind()), "warm start"))
            .collect()
    }

    /// Retraining work another process has dispatched but not finished.
    ///
    /// Counts dispatched triggers without a result. Triggers older than one
    /// retraining timeout are treated as abandoned.
    ///
    /// # Errors
    ///
    /// Returns an error if the trigger log cannot be read.
    pub async fn pending_tasks(&self) -> Result<usize> {
        let since = window_start(Utc::now(), self.config.orchestrator.retrain_timeout);
        let pending = TriggerLogRepository::count_pending(&self.pool, since)
            .await
            .context("Failed to read the trigger log")?;
        Ok(usize::try_from(pending).unwrap_or(usize::MAX))
    }

    /// # Errors
    ///
    /// Returns an error if the run history or the registry cannot be read.
    pub async fn status(&self, active_tasks: usize) -> Result<StatusReport> {
        let mut status = StatusReport::collect(
            &self.pool,
            self.ensemble.weights(),
            active_tasks,
            self.config.max_concurrent_retrains,
            STATUS_HISTORY,
            &self.config.status,
        )
        .await
        .context("Failed to read retraining history")?;

        for kind in ModelKind::all() {
            let versions = self
                .tracker
                .compare_versions(kind, "val_rmse", STATUS_VERSIONS)
                .await
                .with_context(|| format!("Failed to compare {kind} versions"))?;
            status.versions.insert(kind, versions);
        }
        Ok(status)
    }
}
