//! Experiment and model registry boundary.

use std::collections::BTreeMap;

use async_trait::async_trait;
use database::{RegistryRepository, StoreError};
use forecast_structs::{ModelKind, ModelStage, ModelVersion, RunRecord, VersionComparison};
use sqlx::SqlitePool;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl TrackerError {
    /// Whether retrying the call may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        match self {
            Self::Store(error) => error.is_connection(),
        }
    }
}

/// Records training runs and moves model versions between lifecycle stages.
#[async_trait]
pub trait ExperimentTracker: Send + Sync {
    /// Stores a run's parameters, metrics and tags. Returns the run id.
    async fn log_run(&self, run: RunRecord) -> Result<Uuid, TrackerError>;

    /// Registers a new version produced by `run_id`, unassigned to any stage.
    ///
    /// `artifact` is the object store path of the version's saved parameters.
    async fn register_version(
        &self,
        model: ModelKind,
        run_id: Uuid,
        metrics: BTreeMap<String, f64>,
        artifact: Option<String>,
    ) -> Result<ModelVersion, TrackerError>;

    /// Newest version per requested stage; every stage when `stages` is empty.
    async fn get_latest_versions(
        &self,
        model: ModelKind,
        stages: &[ModelStage],
    ) -> Result<Vec<ModelVersion>, TrackerError>;

    /// Moves a version to `stage`. Returns `false` if the version does not exist.
    async fn promote(
        &self,
        model: ModelKind,
        version: i64,
        stage: ModelStage,
    ) -> Result<bool, TrackerError>;

    /// The newest `limit` versions with the value each logged for `metric`.
    async fn compare_versions(
        &self,
        model: ModelKind,
        metric: &str,
        limit: usize,
    ) -> Result<Vec<VersionComparison>, TrackerError>;
}

/// Tracker backed by the local `SQLite` registry tables.
#[derive(Debug, Clone)]
pub struct SqlTracker {
    pool: SqlitePool,
}

impl SqlTracker {
    #[must_use]
    pub const fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ExperimentTracker for SqlTracker {
    async fn log_run(&self, run: RunRecord) -> Result<Uuid, TrackerError> {
        RegistryRepository::insert_run(&self.pool, &run).await?;
        Ok(run.run_id)
    }

    async fn register_version(
        &self,
        model: ModelKind,
        run_id: Uuid,
        metrics: BTreeMap<String, f64>,
        artifact: Option<String>,
    ) -> Result<ModelVersion, TrackerError> {
        let version = RegistryRepository::register_version(
            &self.pool,
            model,
            run_id,
            &metrics,
            artifact.as_deref(),
        )
        .await?;
        Ok(version)
    }

    async fn get_latest_versions(
        &self,
        model: ModelKind,
        stages: &[ModelStage],
    ) -> Result<Vec<ModelVersion>, TrackerError> {
        Ok(RegistryRepository::latest_versions(&self.pool, model, stages).await?)
    }

    async fn promote(
        &self,
        model: ModelKind,
        version: i64,
        stage: ModelStage,
    ) -> Result<bool, TrackerError> {
        let archive = stage == ModelStage::Production;
        let transitioned =
            RegistryRepository::transition_stage(&self.pool, model, version, stage, archive).await;
        match transitioned {
            Ok(_) => Ok(true),
            Err(StoreError::NotFound(_)) => Ok(false),
            Err(error) => Err(error.into()),
        }
    }

    async fn compare_versions(
        &self,
        model: ModelKind,
        metric: &str,
        limit: usize,
    ) -> Result<Vec<VersionComparison>, TrackerError> {
        let versions = RegistryRepository::list_versions(&self.pool, model).await?;
        Ok(versions
            .into_iter()
            .take(limit)
            .map(|version| VersionComparison {
                version: version.version,
                stage: version.stage,
                metric_value: version.metrics.get(metric).copied(),
                created_at: version.created_at,
            })
            .collect())
    }
}
