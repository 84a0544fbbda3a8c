//! Tracked runs and versioned model registry.

use std::collections::BTreeMap;

use forecast_structs::{ModelKind, ModelStage, ModelVersion, RunRecord};
use sqlx::{Sqlite, SqlitePool, Transaction};
use uuid::Uuid;

use crate::{StoreError, from_millis, to_millis};

#[derive(sqlx::FromRow)]
struct RunRow {
    run_id: String,
    model: String,
    params: String,
    metrics: String,
    tags: String,
    started_at: i64,
}

impl TryFrom<RunRow> for RunRecord {
    type Error = StoreError;

    fn try_from(row: RunRow) -> Result<Self, Self::Error> {
        Ok(Self {
            run_id: parse_uuid(&row.run_id)?,
            model: parse_model(&row.model)?,
            params: serde_json::from_str(&row.params)?,
            metrics: serde_json::from_str(&row.metrics)?,
            tags: serde_json::from_str(&row.tags)?,
            started_at: from_millis(row.started_at)?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct VersionRow {
    model: String,
    version: i64,
    stage: String,
    run_id: String,
    metrics: String,
    artifact: Option<String>,
    created_at: i64,
}

impl TryFrom<VersionRow> for ModelVersion {
    type Error = StoreError;

    fn try_from(row: VersionRow) -> Result<Self, Self::Error> {
        Ok(Self {
            model: parse_model(&row.model)?,
            version: row.version,
            stage: row
                .stage
                .parse()
                .map_err(|_| StoreError::InvalidRow(format!("unknown stage: {}", row.stage)))?,
            run_id: parse_uuid(&row.run_id)?,
            metrics: serde_json::from_str(&row.metrics)?,
            artifact: row.artifact,
            created_at: from_millis(row.created_at)?,
        })
    }
}

fn parse_uuid(raw: &str) -> Result<Uuid, StoreError> {
    Uuid::parse_str(raw).map_err(|_| StoreError::InvalidRow(format!("invalid uuid: {raw}")))
}

fn parse_model(raw: &str) -> Result<ModelKind, StoreError> {
    raw.parse()
        .map_err(|_| StoreError::InvalidRow(format!("unknown model: {raw}")))
}

const VERSION_COLUMNS: &str = "model, version, stage, run_id, metrics, artifact, created_at";

/// Repository for experiment runs and model versions.
pub struct RegistryRepository;

impl RegistryRepository {
    /// Stores a run record, replacing an existing record with the same id.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be encoded or the insert fails.
    pub async fn insert_run(pool: &SqlitePool, run: &RunRecord) -> Result<(), StoreError> {
        sqlx::query(
            r"
            INSERT OR REPLACE INTO tracked_runs (run_id, model, params, metrics, tags, started_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ",
        )
        .bind(run.run_id.to_string())
        .bind(run.model.as_str())
        .bind(serde_json::to_string(&run.params)?)
        .bind(serde_json::to_string(&run.metrics)?)
        .bind(serde_json::to_string(&run.tags)?)
        .bind(to_millis(run.started_at))
        .execute(pool)
        .await?;

        Ok(())
    }

    /// Finds a run by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or the row is corrupt.
    pub async fn find_run(
        pool: &SqlitePool,
        run_id: Uuid,
    ) -> Result<Option<RunRecord>, StoreError> {
        let row: Option<RunRow> = sqlx::query_as(
            r"
            SELECT run_id, model, params, metrics, tags, started_at FROM tracked_runs
            WHERE run_id = ?
            ",
        )
        .bind(run_id.to_string())
        .fetch_optional(pool)
        .await?;

        row.map(RunRecord::try_from).transpose()
    }

    /// Runs logged for `model`, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or a row is corrupt.
    pub async fn list_runs(
        pool: &SqlitePool,
        model: ModelKind,
    ) -> Result<Vec<RunRecord>, StoreError> {
        let rows: Vec<RunRow> = sqlx::query_as(
            r"
            SELECT run_id, model, params, metrics, tags, started_at FROM tracked_runs
            WHERE model = ?
            ORDER BY started_at DESC
            ",
        )
        .bind(model.as_str())
        .fetch_all(pool)
        .await?;

        rows.into_iter().map(RunRecord::try_from).collect()
    }

    /// Registers a new version of `model`, numbered one past the current highest.
    ///
    /// `artifact` is where the version's parameters were saved, if anywhere.
    ///
    /// # Errors
    ///
    /// Returns an error if the metrics cannot be encoded or the transaction fails.
    pub async fn register_version(
        pool: &SqlitePool,
        model: ModelKind,
        run_id: Uuid,
        metrics: &BTreeMap<String, f64>,
        artifact: Option<&str>,
    ) -> Result<ModelVersion, StoreError> {
        let mut tx = pool.begin().await?;

        let (current,): (Option<i64>,) =
            sqlx::query_as("SELECT MAX(version) FROM model_versions WHERE model = ?")
                .bind(model.as_str())
                .fetch_one(&mut *tx)
                .await?;

        let version = ModelVersion {
            model,
            version: current.unwrap_or(0) + 1,
            stage: ModelStage::None,
            run_id,
            metrics: metrics.clone(),
            artifact: artifact.map(str::to_string),
            created_at: chrono::Utc::now(),
        };

        sqlx::query(
            r"
            INSERT INTO model_versions
                (model, version, stage, run_id, metrics, artifact, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ",
        )
        .bind(model.as_str())
        .bind(version.version)
        .bind(version.stage.to_string())
        .bind(run_id.to_string())
        .bind(serde_json::to_string(&version.metrics)?)
        .bind(version.artifact.as_deref())
        .bind(to_millis(version.created_at))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(version)
    }

    /// Lists every version of `model`, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or a row is corrupt.
    pub async fn list_versions(
        pool: &SqlitePool,
        model: ModelKind,
    ) -> Result<Vec<ModelVersion>, StoreError> {
        let sql = format!(
            "SELECT {VERSION_COLUMNS} FROM model_versions WHERE model = ? ORDER BY version DESC"
        );
        let rows: Vec<VersionRow> = sqlx::query_as(&sql)
            .bind(model.as_str())
            .fetch_all(pool)
            .await?;

        rows.into_iter().map(ModelVersion::try_from).collect()
    }

    /// Returns the newest version in each requested stage.
    ///
    /// An empty `stages` slice means every stage. Stages without any version are skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or a row is corrupt.
    pub async fn latest_versions(
        pool: &SqlitePool,
        model: ModelKind,
        stages: &[ModelStage],
    ) -> Result<Vec<ModelVersion>, StoreError> {
        let mut latest: Vec<ModelVersion> = Vec::new();

        for version in Self::list_versions(pool, model).await? {
            let wanted = stages.is_empty() || stages.contains(&version.stage);
            let seen = latest.iter().any(|kept| kept.stage == version.stage);
            if wanted && !seen {
                latest.push(version);
            }
        }

        Ok(latest)
    }

    /// Moves a version to `stage`.
    ///
    /// With `archive_existing`, other versions already in `stage` are archived in the
    /// same transaction, so at most one version holds it.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if the version does not exist.
    pub async fn transition_stage(
        pool: &SqlitePool,
        model: ModelKind,
        version: i64,
        stage: ModelStage,
        archive_existing: bool,
    ) -> Result<ModelVersion, StoreError> {
        let mut tx = pool.begin().await?;

        if archive_existing && stage != ModelStage::Archived {
            sqlx::query(
                r"
                UPDATE model_versions SET stage = ?
                WHERE model = ? AND stage = ? AND version <> ?
                ",
            )
            .bind(ModelStage::Archived.to_string())
            .bind(model.as_str())
            .bind(stage.to_string())
            .bind(version)
            .execute(&mut *tx)
            .await?;
        }

        let updated =
            sqlx::query("UPDATE model_versions SET stage = ? WHERE model = ? AND version = ?")
                .bind(stage.to_string())
                .bind(model.as_str())
                .bind(version)
                .execute(&mut *tx)
                .await?;

        if updated.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("{model} version {version}")));
        }

        let transitioned = Self::fetch_version(&mut tx, model, version).await?;
        tx.commit().await?;

        tracing::debug!(%model, version, %stage, "Model version transitioned");
        Ok(transitioned)
    }

    async fn fetch_version(
        tx: &mut Transaction<'_, Sqlite>,
        model: ModelKind,
        version: i64,
    ) -> Result<ModelVersion, StoreError> {
        let sql =
            format!("SELECT {VERSION_COLUMNS} FROM model_versions WHERE model = ? AND version = ?");
        let row: VersionRow = sqlx::query_as(&sql)
            .bind(model.as_str())
            .bind(version)
            .fetch_one(&mut **tx)
            .await?;

        ModelVersion::try_from(row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_pool;

    fn metrics(rmse: f64) -> BTreeMap<String, f64> {
        BTreeMap::from([("val_rmse".to_string(), rmse)])
    }

    #[tokio::test]
    async fn test_run_round_trip() {
        let pool = test_pool().await;

        let mut run = RunRecord::new(ModelKind::GradientBoost);
        run.params.insert("trigger_type".to_string(), "drift".into());
        run.metrics.insert("val_rmse".to_string(), 14.2);
        run.tags.insert("trigger_id".to_string(), Uuid::new_v4().to_string());
        run.started_at = from_millis(to_millis(run.started_at)).expect("valid");

        RegistryRepository::insert_run(&pool, &run).await.expect("insert");
        let found = RegistryRepository::find_run(&pool, run.run_id)
            .await
            .expect("find")
            .expect("run exists");
        assert_eq!(found, run);
    }

    #[tokio::test]
    async fn test_runs_listed_per_model_newest_first() {
        let pool = test_pool().await;

        let mut older = RunRecord::new(ModelKind::Recurrent);
        older.started_at = from_millis(1_700_000_000_000).expect("valid");
        let mut newer = RunRecord::new(ModelKind::Recurrent);
        newer.started_at = from_millis(1_700_000_060_000).expect("valid");
        let other = RunRecord::new(ModelKind::GraphSpatial);
        for run in [&older, &newer, &other] {
            RegistryRepository::insert_run(&pool, run).await.expect("insert");
        }

        let runs = RegistryRepository::list_runs(&pool, ModelKind::Recurrent)
            .await
            .expect("list");
        let ids: Vec<Uuid> = runs.iter().map(|run| run.run_id).collect();
        assert_eq!(ids, vec![newer.run_id, older.run_id]);
    }

    #[tokio::test]
    async fn test_versions_are_numbered_per_model() {
        let pool = test_pool().await;
        let run_id = Uuid::new_v4();

        let register = |model, rmse| {
            let pool = pool.clone();
            async move {
                RegistryRepository::register_version(&pool, model, run_id, &metrics(rmse), None)
                    .await
                    .expect("register")
            }
        };
        let first = register(ModelKind::Recurrent, 12.0).await;
        let second = register(ModelKind::Recurrent, 11.0).await;
        let other = register(ModelKind::GraphSpatial, 15.0).await;

        assert_eq!(first.version, 1);
        assert_eq!(second.version, 2);
        assert_eq!(other.version, 1);
        assert_eq!(second.stage, ModelStage::None);
    }

    #[tokio::test]
    async fn test_promotion_archives_previous_production() {
        let pool = test_pool().await;
        let run_id = Uuid::new_v4();
        let model = ModelKind::GradientBoost;

        for rmse in [14.0, 13.0] {
            RegistryRepository::register_version(&pool, model, run_id, &metrics(rmse), None)
                .await
                .expect("register");
        }

        RegistryRepository::transition_stage(&pool, model, 1, ModelStage::Production, true)
            .await
            .expect("promote v1");
        let promoted =
            RegistryRepository::transition_stage(&pool, model, 2, ModelStage::Production, true)
                .await
                .expect("promote v2");
        assert_eq!(promoted.stage, ModelStage::Production);

        let versions = RegistryRepository::list_versions(&pool, model).await.expect("list");
        assert_eq!(versions[0].stage, ModelStage::Production);
        assert_eq!(versions[1].stage, ModelStage::Archived);

        let latest = RegistryRepository::latest_versions(&pool, model, &[ModelStage::Production])
            .await
            .expect("latest");
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].version, 2);
    }

    #[tokio::test]
    async fn test_latest_versions_one_per_stage() {
        let pool = test_pool().await;
        let run_id = Uuid::new_v4();
        let model = ModelKind::Recurrent;

        for rmse in [14.0, 13.0, 12.0] {
            RegistryRepository::register_version(&pool, model, run_id, &metrics(rmse), None)
                .await
                .expect("register");
        }
        RegistryRepository::transition_stage(&pool, model, 1, ModelStage::Staging, false)
            .await
            .expect("stage");

        let latest = RegistryRepository::latest_versions(&pool, model, &[])
            .await
            .expect("latest");
        let pairs: Vec<_> = latest.iter().map(|v| (v.stage, v.version)).collect();
        assert_eq!(pairs, vec![(ModelStage::None, 3), (ModelStage::Staging, 1)]);
    }

    #[tokio::test]
    async fn test_artifact_path_is_stored() {
        let pool = test_pool().await;
        let model = ModelKind::GraphSpatial;
        let path = "models/graph_spatial/run.bin";

        let registered = RegistryRepository::register_version(
            &pool,
            model,
            Uuid::new_v4(),
            &metrics(9.0),
            Some(path),
        )
        .await
        .expect("register");
        assert_eq!(registered.artifact.as_deref(), Some(path));

        let listed = RegistryRepository::list_versions(&pool, model).await.expect("list");
        assert_eq!(listed[0].artifact.as_deref(), Some(path));
    }

    #[tokio::test]
    async fn test_transition_missing_version() {
        let pool = test_pool().await;
        let model = ModelKind::Recurrent;
        let result =
            RegistryRepository::transition_stage(&pool, model, 9, ModelStage::Production, true)
                .await;
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }
}
