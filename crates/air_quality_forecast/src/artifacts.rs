//! Saved forecaster parameters.
//!
//! Every registered version has its fit written to the object store under
//! `models/{kind}/{run_id}.bin`, and the registry keeps that path. On startup
//! the production version of each model is read back into its slot.

use std::sync::Arc;

use bytes::Bytes;
use forecast_structs::{ModelKind, ModelStage};
use ml_model::{ForecastError, Forecaster};
use object_store::ObjectStore;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::ensemble::EnsembleForecaster;
use crate::orchestrator::ForecasterFactory;
use crate::persistence::{load_bytes, save_bytes};
use crate::tracker::ExperimentTracker;

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("object store error: {0}")]
    Store(#[from] object_store::Error),

    #[error(transparent)]
    Model(#[from] ForecastError),

    #[error("artifact {0} not found")]
    Missing(String),
}

/// Object store path for the parameters produced by `run_id`.
#[must_use]
pub fn artifact_path(kind: ModelKind, run_id: Uuid) -> String {
    format!("models/{kind}/{run_id}.bin")
}

#[derive(Clone)]
pub struct ArtifactStore {
    store: Arc<dyn ObjectStore>,
}

impl ArtifactStore {
    #[must_use]
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    /// Writes the fit of `model` and returns its path.
    pub async fn save(
        &self,
        model: &dyn Forecaster,
        run_id: Uuid,
    ) -> Result<String, ArtifactError> {
        let path = artifact_path(model.kind(), run_id);
        let payload = Bytes::from(model.save()?);
        save_bytes(self.store.as_ref(), &path, payload).await?;
        Ok(path)
    }

    /// Restores the fit saved at `path` into `model`.
    pub async fn load(
        &self,
        path: &str,
        mut model: Box<dyn Forecaster>,
    ) -> Result<Box<dyn Forecaster>, ArtifactError> {
        let bytes = load_bytes(self.store.as_ref(), path)
            .await?
            .ok_or_else(|| ArtifactError::Missing(path.to_string()))?;
        model.restore(&bytes)?;
        Ok(model)
    }

    /// Puts the saved production version of every model back in its slot.
    ///
    /// Models without a production version, or whose parameters cannot be
    /// read, keep their current forecaster. Returns the models restored.
    pub async fn restore_production(
        &self,
        ensemble: &EnsembleForecaster,
        tracker: &dyn ExperimentTracker,
        factory: &ForecasterFactory,
    ) -> Vec<ModelKind> {
        let mut restored = Vec::new();

        for slot in ensemble.slots() {
            let kind = slot.kind();
            let latest = tracker.get_latest_versions(kind, &[ModelStage::Production]).await;
            let production = match latest {
                Ok(versions) => versions.into_iter().next(),
                Err(error) => {
                    warn!(model = %kind, %error, "Could not look up the production version");
                    continue;
                }
            };
            let Some(version) = production else {
                continue;
            };
            let Some(path) = version.artifact.as_deref() else {
                warn!(
                    model = %kind,
                    version = version.version,
                    "Production version has no saved parameters"
                );
                continue;
            };

            match self.load(path, factory(kind)).await {
                Ok(model) => {
                    slot.replace(model);
                    info!(model = %kind, version = version.version, "Production model restored");
                    restored.push(kind);
                }
                Err(error) => {
                    warn!(
                        model = %kind,
                        version = version.version,
                        %error,
                        "Could not restore production model"
                    );
                }
            }
        }

        restored
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use ml_model::{GradientBoostConfig, GradientBoostForecaster, TrainingData};

    use super::*;
    use crate::data_source::fixtures;
    use crate::test_support::store;

    fn training_data() -> TrainingData {
        let observations = fixtures::hourly_observations(Utc::now(), 3, 30.0);
        TrainingData::from_samples(feature_extractor::build_samples(&observations))
    }

    #[tokio::test]
    async fn test_saved_fit_loads_into_fresh_model() {
        let artifacts = ArtifactStore::new(store());
        let data = training_data();
        let mut model = GradientBoostForecaster::new(GradientBoostConfig::default());
        model.train(&data).expect("train");

        let run_id = Uuid::new_v4();
        let path = artifacts.save(&model, run_id).await.expect("save");
        assert_eq!(path, format!("models/gradient_boost/{run_id}.bin"));

        let fresh = ml_model::create_forecaster(ModelKind::GradientBoost);
        let loaded = artifacts.load(&path, fresh).await.expect("load");
        assert!(loaded.is_trained());

        let rows = data.rows();
        let original = model.predict(&rows[..3], false).expect("predict");
        let restored = loaded.predict(&rows[..3], false).expect("predict");
        for (a, b) in original.predictions.iter().zip(&restored.predictions) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[tokio::test]
    async fn test_untrained_and_missing_artifacts_fail() {
        let artifacts = ArtifactStore::new(store());
        let untrained = ml_model::create_forecaster(ModelKind::Recurrent);
        assert!(matches!(
            artifacts.save(untrained.as_ref(), Uuid::new_v4()).await,
            Err(ArtifactError::Model(ForecastError::NotTrained(_)))
        ));

        let fresh = ml_model::create_forecaster(ModelKind::Recurrent);
        assert!(matches!(
            artifacts.load("models/recurrent/gone.bin", fresh).await,
            Err(ArtifactError::Missing(_))
        ));
    }
}
