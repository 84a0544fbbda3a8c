//! Ensemble combiner.
//!
//! Each model kind has a [`ModelSlot`] holding the forecaster currently
//! serving predictions. A prediction polls every slot, drops models that are
//! untrained or fail, renormalizes the blend weights over the responders and
//! propagates their uncertainty, penalizing disagreement between them.
//!
//! Weights are swapped atomically as a whole map, so a prediction never sees a
//! partially updated set.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use arc_swap::ArcSwap;
use chrono::{DateTime, Duration, Utc};
use config::EnsembleConfig;
use feature_extractor::FeatureRow;
use forecast_structs::{
    AqiCategory, EnsemblePrediction, EnsembleWeights, IndividualPrediction, ModelKind,
    ModelParticipation, ModelPerformance, PerformanceSnapshot, WeatherForecast, pm25_to_aqi,
};
use ml_model::Forecaster;
use object_store::ObjectStore;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::persistence::{load_json, save_json};

/// Object store path of the persisted weights and performance history.
pub const STATE_PATH: &str = "ensemble/state.json";

#[derive(Debug, Error)]
pub enum EnsembleError {
    #[error("only {available} of the required {required} models responded")]
    InsufficientModels {
        required: usize,
        available: usize,
        participation: BTreeMap<ModelKind, ModelParticipation>,
    },
}

/// The forecaster serving one model kind.
///
/// Promotion swaps in a new forecaster without blocking readers.
pub struct ModelSlot {
    kind: ModelKind,
    forecaster: ArcSwap<Box<dyn Forecaster>>,
}

impl ModelSlot {
    #[must_use]
    pub fn new(forecaster: Box<dyn Forecaster>) -> Self {
        Self {
            kind: forecaster.kind(),
            forecaster: ArcSwap::from_pointee(forecaster),
        }
    }

    #[must_use]
    pub const fn kind(&self) -> ModelKind {
        self.kind
    }

    /// The forecaster serving right now.
    #[must_use]
    pub fn load(&self) -> Arc<Box<dyn Forecaster>> {
        self.forecaster.load_full()
    }

    pub fn replace(&self, forecaster: Box<dyn Forecaster>) {
        self.install(Arc::new(forecaster));
    }

    /// Serves `forecaster` from now on.
    pub fn install(&self, forecaster: Arc<Box<dyn Forecaster>>) {
        self.forecaster.store(forecaster);
    }

    #[must_use]
    pub fn is_trained(&self) -> bool {
        self.forecaster.load().is_trained()
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedState {
    weights: EnsembleWeights,
    #[serde(default)]
    history: BTreeMap<ModelKind, Vec<PerformanceSnapshot>>,
}

/// Blends the models in its slots into one forecast.
pub struct EnsembleForecaster {
    config: EnsembleConfig,
    slots: BTreeMap<ModelKind, ModelSlot>,
    weights: ArcSwap<EnsembleWeights>,
    history: Mutex<BTreeMap<ModelKind, VecDeque<PerformanceSnapshot>>>,
    store: Arc<dyn ObjectStore>,
}

impl EnsembleForecaster {
    /// Builds the ensemble, restoring weights and history from the object store.
    ///
    /// A missing or unreadable document starts from equal weights.
    pub async fn load(
        config: EnsembleConfig,
        store: Arc<dyn ObjectStore>,
        forecasters: impl IntoIterator<Item = Box<dyn Forecaster>>,
    ) -> Self {
        let slots: BTreeMap<ModelKind, ModelSlot> = forecasters
            .into_iter()
            .map(|forecaster| (forecaster.kind(), ModelSlot::new(forecaster)))
            .collect();

        let state = match load_json::<PersistedState>(store.as_ref(), STATE_PATH).await {
            Ok(Some(state)) => state,
            Ok(None) => PersistedState::default(),
            Err(error) => {
                warn!(%error, "Ensemble state unreadable, starting from equal weights");
                PersistedState::default()
            }
        };

        let weights = if state.weights.is_empty() {
            EnsembleWeights::equal(slots.keys().copied())
        } else {
            state.weights.normalized()
        };

        let history = state
            .history
            .into_iter()
            .map(|(kind, snapshots)| {
                let skip = snapshots.len().saturating_sub(config.history_capacity);
                (kind, snapshots.into_iter().skip(skip).collect())
            })
            .collect();

        Self {
            config,
            slots,
            weights: ArcSwap::from_pointee(weights),
            history: Mutex::new(history),
            store,
        }
    }

    #[must_use]
    pub fn slot(&self, kind: ModelKind) -> Option<&ModelSlot> {
        self.slots.get(&kind)
    }

    pub fn slots(&self) -> impl Iterator<Item = &ModelSlot> {
        self.slots.values()
    }

    /// Current blend weights over every model.
    #[must_use]
    pub fn weights(&self) -> EnsembleWeights {
        self.weights.load().as_ref().clone()
    }

    /// Blended single-step forecast for `row`.
    ///
    /// # Errors
    ///
    /// Returns [`EnsembleError::InsufficientModels`] when fewer than the
    /// configured minimum of models responded.
    pub fn predict(&self, row: &FeatureRow) -> Result<EnsemblePrediction, EnsembleError> {
        let weights = self.weights.load_full();

        let mut participation = BTreeMap::new();
        let mut responses = BTreeMap::new();
        for slot in self.slots.values() {
            match self.poll(slot, row) {
                Ok(prediction) => {
                    participation.insert(slot.kind, ModelParticipation::Responded);
                    responses.insert(slot.kind, prediction);
                }
                Err(status) => {
                    participation.insert(slot.kind, status);
                }
            }
        }

        if responses.len() < self.config.min_models.max(1) {
            return Err(EnsembleError::InsufficientModels {
                required: self.config.min_models.max(1),
                available: responses.len(),
                participation,
            });
        }

        let combined = combine(&responses, &weights, &self.config);
        debug!(
            responded = responses.len(),
            pm25 = combined.pm25,
            uncertainty = combined.uncertainty,
            "Ensemble prediction"
        );

        let aqi = pm25_to_aqi(combined.pm25);
        Ok(EnsemblePrediction {
            timestamp: row.timestamp,
            pm25: combined.pm25,
            pm25_lower: combined.lower,
            pm25_upper: combined.upper,
            aqi,
            category: AqiCategory::from_aqi(aqi),
            confidence: combined.confidence,
            model_weights: combined.weights,
            individual_predictions: responses,
            participation,
            uncertainty: combined.uncertainty,
            fallback: false,
        })
    }

    /// Forecasts hour by hour, starting at `start.timestamp` and continuing
    /// for each entry of `weather`.
    ///
    /// Each step feeds the previous step's PM2.5 back in as the newest lag. A
    /// step that cannot be predicted yields a low-confidence fallback value
    /// instead of ending the sequence.
    #[must_use]
    pub fn forecast_sequence(
        &self,
        start: &FeatureRow,
        weather: &[WeatherForecast],
    ) -> Vec<EnsemblePrediction> {
        let mut forecasts = Vec::with_capacity(weather.len() + 1);
        let mut row = start.clone();

        for step in 0..=weather.len() {
            let prediction = self.predict(&row).unwrap_or_else(|error| {
                warn!(%error, timestamp = %row.timestamp, "Forecast step failed, using fallback");
                self.fallback_prediction(row.timestamp, error)
            });

            if let Some(next) = weather.get(step) {
                row = row.advance(prediction.pm25, next);
            }
            forecasts.push(prediction);
        }

        forecasts
    }

    /// Recomputes weights from inverse RMSE and records the snapshots.
    ///
    /// Models absent from `report` keep a decayed share of their weight. The
    /// new map replaces the old one in a single swap and is persisted.
    pub async fn update_weights(
        &self,
        report: &BTreeMap<ModelKind, PerformanceSnapshot>,
    ) -> EnsembleWeights {
        let mut history = self.history.lock().await;

        let current = self.weights.load_full();
        let known = self.slots.keys().copied().chain(current.models());
        let updated = blend_weights(&current, report, known, &self.config);

        for (kind, snapshot) in report {
            let entries = history.entry(*kind).or_default();
            entries.push_back(*snapshot);
            while entries.len() > self.config.history_capacity {
                entries.pop_front();
            }
        }

        self.weights.store(Arc::new(updated.clone()));
        info!(weights = ?updated, "Ensemble weights updated");

        let state = PersistedState {
            weights: updated.clone(),
            history: history
                .iter()
                .map(|(kind, entries)| (*kind, entries.iter().copied().collect()))
                .collect(),
        };
        if let Err(error) = save_json(self.store.as_ref(), STATE_PATH, &state).await {
            warn!(%error, "Failed to persist ensemble state");
        }

        updated
    }

    /// Rolling summary per model with recorded performance.
    pub async fn model_performance(&self) -> BTreeMap<ModelKind, ModelPerformance> {
        let history = self.history.lock().await;
        let now = Utc::now();

        history
            .iter()
            .filter_map(|(kind, entries)| Some((*kind, summarize(entries, now)?)))
            .collect()
    }

    fn poll(
        &self,
        slot: &ModelSlot,
        row: &FeatureRow,
    ) -> Result<IndividualPrediction, ModelParticipation> {
        let forecaster = slot.load();
        if !forecaster.is_trained() {
            return Err(ModelParticipation::Untrained);
        }

        let output = forecaster
            .predict(core::slice::from_ref(row), true)
            .map_err(|error| {
                warn!(model = %slot.kind, %error, "Model excluded from ensemble");
                ModelParticipation::Failed {
                    reason: error.to_string(),
                }
            })?;

        let value = output
            .predictions
            .first()
            .copied()
            .filter(|value| value.is_finite())
            .ok_or_else(|| {
                warn!(model = %slot.kind, "Model returned no usable prediction");
                ModelParticipation::Failed {
                    reason: "no usable prediction".to_string(),
                }
            })?;

        let uncertainty = output
            .uncertainty(0)
            .filter(|u| u.is_finite() && *u >= 0.0)
            .unwrap_or(self.config.default_model_uncertainty);

        Ok(IndividualPrediction {
            value,
            lower: value - uncertainty,
            upper: value + uncertainty,
            uncertainty,
        })
    }

    fn fallback_prediction(
        &self,
        timestamp: DateTime<Utc>,
        error: EnsembleError,
    ) -> EnsemblePrediction {
        let EnsembleError::InsufficientModels { participation, .. } = error;
        let pm25 = self.config.fallback_pm25;
        let uncertainty = self.config.max_uncertainty;
        let half_width = self.config.confidence_level.z_score() * uncertainty;
        let aqi = pm25_to_aqi(pm25);

        EnsemblePrediction {
            timestamp,
            pm25,
            pm25_lower: (pm25 - half_width).max(0.0),
            pm25_upper: pm25 + half_width,
            aqi,
            category: AqiCategory::from_aqi(aqi),
            confidence: self.config.fallback_confidence,
            model_weights: EnsembleWeights::default(),
            individual_predictions: BTreeMap::new(),
            participation,
            uncertainty,
            fallback: true,
        }
    }
}

/// Blend of the responding models.
#[derive(Debug, Clone, PartialEq)]
struct Combined {
    pm25: f64,
    lower: f64,
    upper: f64,
    uncertainty: f64,
    confidence: f64,
    weights: EnsembleWeights,
}

fn combine(
    responses: &BTreeMap<ModelKind, IndividualPrediction>,
    weights: &EnsembleWeights,
    config: &EnsembleConfig,
) -> Combined {
    let responders: Vec<ModelKind> = responses.keys().copied().collect();
    let weights = weights.renormalized_over(&responders);

    let pm25: f64 = responses
        .iter()
        .map(|(kind, prediction)| weights.get(*kind) * prediction.value)
        .sum();

    let uncertainty = match responses.values().next() {
        Some(only) if responses.len() == 1 => only.uncertainty,
        _ => responses
            .iter()
            .map(|(kind, prediction)| {
                let disagreement = prediction.value - pm25;
                let spread = prediction
                    .uncertainty
                    .mul_add(prediction.uncertainty, disagreement * disagreement);
                weights.get(*kind) * spread
            })
            .sum::<f64>()
            .sqrt(),
    };

    let half_width = config.confidence_level.z_score() * uncertainty;
    // Concentrations are never negative.
    let lower = (pm25 - half_width).max(pm25.min(0.0));

    Combined {
        pm25,
        lower,
        upper: pm25 + half_width,
        uncertainty,
        confidence: confidence_score(uncertainty, config.max_uncertainty),
        weights,
    }
}

/// `max(0.1, 1 - min(u / max_u, 1))`.
fn confidence_score(uncertainty: f64, max_uncertainty: f64) -> f64 {
    if !uncertainty.is_finite() || max_uncertainty <= 0.0 {
        return 0.1;
    }
    (1.0 - (uncertainty / max_uncertainty).min(1.0)).clamp(0.1, 1.0)
}

/// Inverse-RMSE weights for reported models, decayed weights for the rest,
/// renormalized to sum to 1.
fn blend_weights(
    current: &EnsembleWeights,
    report: &BTreeMap<ModelKind, PerformanceSnapshot>,
    known: impl IntoIterator<Item = ModelKind>,
    config: &EnsembleConfig,
) -> EnsembleWeights {
    let scores = EnsembleWeights::from_raw(
        report
            .iter()
            .map(|(kind, snapshot)| (*kind, 1.0 / snapshot.rmse.max(config.rmse_floor))),
    )
    .normalized();

    let mut raw: BTreeMap<ModelKind, f64> = known
        .into_iter()
        .map(|kind| (kind, current.get(kind) * config.missing_weight_decay))
        .collect();
    for (kind, score) in scores.iter() {
        raw.insert(kind, score);
    }

    EnsembleWeights::from_raw(raw).normalized()
}

fn summarize(
    entries: &VecDeque<PerformanceSnapshot>,
    now: DateTime<Utc>,
) -> Option<ModelPerformance> {
    let latest = entries.back()?;
    let count = entries.len() as f64;

    let mean_accuracy_since = |cutoff: DateTime<Utc>| {
        let recent: Vec<f64> = entries
            .iter()
            .filter(|snapshot| snapshot.recorded_at >= cutoff)
            .map(|snapshot| snapshot.accuracy)
            .collect();
        if recent.is_empty() {
            latest.accuracy
        } else {
            recent.iter().sum::<f64>() / recent.len() as f64
        }
    };

    Some(ModelPerformance {
        rmse: entries.iter().map(|snapshot| snapshot.rmse).sum::<f64>() / count,
        mae: entries.iter().map(|snapshot| snapshot.mae).sum::<f64>() / count,
        accuracy_1h: mean_accuracy_since(now - Duration::hours(1)),
        accuracy_24h: mean_accuracy_since(now - Duration::hours(24)),
        last_updated: latest.recorded_at,
        sample_count: entries.len(),
    })
}

#[cfg(test)]
mod tests {
    use feature_extractor::HISTORY_HOURS;
    use ml_model::{CancelToken, ForecastError, PredictionOutput, TrainingData, TrainingMetrics};
    use proptest::prelude::*;

    use super::*;
    use crate::test_support::store;

    /// Forecaster returning a fixed value, or failing.
    struct Fixed {
        kind: ModelKind,
        value: f64,
        uncertainty: f64,
        trained: bool,
        fails: bool,
    }

    impl Fixed {
        fn boxed(kind: ModelKind, value: f64, uncertainty: f64) -> Box<dyn Forecaster> {
            Box::new(Self {
                kind,
                value,
                uncertainty,
                trained: true,
                fails: false,
            })
        }
    }

    impl Forecaster for Fixed {
        fn kind(&self) -> ModelKind {
            self.kind
        }

        fn is_trained(&self) -> bool {
            self.trained
        }

        fn train_cancellable(
            &mut self,
            data: &TrainingData,
            _cancel: &CancelToken,
        ) -> Result<TrainingMetrics, ForecastError> {
            self.trained = true;
            Ok(TrainingMetrics {
                rmse: 0.0,
                mae: 0.0,
                sample_count: data.len(),
            })
        }

        fn predict(
            &self,
            rows: &[FeatureRow],
            return_confidence: bool,
        ) -> Result<PredictionOutput, ForecastError> {
            if self.fails {
                return Err(ForecastError::InvalidInput("sensor gap".to_string()));
            }
            Ok(PredictionOutput::with_interval(
                vec![self.value; rows.len()],
                self.uncertainty,
                return_confidence,
            ))
        }

        fn save(&self) -> Result<Vec<u8>, ForecastError> {
            Ok(self.value.to_le_bytes().to_vec())
        }

        fn restore(&mut self, _bytes: &[u8]) -> Result<(), ForecastError> {
            self.trained = true;
            Ok(())
        }
    }

    /// Forecaster predicting last hour's value plus `increment`.
    struct Echo {
        kind: ModelKind,
        increment: f64,
    }

    impl Forecaster for Echo {
        fn kind(&self) -> ModelKind {
            self.kind
        }

        fn is_trained(&self) -> bool {
            true
        }

        fn train_cancellable(
            &mut self,
            data: &TrainingData,
            _cancel: &CancelToken,
        ) -> Result<TrainingMetrics, ForecastError> {
            Ok(TrainingMetrics {
                rmse: 0.0,
                mae: 0.0,
                sample_count: data.len(),
            })
        }

        fn predict(
            &self,
            rows: &[FeatureRow],
            return_confidence: bool,
        ) -> Result<PredictionOutput, ForecastError> {
            let predictions = rows.iter().map(|row| row.lag1() + self.increment).collect();
            Ok(PredictionOutput::with_interval(predictions, 1.0, return_confidence))
        }

        fn save(&self) -> Result<Vec<u8>, ForecastError> {
            Ok(self.increment.to_le_bytes().to_vec())
        }

        fn restore(&mut self, _bytes: &[u8]) -> Result<(), ForecastError> {
            Ok(())
        }
    }

    fn row() -> FeatureRow {
        FeatureRow {
            station_id: "central".to_string(),
            timestamp: Utc::now(),
            temperature: 12.0,
            humidity: 70.0,
            wind_speed: 2.0,
            pressure: 1010.0,
            history: vec![30.0; HISTORY_HOURS],
            neighbor_pm25: Some(28.0),
        }
    }

    fn snapshot(rmse: f64) -> PerformanceSnapshot {
        PerformanceSnapshot {
            rmse,
            mae: rmse * 0.8,
            accuracy: 80.0,
            recorded_at: Utc::now(),
        }
    }

    async fn three_models(values: [f64; 3]) -> EnsembleForecaster {
        EnsembleForecaster::load(
            EnsembleConfig::default(),
            store(),
            [
                Fixed::boxed(ModelKind::GradientBoost, values[0], 5.0),
                Fixed::boxed(ModelKind::Recurrent, values[1], 5.0),
                Fixed::boxed(ModelKind::GraphSpatial, values[2], 5.0),
            ],
        )
        .await
    }

    #[tokio::test]
    async fn test_disagreement_widens_uncertainty() {
        let ensemble = three_models([40.0, 50.0, 60.0]).await;

        let prediction = ensemble.predict(&row()).expect("predict");
        assert!((prediction.pm25 - 50.0).abs() < 1e-9);
        assert!(prediction.uncertainty > 5.0);
        assert!(prediction.pm25_lower <= prediction.pm25);
        assert!(prediction.pm25 <= prediction.pm25_upper);
        assert_eq!(prediction.individual_predictions.len(), 3);
        assert!(prediction.model_weights.is_normalized(1e-9));
    }

    #[tokio::test]
    async fn test_failed_and_untrained_models_are_excluded() {
        let ensemble = EnsembleForecaster::load(
            EnsembleConfig::default(),
            store(),
            [
                Fixed::boxed(ModelKind::GradientBoost, 42.0, 4.0),
                Box::new(Fixed {
                    kind: ModelKind::Recurrent,
                    value: 90.0,
                    uncertainty: 1.0,
                    trained: true,
                    fails: true,
                }) as Box<dyn Forecaster>,
                Box::new(Fixed {
                    kind: ModelKind::GraphSpatial,
                    value: 10.0,
                    uncertainty: 1.0,
                    trained: false,
                    fails: false,
                }),
            ],
        )
        .await;

        let prediction = ensemble.predict(&row()).expect("predict");
        assert!((prediction.pm25 - 42.0).abs() < 1e-9);
        assert!(
            (prediction.uncertainty - 4.0).abs() < 1e-9,
            "single responder keeps its own uncertainty"
        );
        let participation = &prediction.participation;
        assert_eq!(participation[&ModelKind::GradientBoost], ModelParticipation::Responded);
        assert_eq!(participation[&ModelKind::GraphSpatial], ModelParticipation::Untrained);
        assert!(matches!(
            prediction.participation[&ModelKind::Recurrent],
            ModelParticipation::Failed { .. }
        ));
        assert!((prediction.model_weights.get(ModelKind::GradientBoost) - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_no_responders_fails_and_sequence_falls_back() {
        let ensemble = EnsembleForecaster::load(
            EnsembleConfig::default(),
            store(),
            ModelKind::all().map(ml_model::create_forecaster),
        )
        .await;

        assert!(matches!(
            ensemble.predict(&row()),
            Err(EnsembleError::InsufficientModels { available: 0, .. })
        ));

        let start = row();
        let weather: Vec<WeatherForecast> = (1..=3)
            .map(|hour| WeatherForecast {
                timestamp: start.timestamp + Duration::hours(hour),
                temperature: 11.0,
                humidity: 72.0,
                wind_speed: 2.5,
                pressure: 1009.0,
            })
            .collect();

        let forecasts = ensemble.forecast_sequence(&start, &weather);
        assert_eq!(forecasts.len(), 4);
        for forecast in &forecasts {
            assert!(forecast.fallback);
            assert!((forecast.pm25 - 25.0).abs() < f64::EPSILON);
            assert!((forecast.confidence - 0.1).abs() < f64::EPSILON);
        }
        assert_eq!(forecasts[3].timestamp, weather[2].timestamp);
    }

    #[tokio::test]
    async fn test_sequence_steps_hourly() {
        let ensemble = three_models([30.0, 30.0, 30.0]).await;
        let start = row();
        let weather = [WeatherForecast {
            timestamp: start.timestamp + Duration::hours(1),
            temperature: 10.0,
            humidity: 75.0,
            wind_speed: 1.0,
            pressure: 1012.0,
        }];

        let forecasts = ensemble.forecast_sequence(&start, &weather);
        assert_eq!(forecasts.len(), 2);
        assert!(forecasts.iter().all(|forecast| !forecast.fallback));
        assert_eq!(forecasts[1].timestamp, weather[0].timestamp);
    }

    #[tokio::test]
    async fn test_sequence_feeds_each_step_back_as_lag() {
        let ensemble = EnsembleForecaster::load(
            EnsembleConfig::default(),
            store(),
            ModelKind::all().map(|kind| {
                Box::new(Echo {
                    kind,
                    increment: 2.0,
                }) as Box<dyn Forecaster>
            }),
        )
        .await;
        let start = row();
        let weather: Vec<WeatherForecast> = (1..=3)
            .map(|hour| WeatherForecast {
                timestamp: start.timestamp + Duration::hours(hour),
                temperature: 10.0,
                humidity: 75.0,
                wind_speed: 1.0,
                pressure: 1012.0,
            })
            .collect();

        let forecasts = ensemble.forecast_sequence(&start, &weather);
        let levels: Vec<f64> = forecasts.iter().map(|forecast| forecast.pm25).collect();
        for (step, level) in levels.iter().enumerate() {
            let expected = 2.0f64.mul_add(step as f64 + 1.0, 30.0);
            assert!((level - expected).abs() < 1e-9, "step {step}: {level}");
        }
        assert!(forecasts.iter().all(|forecast| !forecast.fallback));
    }

    #[tokio::test]
    async fn test_update_weights_prefers_low_rmse_and_decays_missing() {
        let ensemble = three_models([40.0, 50.0, 60.0]).await;

        let report = BTreeMap::from([
            (ModelKind::GradientBoost, snapshot(10.0)),
            (ModelKind::Recurrent, snapshot(20.0)),
        ]);
        let weights = ensemble.update_weights(&report).await;

        assert!(weights.is_normalized(1e-6));
        assert!(weights.get(ModelKind::GradientBoost) > weights.get(ModelKind::Recurrent));
        // Scores 2/3 and 1/3 plus half of the spatial model's 1/3.
        let total = 1.0 + 1.0 / 6.0;
        assert!((weights.get(ModelKind::GraphSpatial) - (1.0 / 6.0) / total).abs() < 1e-9);
        assert_eq!(ensemble.weights(), weights);
    }

    #[tokio::test]
    async fn test_weights_and_history_survive_reload() {
        let shared = store();
        let ensemble = EnsembleForecaster::load(
            EnsembleConfig::default(),
            Arc::clone(&shared),
            [
                Fixed::boxed(ModelKind::GradientBoost, 40.0, 5.0),
                Fixed::boxed(ModelKind::Recurrent, 45.0, 5.0),
            ],
        )
        .await;
        let weights = ensemble
            .update_weights(&BTreeMap::from([(ModelKind::GradientBoost, snapshot(12.0))]))
            .await;

        let reloaded = EnsembleForecaster::load(
            EnsembleConfig::default(),
            shared,
            [
                Fixed::boxed(ModelKind::GradientBoost, 40.0, 5.0),
                Fixed::boxed(ModelKind::Recurrent, 45.0, 5.0),
            ],
        )
        .await;
        assert_eq!(reloaded.weights(), weights);

        let performance = reloaded.model_performance().await;
        assert_eq!(performance[&ModelKind::GradientBoost].sample_count, 1);
        assert!((performance[&ModelKind::GradientBoost].rmse - 12.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_history_is_capped() {
        let config = EnsembleConfig {
            history_capacity: 3,
            ..EnsembleConfig::default()
        };
        let models = [Fixed::boxed(ModelKind::Recurrent, 40.0, 5.0)];
        let ensemble = EnsembleForecaster::load(config, store(), models).await;

        for rmse in [10.0, 11.0, 12.0, 13.0, 14.0] {
            ensemble
                .update_weights(&BTreeMap::from([(ModelKind::Recurrent, snapshot(rmse))]))
                .await;
        }

        let performance = ensemble.model_performance().await;
        let recurrent = &performance[&ModelKind::Recurrent];
        assert_eq!(recurrent.sample_count, 3);
        assert!((recurrent.rmse - 13.0).abs() < 1e-9, "oldest entries evicted");
    }

    #[tokio::test]
    async fn test_slot_replace_is_visible_to_predict() {
        let models = [Fixed::boxed(ModelKind::Recurrent, 40.0, 5.0)];
        let ensemble = EnsembleForecaster::load(EnsembleConfig::default(), store(), models).await;

        let slot = ensemble.slot(ModelKind::Recurrent).expect("slot");
        slot.replace(Fixed::boxed(ModelKind::Recurrent, 55.0, 5.0));

        let prediction = ensemble.predict(&row()).expect("predict");
        assert!((prediction.pm25 - 55.0).abs() < 1e-9);
    }

    #[test]
    fn test_confidence_bounds() {
        assert!((confidence_score(0.0, 50.0) - 1.0).abs() < f64::EPSILON);
        assert!((confidence_score(25.0, 50.0) - 0.5).abs() < f64::EPSILON);
        assert!((confidence_score(500.0, 50.0) - 0.1).abs() < f64::EPSILON);
        assert!((confidence_score(f64::NAN, 50.0) - 0.1).abs() < f64::EPSILON);
    }

    fn kind_strategy() -> impl Strategy<Value = ModelKind> {
        prop_oneof![
            Just(ModelKind::GradientBoost),
            Just(ModelKind::Recurrent),
            Just(ModelKind::GraphSpatial),
        ]
    }

    proptest! {
        #[test]
        fn prop_update_weights_normalized(
            current in prop::collection::vec(0.0f64..10.0, 3),
            report in prop::collection::btree_map(kind_strategy(), 0.0f64..200.0, 0..=3),
        ) {
            let current = EnsembleWeights::from_raw(ModelKind::all().zip(current));
            let report: BTreeMap<ModelKind, PerformanceSnapshot> =
                report.into_iter().map(|(kind, rmse)| (kind, snapshot(rmse))).collect();

            let config = EnsembleConfig::default();
            let updated = blend_weights(&current, &report, ModelKind::all(), &config);
            prop_assert!(updated.is_normalized(1e-6));
            prop_assert_eq!(updated.len(), 3);
        }

        #[test]
        fn prop_interval_contains_point(
            responses in prop::collection::btree_map(
                kind_strategy(),
                (0.0f64..500.0, 0.0f64..100.0),
                1..=3,
            ),
            raw_weights in prop::collection::vec(0.0f64..1.0, 3),
        ) {
            let responses: BTreeMap<ModelKind, IndividualPrediction> = responses
                .into_iter()
                .map(|(kind, (value, uncertainty))| {
                    let prediction = IndividualPrediction {
                        value,
                        lower: value - uncertainty,
                        upper: value + uncertainty,
                        uncertainty,
                    };
                    (kind, prediction)
                })
                .collect();
            let weights = EnsembleWeights::from_raw(ModelKind::all().zip(raw_weights));

            let combined = combine(&responses, &weights, &EnsembleConfig::default());
            prop_assert!(combined.lower <= combined.pm25);
            prop_assert!(combined.pm25 <= combined.upper);
            prop_assert!(combined.confidence > 0.0 && combined.confidence <= 1.0);
            prop_assert!(combined.weights.is_normalized(1e-6));
        }
    }
}
