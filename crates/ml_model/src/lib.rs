//! ML model crate for PM2.5 forecasting.
//!
//! Every forecaster implements the [`Forecaster`] strategy trait so the
//! ensemble and the retraining pipeline can treat them as black boxes with a
//! train/predict/evaluate contract.

use feature_extractor::{FeatureRow, Sample};
use forecast_structs::ModelKind;

mod cancel;
pub mod dataset;
mod error;
mod gradient_boost;
mod graph_spatial;
pub mod metrics;
mod recurrent;
pub mod training;

pub use cancel::CancelToken;
pub use error::ForecastError;
pub use gradient_boost::{GradientBoostConfig, GradientBoostForecaster};
pub use graph_spatial::{GraphSpatialConfig, GraphSpatialForecaster};
pub use metrics::{EvaluationMetrics, TrainingMetrics};
pub use recurrent::RecurrentForecaster;
pub use training::TrainingConfig;

/// Smallest uncertainty a model reports, in µg/m³.
pub const MIN_UNCERTAINTY: f64 = 1.0;

/// Share of the latest samples held out to calibrate a model's uncertainty.
pub const CALIBRATION_FRACTION: f64 = 0.2;

/// Training data container.
#[derive(Debug, Clone, Default)]
pub struct TrainingData {
    pub samples: Vec<Sample>,
}

impl TrainingData {
    /// Creates a new empty training data container.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            samples: Vec::new(),
        }
    }

    #[must_use]
    pub const fn from_samples(samples: Vec<Sample>) -> Self {
        Self { samples }
    }

    /// Adds samples to the training data.
    pub fn add_samples(&mut self, samples: Vec<Sample>) {
        self.samples.extend(samples);
    }

    /// Returns the number of samples.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.samples.len()
    }

    /// Returns true if there are no samples.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Feature rows, in sample order.
    #[must_use]
    pub fn rows(&self) -> Vec<FeatureRow> {
        self.samples.iter().map(|sample| sample.row.clone()).collect()
    }

    /// Observed PM2.5 values, in sample order.
    #[must_use]
    pub fn targets(&self) -> Vec<f64> {
        self.samples.iter().map(|sample| sample.target).collect()
    }

    /// Splits off the latest `fraction` of samples by timestamp.
    ///
    /// Returns `(earlier, latest)`. With two or more samples, both parts are
    /// non-empty.
    #[must_use]
    pub fn split_latest(&self, fraction: f64) -> (Self, Self) {
        let mut samples = self.samples.clone();
        samples.sort_by_key(|sample| sample.row.timestamp);

        let held_out = ((samples.len() as f64 * fraction).ceil() as usize)
            .max(1)
            .min(samples.len().saturating_sub(1));
        let latest = samples.split_off(samples.len() - held_out);
        (Self::from_samples(samples), Self::from_samples(latest))
    }

    /// Fails with [`ForecastError::NotEnoughData`] below `required` samples.
    pub const fn require(&self, required: usize) -> Result<(), ForecastError> {
        if self.samples.len() < required {
            return Err(ForecastError::NotEnoughData {
                required,
                actual: self.samples.len(),
            });
        }
        Ok(())
    }
}

/// Output of a single-step prediction.
#[derive(Debug, Clone, PartialEq)]
pub struct PredictionOutput {
    pub predictions: Vec<f64>,
    /// Present only when confidence was requested.
    pub lower_bound: Option<Vec<f64>>,
    pub upper_bound: Option<Vec<f64>>,
}

impl PredictionOutput {
    /// Builds an output with a symmetric interval of `± half_width` when requested.
    #[must_use]
    pub fn with_interval(predictions: Vec<f64>, half_width: f64, return_confidence: bool) -> Self {
        if !return_confidence {
            return Self {
                predictions,
                lower_bound: None,
                upper_bound: None,
            };
        }

        let lower = predictions.iter().map(|p| p - half_width).collect();
        let upper = predictions.iter().map(|p| p + half_width).collect();
        Self {
            predictions,
            lower_bound: Some(lower),
            upper_bound: Some(upper),
        }
    }

    /// Half-width of the interval at `index`, if an interval was returned.
    #[must_use]
    pub fn uncertainty(&self, index: usize) -> Option<f64> {
        let lower = self.lower_bound.as_ref()?.get(index)?;
        let upper = self.upper_bound.as_ref()?.get(index)?;
        Some((upper - lower) / 2.0)
    }
}

/// A pluggable PM2.5 forecaster.
pub trait Forecaster: Send + Sync {
    /// Which model this is.
    fn kind(&self) -> ModelKind;

    /// Whether the model has been fitted and may serve predictions.
    fn is_trained(&self) -> bool;

    /// Fits the model, replacing any previous fit.
    ///
    /// # Errors
    ///
    /// Returns [`ForecastError::NotEnoughData`] when `data` is below the
    /// model's minimum sample requirement.
    fn train(&mut self, data: &TrainingData) -> Result<TrainingMetrics, ForecastError> {
        self.train_cancellable(data, &CancelToken::new())
    }

    /// Fits the model, checking `cancel` between rounds or epochs.
    ///
    /// A cancelled run returns [`ForecastError::Cancelled`] and keeps the
    /// previous fit.
    ///
    /// # Errors
    ///
    /// Returns [`ForecastError::NotEnoughData`] when `data` is below the
    /// model's minimum sample requirement.
    fn train_cancellable(
        &mut self,
        data: &TrainingData,
        cancel: &CancelToken,
    ) -> Result<TrainingMetrics, ForecastError>;

    /// Serializes the fitted parameters.
    ///
    /// # Errors
    ///
    /// Returns [`ForecastError::NotTrained`] before the first successful `train`.
    fn save(&self) -> Result<Vec<u8>, ForecastError>;

    /// Replaces the current fit with parameters written by [`save`](Self::save).
    ///
    /// # Errors
    ///
    /// Returns [`ForecastError::State`] if `bytes` do not decode.
    fn restore(&mut self, bytes: &[u8]) -> Result<(), ForecastError>;

    /// Single-step inference for each row.
    ///
    /// With `return_confidence`, the output carries a symmetric interval
    /// derived from the model's own uncertainty estimate.
    ///
    /// # Errors
    ///
    /// Returns [`ForecastError::NotTrained`] before the first successful `train`.
    fn predict(
        &self,
        rows: &[FeatureRow],
        return_confidence: bool,
    ) -> Result<PredictionOutput, ForecastError>;

    /// Scores the model against observed values.
    ///
    /// # Errors
    ///
    /// Returns an error if `data` is empty or prediction fails.
    fn evaluate(&self, data: &TrainingData) -> Result<EvaluationMetrics, ForecastError> {
        data.require(1)?;
        let output = self.predict(&data.rows(), false)?;
        Ok(EvaluationMetrics::compute(&output.predictions, &data.targets()))
    }
}

/// Creates an untrained forecaster of the given kind with default settings.
#[must_use]
pub fn create_forecaster(kind: ModelKind) -> Box<dyn Forecaster> {
    match kind {
        ModelKind::GradientBoost => {
            Box::new(GradientBoostForecaster::new(GradientBoostConfig::default()))
        }
        ModelKind::Recurrent => Box::new(RecurrentForecaster::new(TrainingConfig::default())),
        ModelKind::GraphSpatial => {
            Box::new(GraphSpatialForecaster::new(GraphSpatialConfig::default()))
        }
    }
}

/// Residual spread on held-out samples as a half-width, floored at [`MIN_UNCERTAINTY`].
pub(crate) fn uncertainty_from(predictions: &[f64], actuals: &[f64]) -> f64 {
    metrics::residual_std(predictions, actuals).max(MIN_UNCERTAINTY)
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_training_data() {
        let mut data = TrainingData::new();
        assert!(data.is_empty());
        assert_eq!(data.len(), 0);

        data.add_samples(vec![]);
        assert!(data.is_empty());
        assert!(matches!(
            data.require(3),
            Err(ForecastError::NotEnoughData {
                required: 3,
                actual: 0
            })
        ));
    }

    #[test]
    fn test_split_latest_holds_out_newest_samples() {
        let data = test_support::synthetic_data(30);
        let (earlier, latest) = data.split_latest(CALIBRATION_FRACTION);

        assert_eq!(earlier.len() + latest.len(), data.len());
        assert_eq!(latest.len(), (data.len() as f64 * 0.2).ceil() as usize);

        let last_earlier = earlier.samples.iter().map(|s| s.row.timestamp).max().expect("earlier");
        let first_latest = latest.samples.iter().map(|s| s.row.timestamp).min().expect("latest");
        assert!(last_earlier <= first_latest);

        let pair = TrainingData::from_samples(data.samples[..2].to_vec());
        let (rest, single) = pair.split_latest(0.01);
        assert_eq!((rest.len(), single.len()), (1, 1));
        let (rest, none) = TrainingData::new().split_latest(0.5);
        assert!(rest.is_empty() && none.is_empty());
    }

    #[test]
    fn test_prediction_interval_is_symmetric() {
        let output = PredictionOutput::with_interval(vec![40.0, 50.0], 5.0, true);
        assert_eq!(output.lower_bound, Some(vec![35.0, 45.0]));
        assert_eq!(output.upper_bound, Some(vec![45.0, 55.0]));
        assert_eq!(output.uncertainty(1), Some(5.0));

        let bare = PredictionOutput::with_interval(vec![40.0], 5.0, false);
        assert!(bare.lower_bound.is_none());
        assert!(bare.uncertainty(0).is_none());
    }

    #[test]
    fn test_factory_creates_untrained_models() {
        for kind in ModelKind::all() {
            let model = create_forecaster(kind);
            assert_eq!(model.kind(), kind);
            assert!(!model.is_trained());
        }
    }

    #[test]
    fn test_untrained_predict_fails() {
        let data = test_support::synthetic_data(4);
        for kind in ModelKind::all() {
            let model = create_forecaster(kind);
            let result = model.predict(&data.rows(), true);
            assert!(matches!(result, Err(ForecastError::NotTrained(k)) if k == kind));
        }
    }
}
