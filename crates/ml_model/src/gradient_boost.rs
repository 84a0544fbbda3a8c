//! Gradient-boosted decision stumps over the flat feature vector.
//!
//! The interval half-width is the residual spread of a boosting run on the
//! earlier samples, measured on the latest [`CALIBRATION_FRACTION`] of them.

use feature_extractor::{FEATURE_COUNT, FeatureRow};
use forecast_structs::ModelKind;
use serde::{Deserialize, Serialize};

use crate::{
    CALIBRATION_FRACTION, CancelToken, ForecastError, Forecaster, PredictionOutput, TrainingData,
    TrainingMetrics, metrics, uncertainty_from,
};

/// Boosting hyper-parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct GradientBoostConfig {
    pub rounds: usize,
    pub learning_rate: f64,
    /// Candidate split points tried per feature.
    pub split_candidates: usize,
    pub min_samples: usize,
}

impl Default for GradientBoostConfig {
    fn default() -> Self {
        Self {
            rounds: 60,
            learning_rate: 0.1,
            split_candidates: 16,
            min_samples: 30,
        }
    }
}

/// One depth-1 tree: `feature < threshold ? left : right`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
struct Stump {
    feature: usize,
    threshold: f32,
    left: f64,
    right: f64,
}

impl Stump {
    fn apply(&self, features: &[f32; FEATURE_COUNT]) -> f64 {
        if features[self.feature] < self.threshold {
            self.left
        } else {
            self.right
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Fitted {
    stumps: Vec<Stump>,
    learning_rate: f64,
    uncertainty: f64,
}

/// Boosts stumps on the residual from a persistence forecast (last hour's value).
#[derive(Debug, Clone)]
pub struct GradientBoostForecaster {
    config: GradientBoostConfig,
    fitted: Option<Fitted>,
}

impl GradientBoostForecaster {
    #[must_use]
    pub const fn new(config: GradientBoostConfig) -> Self {
        Self {
            config,
            fitted: None,
        }
    }

    fn score(stumps: &[Stump], learning_rate: f64, row: &FeatureRow) -> f64 {
        let features = row.to_array();
        let correction: f64 = stumps.iter().map(|stump| stump.apply(&features)).sum();
        learning_rate.mul_add(correction, row.lag1()).max(0.0)
    }

    /// Boosts up to `rounds` stumps on the residual from persistence.
    fn boost(
        &self,
        data: &TrainingData,
        cancel: &CancelToken,
    ) -> Result<Vec<Stump>, ForecastError> {
        let rows = data.rows();
        let features: Vec<[f32; FEATURE_COUNT]> = rows.iter().map(FeatureRow::to_array).collect();
        let mut residuals: Vec<f64> = rows
            .iter()
            .zip(data.targets())
            .map(|(row, target)| target - row.lag1())
            .collect();

        let mut stumps = Vec::with_capacity(self.config.rounds);
        for _ in 0..self.config.rounds {
            cancel.check()?;
            let Some(stump) = self.best_stump(&features, &residuals) else {
                break;
            };
            for (residual, row) in residuals.iter_mut().zip(&features) {
                *residual -= self.config.learning_rate * stump.apply(row);
            }
            stumps.push(stump);
        }
        Ok(stumps)
    }

    /// Finds the stump that most reduces squared error on `residuals`.
    fn best_stump(&self, features: &[[f32; FEATURE_COUNT]], residuals: &[f64]) -> Option<Stump> {
        let mut best: Option<(f64, Stump)> = None;
        let candidates = self.config.split_candidates;

        for feature in 0..FEATURE_COUNT {
            for threshold in candidate_thresholds(features, feature, candidates) {
                let (mut left_sum, mut left_n) = (0.0, 0usize);
                let (mut right_sum, mut right_n) = (0.0, 0usize);
                for (row, residual) in features.iter().zip(residuals) {
                    if row[feature] < threshold {
                        left_sum += residual;
                        left_n += 1;
                    } else {
                        right_sum += residual;
                        right_n += 1;
                    }
                }
                if left_n == 0 || right_n == 0 {
                    continue;
                }

                // Maximizing this gain is equivalent to minimizing the split SSE.
                let gain =
                    left_sum * left_sum / left_n as f64 + right_sum * right_sum / right_n as f64;
                if best.is_none_or(|(best_gain, _)| gain > best_gain) {
                    best = Some((
                        gain,
                        Stump {
                            feature,
                            threshold,
                            left: left_sum / left_n as f64,
                            right: right_sum / right_n as f64,
                        },
                    ));
                }
            }
        }

        best.map(|(_, stump)| stump)
    }
}

fn candidate_thresholds(
    features: &[[f32; FEATURE_COUNT]],
    feature: usize,
    count: usize,
) -> Vec<f32> {
    let mut values: Vec<f32> = features.iter().map(|row| row[feature]).collect();
    values.sort_by(f32::total_cmp);
    values.dedup();
    if values.len() < 2 {
        return Vec::new();
    }

    let step = (values.len() / (count + 1)).max(1);
    values.iter().skip(step).step_by(step).copied().take(count).collect()
}

impl Forecaster for GradientBoostForecaster {
    fn kind(&self) -> ModelKind {
        ModelKind::GradientBoost
    }

    fn is_trained(&self) -> bool {
        self.fitted.is_some()
    }

    fn train_cancellable(
        &mut self,
        data: &TrainingData,
        cancel: &CancelToken,
    ) -> Result<TrainingMetrics, ForecastError> {
        data.require(self.config.min_samples)?;
        let learning_rate = self.config.learning_rate;

        let (earlier, latest) = data.split_latest(CALIBRATION_FRACTION);
        let calibration = self.boost(&earlier, cancel)?;
        let held_out: Vec<f64> = latest
            .rows()
            .iter()
            .map(|row| Self::score(&calibration, learning_rate, row))
            .collect();
        let uncertainty = uncertainty_from(&held_out, &latest.targets());

        let stumps = self.boost(data, cancel)?;
        let rows = data.rows();
        let targets = data.targets();
        let predictions: Vec<f64> = rows
            .iter()
            .map(|row| Self::score(&stumps, learning_rate, row))
            .collect();

        tracing::debug!(
            stumps = stumps.len(),
            samples = rows.len(),
            uncertainty,
            "Boosting finished"
        );

        self.fitted = Some(Fitted {
            stumps,
            learning_rate,
            uncertainty,
        });

        Ok(TrainingMetrics {
            rmse: metrics::rmse(&predictions, &targets),
            mae: metrics::mae(&predictions, &targets),
            sample_count: data.len(),
        })
    }

    fn predict(
        &self,
        rows: &[FeatureRow],
        return_confidence: bool,
    ) -> Result<PredictionOutput, ForecastError> {
        let fitted = self
            .fitted
            .as_ref()
            .ok_or(ForecastError::NotTrained(self.kind()))?;

        let predictions = rows
            .iter()
            .map(|row| Self::score(&fitted.stumps, fitted.learning_rate, row))
            .collect();

        Ok(PredictionOutput::with_interval(
            predictions,
            fitted.uncertainty,
            return_confidence,
        ))
    }

    fn save(&self) -> Result<Vec<u8>, ForecastError> {
        let fitted = self
            .fitted
            .as_ref()
            .ok_or(ForecastError::NotTrained(self.kind()))?;
        Ok(serde_json::to_vec(fitted)?)
    }

    fn restore(&mut self, bytes: &[u8]) -> Result<(), ForecastError> {
        self.fitted = Some(serde_json::from_slice(bytes)?);
        Ok(())
    }
}
