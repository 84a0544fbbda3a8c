//! Error and accuracy metrics shared by every forecaster.

/// Metrics reported after fitting a model on its training data.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrainingMetrics {
    pub rmse: f64,
    pub mae: f64,
    pub sample_count: usize,
}

/// Metrics of a model on held-out data.
///
/// Accuracy values are percentages in `[0, 100]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EvaluationMetrics {
    pub rmse: f64,
    pub mae: f64,
    pub accuracy_within_10pct: f64,
    pub accuracy_within_20pct: f64,
    pub sample_count: usize,
}

impl EvaluationMetrics {
    /// Computes every metric for paired predictions and observations.
    #[must_use]
    pub fn compute(predictions: &[f64], actuals: &[f64]) -> Self {
        Self {
            rmse: rmse(predictions, actuals),
            mae: mae(predictions, actuals),
            accuracy_within_10pct: accuracy_within_pct(predictions, actuals, 10.0),
            accuracy_within_20pct: accuracy_within_pct(predictions, actuals, 20.0),
            sample_count: predictions.len().min(actuals.len()),
        }
    }
}

/// Root mean squared error. Zero for empty input.
#[must_use]
pub fn rmse(predictions: &[f64], actuals: &[f64]) -> f64 {
    let n = predictions.len().min(actuals.len());
    if n == 0 {
        return 0.0;
    }
    let squared: f64 = predictions
        .iter()
        .zip(actuals)
        .map(|(p, a)| (p - a).powi(2))
        .sum();
    (squared / n as f64).sqrt()
}

/// Mean absolute error. Zero for empty input.
#[must_use]
pub fn mae(predictions: &[f64], actuals: &[f64]) -> f64 {
    let n = predictions.len().min(actuals.len());
    if n == 0 {
        return 0.0;
    }
    let absolute: f64 = predictions.iter().zip(actuals).map(|(p, a)| (p - a).abs()).sum();
    absolute / n as f64
}

/// Percentage of predictions within `pct` percent of the observed value.
#[must_use]
pub fn accuracy_within_pct(predictions: &[f64], actuals: &[f64], pct: f64) -> f64 {
    let n = predictions.len().min(actuals.len());
    if n == 0 {
        return 0.0;
    }
    let hits = predictions
        .iter()
        .zip(actuals)
        .filter(|(p, a)| (*p - *a).abs() <= a.abs() * pct / 100.0)
        .count();
    hits as f64 / n as f64 * 100.0
}

/// Population standard deviation of residuals, used as a model's own uncertainty.
#[must_use]
pub fn residual_std(predictions: &[f64], actuals: &[f64]) -> f64 {
    let residuals: Vec<f64> = predictions.iter().zip(actuals).map(|(p, a)| a - p).collect();
    if residuals.is_empty() {
        return 0.0;
    }
    let mean = residuals.iter().sum::<f64>() / residuals.len() as f64;
    let variance =
        residuals.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / residuals.len() as f64;
    variance.sqrt()
}
