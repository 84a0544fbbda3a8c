use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{AqiCategory, ModelKind};

/// Blend weights keyed by model.
///
/// Weights are non-negative and, after [`EnsembleWeights::normalized`], sum to 1.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EnsembleWeights(BTreeMap<ModelKind, f64>);

impl EnsembleWeights {
    /// Equal weights over the given models.
    #[must_use]
    pub fn equal(models: impl IntoIterator<Item = ModelKind>) -> Self {
        let models: Vec<ModelKind> = models.into_iter().collect();
        if models.is_empty() {
            return Self::default();
        }
        let weight = 1.0 / models.len() as f64;
        Self(models.into_iter().map(|kind| (kind, weight)).collect())
    }

    /// Builds weights from raw values; negative or non-finite values become 0.
    #[must_use]
    pub fn from_raw(raw: impl IntoIterator<Item = (ModelKind, f64)>) -> Self {
        Self(
            raw.into_iter()
                .map(|(kind, weight)| (kind, sanitize(weight)))
                .collect(),
        )
    }

    /// Weight of a model, 0 when absent.
    #[must_use]
    pub fn get(&self, kind: ModelKind) -> f64 {
        self.0.get(&kind).copied().unwrap_or(0.0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (ModelKind, f64)> + '_ {
        self.0.iter().map(|(kind, weight)| (*kind, *weight))
    }

    pub fn models(&self) -> impl Iterator<Item = ModelKind> + '_ {
        self.0.keys().copied()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn sum(&self) -> f64 {
        self.0.values().sum()
    }

    /// Scales the weights to sum to 1. Falls back to equal weights when the
    /// total is zero or not finite.
    #[must_use]
    pub fn normalized(&self) -> Self {
        let total = self.sum();
        if !total.is_finite() || total <= 0.0 {
            return Self::equal(self.models());
        }
        Self(
            self.0
                .iter()
                .map(|(kind, weight)| (*kind, weight / total))
                .collect(),
        )
    }

    /// Restricts the weights to `models` and renormalizes over that subset.
    #[must_use]
    pub fn renormalized_over(&self, models: &[ModelKind]) -> Self {
        Self(models.iter().map(|kind| (*kind, self.get(*kind))).collect()).normalized()
    }

    /// Whether the weights are non-negative and sum to 1 within `tolerance`.
    #[must_use]
    pub fn is_normalized(&self, tolerance: f64) -> bool {
        self.0.values().all(|w| *w >= 0.0) && (self.sum() - 1.0).abs() <= tolerance
    }
}

fn sanitize(weight: f64) -> f64 {
    if weight.is_finite() && weight > 0.0 {
        weight
    } else {
        0.0
    }
}

/// Rolling summary of a model's recent accuracy.
///
/// Accuracy windows with no snapshots report the newest snapshot's accuracy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelPerformance {
    pub rmse: f64,
    pub mae: f64,
    /// Mean accuracy of snapshots recorded in the last hour.
    pub accuracy_1h: f64,
    /// Mean accuracy of snapshots recorded in the last 24 hours.
    pub accuracy_24h: f64,
    pub last_updated: DateTime<Utc>,
    pub sample_count: usize,
}

/// One accuracy measurement appended to a model's bounded history.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PerformanceSnapshot {
    pub rmse: f64,
    pub mae: f64,
    pub accuracy: f64,
    pub recorded_at: DateTime<Utc>,
}

/// What one model contributed to an ensemble prediction.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IndividualPrediction {
    pub value: f64,
    pub lower: f64,
    pub upper: f64,
    /// Half-width of the model's own interval.
    pub uncertainty: f64,
}

/// Why a model did or did not take part in a prediction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ModelParticipation {
    Responded,
    Untrained,
    Failed { reason: String },
}

/// A blended PM2.5 forecast for one timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnsemblePrediction {
    pub timestamp: DateTime<Utc>,
    pub pm25: f64,
    pub pm25_lower: f64,
    pub pm25_upper: f64,
    pub aqi: u32,
    pub category: AqiCategory,
    /// In `[0.1, 1.0]`.
    pub confidence: f64,
    /// Renormalized weights actually used for this prediction.
    pub model_weights: EnsembleWeights,
    pub individual_predictions: BTreeMap<ModelKind, IndividualPrediction>,
    pub participation: BTreeMap<ModelKind, ModelParticipation>,
    pub uncertainty: f64,
    /// Set when the value is a neutral placeholder rather than a model output.
    #[serde(default)]
    pub fallback: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_equal_weights_sum_to_one() {
        let weights = EnsembleWeights::equal(ModelKind::all());
        assert_eq!(weights.len(), 3);
        assert!(weights.is_normalized(1e-9));
    }

    #[test]
    fn test_renormalized_over_subset() {
        let weights = EnsembleWeights::from_raw([
            (ModelKind::GradientBoost, 0.5),
            (ModelKind::Recurrent, 0.3),
            (ModelKind::GraphSpatial, 0.2),
        ]);

        let subset = weights.renormalized_over(&[ModelKind::Recurrent, ModelKind::GraphSpatial]);
        assert_eq!(subset.len(), 2);
        assert!((subset.get(ModelKind::Recurrent) - 0.6).abs() < 1e-9);
        assert!((subset.get(ModelKind::GraphSpatial) - 0.4).abs() < 1e-9);
        assert!(subset.get(ModelKind::GradientBoost).abs() < f64::EPSILON);
    }

    #[test]
    fn test_zero_subset_falls_back_to_equal() {
        let weights = EnsembleWeights::from_raw([
            (ModelKind::GradientBoost, 1.0),
            (ModelKind::Recurrent, 0.0),
            (ModelKind::GraphSpatial, 0.0),
        ]);

        let subset = weights.renormalized_over(&[ModelKind::Recurrent, ModelKind::GraphSpatial]);
        assert!((subset.get(ModelKind::Recurrent) - 0.5).abs() < 1e-9);
        assert!(subset.is_normalized(1e-9));
    }

    #[test]
    fn test_from_raw_sanitizes() {
        let weights = EnsembleWeights::from_raw([
            (ModelKind::GradientBoost, -1.0),
            (ModelKind::Recurrent, f64::NAN),
            (ModelKind::GraphSpatial, 2.0),
        ]);
        let normalized = weights.normalized();
        assert!((normalized.get(ModelKind::GraphSpatial) - 1.0).abs() < 1e-9);
        assert!(normalized.is_normalized(1e-9));
    }

    #[test]
    fn test_weights_serialize_as_map() {
        let weights = EnsembleWeights::equal([ModelKind::GradientBoost, ModelKind::Recurrent]);
        let value = serde_json::to_value(&weights).expect("serialize");
        assert_eq!(value["gradient_boost"], 0.5);
        assert_eq!(value["recurrent"], 0.5);
    }
}
