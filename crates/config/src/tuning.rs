//! Thresholds and tuning constants, each with production defaults.

use core::time::Duration;

use serde::{Deserialize, Serialize};

/// Coverage of the ensemble's prediction interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConfidenceLevel {
    #[default]
    P80,
    P90,
    P95,
    P99,
}

impl ConfidenceLevel {
    /// Two-sided standard normal quantile for this level.
    #[must_use]
    pub const fn z_score(self) -> f64 {
        match self {
            Self::P80 => 1.2816,
            Self::P90 => 1.6449,
            Self::P95 => 1.96,
            Self::P99 => 2.5758,
        }
    }
}

/// Ensemble combiner settings.
#[derive(Debug, Clone, PartialEq)]
pub struct EnsembleConfig {
    /// Fewer responding models than this fails the prediction.
    pub min_models: usize,
    pub confidence_level: ConfidenceLevel,
    /// Uncertainty (µg/m³) at which confidence bottoms out.
    pub max_uncertainty: f64,
    /// Used when a model returns no interval.
    pub default_model_uncertainty: f64,
    /// Neutral PM2.5 value substituted for a failed forecast step.
    pub fallback_pm25: f64,
    /// Confidence attached to a fallback step.
    pub fallback_confidence: f64,
    /// Performance snapshots kept per model.
    pub history_capacity: usize,
    /// Floor on RMSE when scoring models for weights.
    pub rmse_floor: f64,
    /// Factor applied to the weight of a model missing from a performance report.
    pub missing_weight_decay: f64,
}

impl Default for EnsembleConfig {
    fn default() -> Self {
        Self {
            min_models: 1,
            confidence_level: ConfidenceLevel::P80,
            max_uncertainty: 50.0,
            default_model_uncertainty: 10.0,
            fallback_pm25: 25.0,
            fallback_confidence: 0.1,
            history_capacity: 100,
            rmse_floor: 1.0,
            missing_weight_decay: 0.5,
        }
    }
}

/// Cut-offs used by the trigger evaluator.
#[derive(Debug, Clone, PartialEq)]
pub struct TriggerThresholds {
    /// Samples a model needs before its trend is judged.
    pub min_performance_samples: usize,
    /// Newest samples averaged as "recent".
    pub recent_sample_count: usize,
    pub rmse_degradation: f64,
    pub rmse_degradation_critical: f64,
    pub accuracy_drop: f64,
    pub accuracy_drop_critical: f64,
    /// Window of performance samples considered.
    pub performance_window: Duration,

    /// Days in the recent drift window.
    pub drift_recent_days: i64,
    /// Days back to the start of the historical drift window.
    pub drift_history_days: i64,
    pub drift_min_samples: usize,
    pub mean_shift: f64,
    pub mean_shift_critical: f64,
    pub variance_ratio_low: f64,
    pub variance_ratio_high: f64,
    pub variance_ratio_severe_low: f64,
    pub variance_ratio_severe_high: f64,
}

impl Default for TriggerThresholds {
    fn default() -> Self {
        Self {
            min_performance_samples: 5,
            recent_sample_count: 3,
            rmse_degradation: 0.15,
            rmse_degradation_critical: 0.30,
            accuracy_drop: 0.10,
            accuracy_drop_critical: 0.20,
            performance_window: Duration::from_secs(7 * 24 * 3600),
            drift_recent_days: 7,
            drift_history_days: 30,
            drift_min_samples: 50,
            mean_shift: 0.25,
            mean_shift_critical: 0.50,
            variance_ratio_low: 0.5,
            variance_ratio_high: 2.0,
            variance_ratio_severe_low: 0.33,
            variance_ratio_severe_high: 3.0,
        }
    }
}

/// Promotion gate applied to freshly retrained models.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PromotionThresholds {
    /// Validation RMSE must not exceed this.
    pub max_rmse: f64,
    /// Accuracy-within-20% (percent) must reach this.
    pub min_accuracy: f64,
}

impl Default for PromotionThresholds {
    fn default() -> Self {
        Self {
            max_rmse: 25.0,
            min_accuracy: 70.0,
        }
    }
}

/// Exponential backoff for re-dispatching a failed task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    /// Delay before retry number `retry` (0-based): `base_delay × 2^retry`.
    #[must_use]
    pub fn countdown(&self, retry: u32) -> Duration {
        self.base_delay.saturating_mul(2u32.saturating_pow(retry))
    }
}

/// Retraining orchestrator settings.
#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorConfig {
    /// Hard limit on one training call.
    pub retrain_timeout: Duration,
    /// Hard limit on data loading, evaluation and tracker calls.
    pub call_timeout: Duration,
    /// Inline retries of a transient step failure.
    pub step_retries: usize,
    /// First inline backoff delay; doubles per attempt.
    pub step_backoff: Duration,
    /// Queue-level re-dispatch of runs that failed transiently.
    pub task_retry: RetryPolicy,
    /// Days of history used for training.
    pub training_window_days: i64,
    /// Most recent days held out for validation.
    pub validation_window_days: i64,
    pub promotion: PromotionThresholds,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            retrain_timeout: Duration::from_secs(3600),
            call_timeout: Duration::from_secs(60),
            step_retries: 1,
            step_backoff: Duration::from_secs(5),
            task_retry: RetryPolicy {
                max_retries: 3,
                base_delay: Duration::from_secs(60),
            },
            training_window_days: 90,
            validation_window_days: 3,
            promotion: PromotionThresholds::default(),
        }
    }
}

/// Adaptive scheduler settings.
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    /// RMSE at which the RMSE term starts dropping below 1.
    pub rmse_reference: f64,
    /// RMSE span over which the RMSE term falls to 0.
    pub rmse_span: f64,
    /// Below this score the interval shrinks.
    pub low_score: f64,
    /// Above this score the interval grows.
    pub high_score: f64,
    /// Fractional change applied per adjustment.
    pub adjust_factor: f64,
    pub min_days: f64,
    pub max_days: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            rmse_reference: 15.0,
            rmse_span: 20.0,
            low_score: 0.7,
            high_score: 0.9,
            adjust_factor: 0.3,
            min_days: 3.0,
            max_days: 30.0,
        }
    }
}

/// Performance monitor settings.
#[derive(Debug, Clone, PartialEq)]
pub struct MonitorConfig {
    /// Prefix isolating this deployment's samples.
    pub namespace: String,
    /// Retention of request and system samples.
    pub metrics_ttl: Duration,
    /// Retention of model performance samples.
    pub model_ttl: Duration,
    /// Recent observations each live evaluation scores the serving models on.
    pub live_window: Duration,
    /// Samples buffered for the background writer.
    pub channel_capacity: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            namespace: "aqi".to_string(),
            metrics_ttl: Duration::from_secs(24 * 3600),
            model_ttl: Duration::from_secs(30 * 24 * 3600),
            live_window: Duration::from_secs(24 * 3600),
            channel_capacity: 1024,
        }
    }
}

/// How system health is derived from run history.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusConfig {
    /// Most recent results considered.
    pub recent_results: usize,
    /// Success rate below which the system is degraded.
    pub min_success_rate: f64,
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            recent_results: 10,
            min_success_rate: 0.5,
        }
    }
}
