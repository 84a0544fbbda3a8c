use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{ModelKind, RetrainingTrigger};

/// Metrics computed on the held-out validation window.
///
/// `accuracy_within_20pct` is a percentage in `[0, 100]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ValidationMetrics {
    pub rmse: f64,
    pub mae: f64,
    pub accuracy_within_20pct: f64,
    pub sample_count: usize,
}

/// Whether a failed run is worth re-dispatching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FailureKind {
    /// Timeout or lost connection; retrying may succeed.
    Transient,
    /// Anything else; retrying will not help.
    Fatal,
}

/// Why a retraining run failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl RunFailure {
    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Transient,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Fatal,
            message: message.into(),
        }
    }
}

/// Historical record of one orchestration run. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrainingResult {
    pub id: Uuid,
    pub trigger: RetrainingTrigger,
    pub models_retrained: Vec<ModelKind>,
    pub duration_seconds: f64,
    pub validation_results: BTreeMap<ModelKind, ValidationMetrics>,
    pub promotion_results: BTreeMap<ModelKind, bool>,
    /// True iff at least one target model was promoted.
    pub success: bool,
    pub error: Option<RunFailure>,
    pub completed_at: DateTime<Utc>,
}

impl RetrainingResult {
    /// Whether this run failed in a way that may succeed on retry.
    #[must_use]
    pub fn is_transient_failure(&self) -> bool {
        !self.success
            && self
                .error
                .as_ref()
                .is_some_and(|failure| failure.kind == FailureKind::Transient)
    }

    /// Models that were promoted during this run.
    pub fn promoted_models(&self) -> impl Iterator<Item = ModelKind> + '_ {
        self.promotion_results
            .iter()
            .filter(|(_, promoted)| **promoted)
            .map(|(kind, _)| *kind)
    }
}
