use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ModelScope;

/// What kind of signal produced a retraining trigger.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TriggerType {
    /// Live accuracy or error degraded.
    Performance,
    /// Input distribution shifted.
    Drift,
    /// Model is older than its retraining interval.
    Schedule,
    /// Requested by an operator.
    Manual,
}

/// Urgency of a trigger. Ordered from least to most severe.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Whether a trigger of this severity should start a retraining run.
    ///
    /// `Low` and `Medium` triggers are only recorded for reporting.
    #[must_use]
    pub const fn is_actionable(self) -> bool {
        matches!(self, Self::High | Self::Critical)
    }
}

/// A structured signal indicating retraining may be warranted.
///
/// Immutable once created; crosses the task-queue boundary as JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrainingTrigger {
    pub id: Uuid,
    pub trigger_type: TriggerType,
    #[serde(rename = "model_name")]
    pub model: ModelScope,
    pub threshold_value: f64,
    pub current_value: f64,
    pub severity: Severity,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl RetrainingTrigger {
    /// Creates a trigger stamped with the current time.
    #[must_use]
    pub fn new(
        trigger_type: TriggerType,
        model: ModelScope,
        threshold_value: f64,
        current_value: f64,
        severity: Severity,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            trigger_type,
            model,
            threshold_value,
            current_value,
            severity,
            timestamp: Utc::now(),
            metadata: BTreeMap::new(),
        }
    }

    /// Creates an operator-requested trigger.
    #[must_use]
    pub fn manual(model: ModelScope, reason: &str) -> Self {
        Self::new(TriggerType::Manual, model, 0.0, 0.0, Severity::High)
            .with_metadata("reason", reason)
    }

    /// Attaches a metadata entry.
    #[must_use]
    pub fn with_metadata(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    /// Serializes the trigger for queuing.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Deserializes a queued trigger.
    pub fn from_json(payload: &str) -> serde_json::Result<Self> {
        serde_json::from_str(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ModelKind;

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Low < Severity::Medium);
        assert!(Severity::Medium < Severity::High);
        assert!(Severity::High < Severity::Critical);
    }

    #[test]
    fn test_only_high_and_critical_are_actionable() {
        assert!(!Severity::Low.is_actionable());
        assert!(!Severity::Medium.is_actionable());
        assert!(Severity::High.is_actionable());
        assert!(Severity::Critical.is_actionable());
    }

    #[test]
    fn test_trigger_json_shape() {
        let trigger = RetrainingTrigger::new(
            TriggerType::Performance,
            ModelScope::Model(ModelKind::GradientBoost),
            0.15,
            0.222,
            Severity::High,
        )
        .with_metadata("metric", "rmse");

        let value = serde_json::to_value(&trigger).expect("serialize");
        assert_eq!(value["trigger_type"], "performance");
        assert_eq!(value["model_name"], "gradient_boost");
        assert_eq!(value["severity"], "high");
        assert_eq!(value["metadata"]["metric"], "rmse");

        let json = trigger.to_json().expect("to_json");
        let decoded = RetrainingTrigger::from_json(&json).expect("from_json");
        assert_eq!(decoded, trigger);
    }

    #[test]
    fn test_manual_trigger_is_actionable() {
        let trigger = RetrainingTrigger::manual(ModelScope::Ensemble, "operator request");
        assert_eq!(trigger.trigger_type, TriggerType::Manual);
        assert!(trigger.severity.is_actionable());
        assert_eq!(trigger.metadata["reason"], "operator request");
    }
}
