use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ModelKind;

/// Retraining cadence of one model type.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScheduleEntry {
    /// Days between scheduled retrains.
    pub days: f64,
    /// Last performance score in `[0, 1]`, kept for reporting.
    pub performance_weight: f64,
    pub last_updated: DateTime<Utc>,
}

/// Per-model retraining cadence, persisted as key-value JSON.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScheduleConfig(BTreeMap<ModelKind, ScheduleEntry>);

impl ScheduleConfig {
    /// Default cadence for every model kind.
    #[must_use]
    pub fn defaults(now: DateTime<Utc>) -> Self {
        Self(
            ModelKind::all()
                .map(|kind| {
                    (
                        kind,
                        ScheduleEntry {
                            days: kind.default_retrain_days(),
                            performance_weight: 1.0,
                            last_updated: now,
                        },
                    )
                })
                .collect(),
        )
    }

    #[must_use]
    pub fn get(&self, kind: ModelKind) -> Option<&ScheduleEntry> {
        self.0.get(&kind)
    }

    /// Interval for a model, falling back to its default.
    #[must_use]
    pub fn days_for(&self, kind: ModelKind) -> f64 {
        self.0
            .get(&kind)
            .map_or_else(|| kind.default_retrain_days(), |entry| entry.days)
    }

    pub fn set(&mut self, kind: ModelKind, entry: ScheduleEntry) {
        self.0.insert(kind, entry);
    }

    pub fn iter(&self) -> impl Iterator<Item = (ModelKind, &ScheduleEntry)> {
        self.0.iter().map(|(kind, entry)| (*kind, entry))
    }
}
