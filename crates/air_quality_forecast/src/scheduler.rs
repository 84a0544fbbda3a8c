//! Adaptive retraining cadence.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use config::SchedulerConfig;
use forecast_structs::{ModelKind, PerformanceSnapshot, ScheduleConfig, ScheduleEntry};
use object_store::ObjectStore;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::persistence::{PersistError, load_json, save_json};

/// Object store path of the persisted schedule.
pub const SCHEDULE_PATH: &str = "config/retraining_schedule.json";

/// Reads and writes the per-model schedule document.
#[derive(Clone)]
pub struct ScheduleStore {
    store: Arc<dyn ObjectStore>,
}

impl ScheduleStore {
    #[must_use]
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    /// The persisted schedule, with defaults for missing models.
    ///
    /// A missing or corrupt document yields the defaults.
    pub async fn load(&self) -> ScheduleConfig {
        let mut schedule = ScheduleConfig::defaults(Utc::now());
        match load_json::<ScheduleConfig>(self.store.as_ref(), SCHEDULE_PATH).await {
            Ok(Some(stored)) => {
                for (kind, entry) in stored.iter() {
                    schedule.set(kind, *entry);
                }
            }
            Ok(None) => {}
            Err(error) => warn!(%error, "Retraining schedule unreadable, using defaults"),
        }
        schedule
    }

    /// # Errors
    ///
    /// Returns an error if the document cannot be written.
    pub async fn save(&self, schedule: &ScheduleConfig) -> Result<(), PersistError> {
        save_json(self.store.as_ref(), SCHEDULE_PATH, schedule).await
    }
}

/// Performance score in `[0, 1]`: the mean of an RMSE term and an accuracy term.
#[must_use]
pub fn performance_score(rmse: f64, accuracy: f64, config: &SchedulerConfig) -> f64 {
    let rmse_term = if rmse.is_finite() && config.rmse_span > 0.0 {
        (1.0 - (rmse - config.rmse_reference) / config.rmse_span).clamp(0.0, 1.0)
    } else {
        0.0
    };
    let accuracy_term = if accuracy.is_finite() {
        (accuracy / 100.0).clamp(0.0, 1.0)
    } else {
        0.0
    };
    f64::midpoint(rmse_term, accuracy_term)
}

/// New retraining interval for a model scoring `score`.
#[must_use]
pub fn adjust_interval(days: f64, score: f64, config: &SchedulerConfig) -> f64 {
    if score < config.low_score {
        (days * (1.0 - config.adjust_factor)).max(config.min_days)
    } else if score > config.high_score {
        (days * (1.0 + config.adjust_factor)).min(config.max_days)
    } else {
        days
    }
}

/// Shrinks the interval of poorly performing models and stretches it for
/// strong ones.
pub struct AdaptiveScheduler {
    config: SchedulerConfig,
    store: ScheduleStore,
    update_lock: Mutex<()>,
}

impl AdaptiveScheduler {
    #[must_use]
    pub fn new(config: SchedulerConfig, store: ScheduleStore) -> Self {
        Self {
            config,
            store,
            update_lock: Mutex::new(()),
        }
    }

    pub async fn current(&self) -> ScheduleConfig {
        self.store.load().await
    }

    /// Applies the latest performance of each reported model and persists the
    /// schedule. Unreported models keep their interval.
    pub async fn update(
        &self,
        performance: &BTreeMap<ModelKind, PerformanceSnapshot>,
    ) -> ScheduleConfig {
        let _guard = self.update_lock.lock().await;
        let mut schedule = self.store.load().await;

        for (kind, snapshot) in performance {
            let score = performance_score(snapshot.rmse, snapshot.accuracy, &self.config);
            let previous = schedule.days_for(*kind);
            let days = adjust_interval(previous, score, &self.config);

            if (days - previous).abs() > f64::EPSILON {
                info!(model = %kind, previous, days, score, "Retraining interval adjusted");
            }
            schedule.set(
                *kind,
                ScheduleEntry {
                    days,
                    performance_weight: score,
                    last_updated: Utc::now(),
                },
            );
        }

        if let Err(error) = self.store.save(&schedule).await {
            warn!(%error, "Failed to persist retraining schedule");
        }
        schedule
    }
}

#[cfg(test)]
mod tests {
    use object_store::ObjectStoreExt;
    use object_store::path::Path as ObjectStorePath;

    use super::*;
    use crate::test_support::store;

    fn snapshot(rmse: f64, accuracy: f64) -> PerformanceSnapshot {
        PerformanceSnapshot {
            rmse,
            mae: rmse * 0.8,
            accuracy,
            recorded_at: Utc::now(),
        }
    }

    #[test]
    fn test_performance_score() {
        let config = SchedulerConfig::default();
        assert!((performance_score(15.0, 100.0, &config) - 1.0).abs() < 1e-9);
        assert!((performance_score(25.0, 80.0, &config) - 0.65).abs() < 1e-9);
        assert!((performance_score(60.0, 40.0, &config) - 0.2).abs() < 1e-9);
        assert!(performance_score(f64::NAN, 100.0, &config) <= 0.5);
    }

    #[test]
    fn test_adjust_interval_bounds() {
        let config = SchedulerConfig::default();
        assert!((adjust_interval(10.0, 0.5, &config) - 7.0).abs() < 1e-9);
        assert!((adjust_interval(4.0, 0.5, &config) - 3.0).abs() < 1e-9);
        assert!((adjust_interval(10.0, 0.95, &config) - 13.0).abs() < 1e-9);
        assert!((adjust_interval(25.0, 0.95, &config) - 30.0).abs() < 1e-9);
        assert!((adjust_interval(10.0, 0.8, &config) - 10.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_schedule_round_trip() {
        let schedules = ScheduleStore::new(store());
        let mut schedule = ScheduleConfig::defaults(Utc::now());
        schedule.set(
            ModelKind::Recurrent,
            ScheduleEntry {
                days: 9.8,
                performance_weight: 0.62,
                last_updated: Utc::now(),
            },
        );

        schedules.save(&schedule).await.expect("save");
        assert_eq!(schedules.load().await, schedule);
    }

    #[tokio::test]
    async fn test_corrupt_schedule_falls_back_to_defaults() {
        let shared = store();
        shared
            .put(&ObjectStorePath::from(SCHEDULE_PATH), bytes::Bytes::from_static(b"[1, 2").into())
            .await
            .expect("put");

        let schedule = ScheduleStore::new(shared).load().await;
        for kind in ModelKind::all() {
            assert!((schedule.days_for(kind) - kind.default_retrain_days()).abs() < f64::EPSILON);
        }
    }

    #[tokio::test]
    async fn test_update_persists_adjusted_interval() {
        let schedules = ScheduleStore::new(store());
        let scheduler = AdaptiveScheduler::new(SchedulerConfig::default(), schedules.clone());

        let report = BTreeMap::from([
            (ModelKind::GradientBoost, snapshot(40.0, 50.0)),
            (ModelKind::GraphSpatial, snapshot(12.0, 95.0)),
        ]);
        scheduler.update(&report).await;

        let stored = schedules.load().await;
        assert!((stored.days_for(ModelKind::GradientBoost) - 4.9).abs() < 1e-9);
        assert!((stored.days_for(ModelKind::GraphSpatial) - 27.3).abs() < 1e-9);
        assert!((stored.days_for(ModelKind::Recurrent) - 14.0).abs() < f64::EPSILON);
        let weight = stored.get(ModelKind::GradientBoost).expect("entry").performance_weight;
        assert!((weight - 0.25).abs() < 1e-9);
    }
}
