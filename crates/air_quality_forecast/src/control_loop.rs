//! Periodic trigger evaluation feeding the retraining queue.

use std::sync::Arc;
use std::time::Duration;

use database::TriggerLogRepository;
use sqlx::SqlitePool;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::live::LiveEvaluator;
use crate::monitor::PerformanceMonitor;
use crate::queue::RetrainingQueue;
use crate::triggers::TriggerEvaluator;

/// What one evaluation pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub scored: usize,
    pub raised: usize,
    pub dispatched: usize,
}

/// Evaluates triggers on a fixed cadence and dispatches the actionable ones.
pub struct ControlLoop {
    interval: Duration,
    pool: SqlitePool,
    live: LiveEvaluator,
    evaluator: TriggerEvaluator,
    queue: Arc<RetrainingQueue>,
    monitor: Arc<PerformanceMonitor>,
}

impl ControlLoop {
    #[must_use]
    pub fn new(
        interval: Duration,
        pool: SqlitePool,
        live: LiveEvaluator,
        evaluator: TriggerEvaluator,
        queue: Arc<RetrainingQueue>,
        monitor: Arc<PerformanceMonitor>,
    ) -> Self {
        Self {
            interval,
            pool,
            live,
            evaluator,
            queue,
            monitor,
        }
    }

    /// One pass: score the serving models on recent data, evaluate, log every
    /// trigger, dispatch High and Critical ones, then drop expired metric samples.
    pub async fn tick(&self) -> TickSummary {
        let scored = self.live.evaluate().await;
        let triggers = self.evaluator.evaluate().await;
        let mut summary = TickSummary {
            scored: scored.len(),
            raised: triggers.len(),
            dispatched: 0,
        };

        for trigger in &triggers {
            let mut dispatched = false;
            if trigger.severity.is_actionable() {
                match self.queue.submit(trigger).await {
                    Ok(()) => {
                        dispatched = true;
                        summary.dispatched += 1;
                    }
                    Err(error) => {
                        warn!(%error, trigger = %trigger.id, "Could not dispatch trigger");
                    }
                }
            } else {
                debug!(
                    trigger = %trigger.id,
                    severity = %trigger.severity,
                    "Trigger recorded without dispatch"
                );
            }

            let logged = TriggerLogRepository::insert(&self.pool, trigger, dispatched).await;
            if let Err(error) = logged {
                warn!(%error, trigger = %trigger.id, "Could not record trigger");
            }
        }

        let purged = self.monitor.purge_expired().await;
        if purged > 0 {
            debug!(purged, "Expired metric samples removed");
        }

        info!(
            scored = summary.scored,
            raised = summary.raised,
            dispatched = summary.dispatched,
            active = self.queue.active_tasks(),
            "Evaluation pass complete"
        );
        summary
    }

    /// Ticks until `shutdown` turns true or its sender is dropped.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(interval = ?self.interval, "Control loop started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Control loop stopped");
    }
}
