//! Air quality ensemble forecaster
//!
//! Blends several PM2.5 forecasters into one prediction and keeps them fresh
//! with a closed retraining loop: triggers are evaluated on a cadence, retrained
//! models are validated and promoted, and the results feed back into the blend
//! weights and the retraining schedule.

use chrono::{DateTime, Utc};

pub mod app;
pub mod artifacts;
pub mod control_loop;
pub mod data_source;
pub mod ensemble;
pub mod live;
pub mod monitor;
pub mod orchestrator;
pub mod persistence;
pub mod queue;
pub mod reporting;
pub mod scheduler;
pub mod tracker;
pub mod triggers;

/// Start of a window of length `window` ending at `now`.
///
/// Windows longer than the representable range start at the earliest instant.
pub(crate) fn window_start(now: DateTime<Utc>, window: std::time::Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(window)
        .ok()
        .and_then(|span| now.checked_sub_signed(span))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
