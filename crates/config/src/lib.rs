//! Configuration for the forecasting service.
//!
//! [`Config`] is read once from the environment at process start and handed to
//! each component; the tuning structs carry the thresholds the control loop uses.

mod config;
mod tuning;

pub use config::*;
pub use tuning::*;
