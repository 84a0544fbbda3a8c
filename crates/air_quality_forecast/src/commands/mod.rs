//! CLI command implementations.

pub mod evaluate;
pub mod retrain;
pub mod run;
pub mod status;
