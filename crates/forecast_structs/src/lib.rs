//! Common records shared across the forecasting crates.
//!
//! Every type that crosses a crate, process, or queue boundary lives here and
//! is serde-serializable to plain JSON.

mod aqi;
mod ensemble;
mod metrics;
mod model;
mod observation;
mod result;
mod schedule;
mod trigger;

pub use aqi::*;
pub use ensemble::*;
pub use metrics::*;
pub use model::*;
pub use observation::*;
pub use result::*;
pub use schedule::*;
pub use trigger::*;
