use forecast_structs::ModelKind;
use thiserror::Error;

/// Errors raised by forecasters.
#[derive(Debug, Error)]
pub enum ForecastError {
    #[error("not enough data: need at least {required} samples, got {actual}")]
    NotEnoughData { required: usize, actual: usize },

    #[error("{0} model is not trained")]
    NotTrained(ModelKind),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("training failed: {0}")]
    Training(String),

    #[error("training cancelled")]
    Cancelled,

    #[error("invalid saved model state: {0}")]
    State(String),
}

impl From<serde_json::Error> for ForecastError {
    fn from(error: serde_json::Error) -> Self {
        Self::State(error.to_string())
    }
}
