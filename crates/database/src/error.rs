use thiserror::Error;

/// Errors returned by the repositories.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("failed to encode or decode stored payload: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid stored row: {0}")]
    InvalidRow(String),

    #[error("{0} not found")]
    NotFound(String),
}

impl StoreError {
    /// Whether the failure is a lost or exhausted connection rather than bad data.
    #[must_use]
    pub const fn is_connection(&self) -> bool {
        matches!(
            self,
            Self::Database(
                sqlx::Error::Io(_)
                    | sqlx::Error::PoolTimedOut
                    | sqlx::Error::PoolClosed
                    | sqlx::Error::WorkerCrashed
            )
        )
    }
}
