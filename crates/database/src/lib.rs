//! `SQLite` persistence layer.
//!
//! Repositories are stateless; every call takes the pool explicitly so callers
//! decide which database they talk to.

use core::str::FromStr;
use core::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};

mod error;
mod history;
mod metrics;
mod observations;
mod registry;

pub use error::StoreError;
pub use history::{LoggedTrigger, RetrainingResultRepository, TriggerLogRepository};
pub use metrics::MetricRepository;
pub use observations::ObservationRepository;
pub use registry::RegistryRepository;

/// Creates a connection pool to the `SQLite` database.
///
/// In-memory databases get a single long-lived connection so every query sees
/// the same data.
///
/// # Errors
///
/// Returns an error if the URL is invalid or the connection fails.
pub async fn create_pool(database_url: &str) -> Result<SqlitePool, sqlx::Error> {
    let in_memory = database_url.contains(":memory:");

    let mut options = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .busy_timeout(Duration::from_secs(5));
    if !in_memory {
        options = options.journal_mode(SqliteJournalMode::Wal);
    }

    let pool_options = if in_memory {
        SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
    } else {
        SqlitePoolOptions::new().max_connections(5)
    };

    pool_options.connect_with(options).await
}

/// Runs all pending migrations.
///
/// # Errors
///
/// Returns an error if running migrations fails.
pub async fn run_migrations(pool: &SqlitePool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}

pub(crate) fn to_millis(timestamp: DateTime<Utc>) -> i64 {
    timestamp.timestamp_millis()
}

pub(crate) fn from_millis(millis: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| StoreError::InvalidRow(format!("timestamp out of range: {millis}")))
}

#[cfg(test)]
pub(crate) async fn test_pool() -> SqlitePool {
    let pool = create_pool("sqlite::memory:")
        .await
        .expect("in-memory database should open");
    run_migrations(&pool).await.expect("migrations should run");
    pool
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_migrations_are_idempotent() {
        let pool = test_pool().await;
        run_migrations(&pool).await.expect("second run should be a no-op");
    }

    #[test]
    fn test_millis_round_trip() {
        let now = DateTime::from_timestamp_millis(Utc::now().timestamp_millis()).expect("valid");
        assert_eq!(from_millis(to_millis(now)).expect("valid"), now);
    }
}
