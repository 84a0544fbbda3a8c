//! Where training data and drift samples come from.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use database::{ObservationRepository, StoreError};
use forecast_structs::{Observation, Pollutant};
use sqlx::SqlitePool;

/// Read access to historical station observations.
#[async_trait]
pub trait TrainingDataSource: Send + Sync {
    /// Observations in `[start, end)`.
    async fn observations(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Observation>, StoreError>;

    /// Values of one pollutant in `[start, end)`, skipping missing readings.
    async fn pollutant_values(
        &self,
        pollutant: Pollutant,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<f64>, StoreError>;
}

/// Observations stored in the local database.
#[derive(Debug, Clone)]
pub struct SqlDataSource {
    pool: SqlitePool,
}

impl SqlDataSource {
    #[must_use]
    pub const fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TrainingDataSource for SqlDataSource {
    async fn observations(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Observation>, StoreError> {
        ObservationRepository::list_between(&self.pool, start, end).await
    }

    async fn pollutant_values(
        &self,
        pollutant: Pollutant,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<f64>, StoreError> {
        ObservationRepository::pollutant_values(&self.pool, pollutant, start, end).await
    }
}


#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::test_support::pool;

    #[tokio::test]
    async fn test_reads_stored_observations() {
        let pool = pool().await;
        let end = Utc::now();
        let observations = fixtures::hourly_observations(end, 1, 30.0);
        ObservationRepository::insert_many(&pool, &observations)
            .await
            .expect("insert");

        let source = SqlDataSource::new(pool);
        let listed = source
            .observations(end - Duration::days(2), end)
            .await
            .expect("observations");
        assert_eq!(listed.len(), observations.len());

        let ozone = source
            .pollutant_values(Pollutant::O3, end - Duration::days(2), end)
            .await
            .expect("values");
        assert!(ozone.is_empty());
    }
}
