//! Hourly station readings used for training and drift detection.

use chrono::{DateTime, Utc};
use forecast_structs::{Observation, Pollutant};
use sqlx::SqlitePool;

use crate::{StoreError, from_millis, to_millis};

#[derive(sqlx::FromRow)]
struct ObservationRow {
    station_id: String,
    observed_at: i64,
    pm25: f64,
    pm10: Option<f64>,
    no2: Option<f64>,
    o3: Option<f64>,
    temperature: f64,
    humidity: f64,
    wind_speed: f64,
    pressure: f64,
}

impl TryFrom<ObservationRow> for Observation {
    type Error = StoreError;

    fn try_from(row: ObservationRow) -> Result<Self, Self::Error> {
        Ok(Self {
            station_id: row.station_id,
            timestamp: from_millis(row.observed_at)?,
            pm25: row.pm25,
            pm10: row.pm10,
            no2: row.no2,
            o3: row.o3,
            temperature: row.temperature,
            humidity: row.humidity,
            wind_speed: row.wind_speed,
            pressure: row.pressure,
        })
    }
}

/// Repository for station observations.
pub struct ObservationRepository;

impl ObservationRepository {
    /// Inserts observations, replacing any existing reading for the same station and hour.
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction fails.
    pub async fn insert_many(
        pool: &SqlitePool,
        observations: &[Observation],
    ) -> Result<u64, StoreError> {
        let mut tx = pool.begin().await?;
        let mut written = 0;

        for observation in observations {
            let result = sqlx::query(
                r"
                INSERT INTO observations
                    (station_id, observed_at, pm25, pm10, no2, o3,
                     temperature, humidity, wind_speed, pressure)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT (station_id, observed_at) DO UPDATE SET
                    pm25 = excluded.pm25,
                    pm10 = excluded.pm10,
                    no2 = excluded.no2,
                    o3 = excluded.o3,
                    temperature = excluded.temperature,
                    humidity = excluded.humidity,
                    wind_speed = excluded.wind_speed,
                    pressure = excluded.pressure
                ",
            )
            .bind(&observation.station_id)
            .bind(to_millis(observation.timestamp))
            .bind(observation.pm25)
            .bind(observation.pm10)
            .bind(observation.no2)
            .bind(observation.o3)
            .bind(observation.temperature)
            .bind(observation.humidity)
            .bind(observation.wind_speed)
            .bind(observation.pressure)
            .execute(&mut *tx)
            .await?;
            written += result.rows_affected();
        }

        tx.commit().await?;
        Ok(written)
    }

    /// Lists observations in `[start, end)`, ordered by station then time.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn list_between(
        pool: &SqlitePool,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Observation>, StoreError> {
        let rows: Vec<ObservationRow> = sqlx::query_as(
            r"
            SELECT station_id, observed_at, pm25, pm10, no2, o3,
                   temperature, humidity, wind_speed, pressure
            FROM observations
            WHERE observed_at >= ? AND observed_at < ?
            ORDER BY station_id, observed_at
            ",
        )
        .bind(to_millis(start))
        .bind(to_millis(end))
        .fetch_all(pool)
        .await?;

        rows.into_iter().map(Observation::try_from).collect()
    }

    /// Returns the non-null values of one pollutant in `[start, end)`.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn pollutant_values(
        pool: &SqlitePool,
        pollutant: Pollutant,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<f64>, StoreError> {
        // Column names come from a closed enum, never from user input.
        let column = pollutant.column();
        let sql = format!(
            "SELECT {column} FROM observations \
             WHERE observed_at >= ? AND observed_at < ? AND {column} IS NOT NULL \
             ORDER BY observed_at"
        );

        let values: Vec<(f64,)> = sqlx::query_as(&sql)
            .bind(to_millis(start))
            .bind(to_millis(end))
            .fetch_all(pool)
            .await?;

        Ok(values.into_iter().map(|(value,)| value).collect())
    }

    /// Returns the number of stored observations.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn count(pool: &SqlitePool) -> Result<i64, StoreError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM observations")
            .fetch_one(pool)
            .await?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone};

    use super::*;
    use crate::test_pool;

    fn observation(station: &str, hour: i64, pm25: f64, no2: Option<f64>) -> Observation {
        let base = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).single().expect("valid date");
        Observation {
            station_id: station.to_string(),
            timestamp: base + Duration::hours(hour),
            pm25,
            pm10: None,
            no2,
            o3: None,
            temperature: 12.0,
            humidity: 60.0,
            wind_speed: 3.0,
            pressure: 1013.0,
        }
    }

    #[tokio::test]
    async fn test_insert_many_upserts() {
        let pool = test_pool().await;

        ObservationRepository::insert_many(&pool, &[observation("a", 0, 10.0, None)])
            .await
            .expect("insert");
        ObservationRepository::insert_many(&pool, &[observation("a", 0, 14.0, Some(20.0))])
            .await
            .expect("upsert");

        assert_eq!(ObservationRepository::count(&pool).await.expect("count"), 1);

        let start = observation("a", 0, 0.0, None).timestamp;
        let listed = ObservationRepository::list_between(&pool, start, start + Duration::hours(1))
            .await
            .expect("list");
        assert_eq!(listed, vec![observation("a", 0, 14.0, Some(20.0))]);
    }

    #[tokio::test]
    async fn test_list_between_is_half_open() {
        let pool = test_pool().await;
        let rows: Vec<_> = (0..5).map(|h| observation("a", h, h as f64, None)).collect();
        ObservationRepository::insert_many(&pool, &rows).await.expect("insert");

        let listed =
            ObservationRepository::list_between(&pool, rows[1].timestamp, rows[3].timestamp)
                .await
                .expect("list");
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].timestamp, rows[1].timestamp);
    }

    #[tokio::test]
    async fn test_pollutant_values_skip_missing() {
        let pool = test_pool().await;
        let rows = vec![
            observation("a", 0, 10.0, Some(30.0)),
            observation("a", 1, 11.0, None),
            observation("b", 2, 12.0, Some(32.0)),
        ];
        ObservationRepository::insert_many(&pool, &rows).await.expect("insert");

        let start = rows[0].timestamp;
        let end = start + Duration::hours(24);

        let no2 = ObservationRepository::pollutant_values(&pool, Pollutant::No2, start, end)
            .await
            .expect("no2");
        assert_eq!(no2, vec![30.0, 32.0]);

        let pm25 = ObservationRepository::pollutant_values(&pool, Pollutant::Pm25, start, end)
            .await
            .expect("pm25");
        assert_eq!(pm25.len(), 3);
    }
}
