//! Append-only storage of monitor samples.

use chrono::{DateTime, Utc};
use forecast_structs::{MetricKind, MetricRecord};
use sqlx::SqlitePool;

use crate::{StoreError, to_millis};

#[derive(sqlx::FromRow)]
struct PayloadRow {
    payload: String,
}

/// Repository for metric samples.
pub struct MetricRepository;

impl MetricRepository {
    /// Appends one sample.
    ///
    /// # Errors
    ///
    /// Returns an error if the sample cannot be encoded or the insert fails.
    pub async fn insert(
        pool: &SqlitePool,
        namespace: &str,
        record: &MetricRecord,
    ) -> Result<(), StoreError> {
        Self::insert_batch(pool, namespace, core::slice::from_ref(record)).await
    }

    /// Appends several samples in one transaction.
    ///
    /// # Errors
    ///
    /// Returns an error if any sample cannot be encoded or the transaction fails.
    pub async fn insert_batch(
        pool: &SqlitePool,
        namespace: &str,
        records: &[MetricRecord],
    ) -> Result<(), StoreError> {
        if records.is_empty() {
            return Ok(());
        }

        let mut tx = pool.begin().await?;
        for record in records {
            let payload = serde_json::to_string(record)?;
            sqlx::query(
                r"
                INSERT INTO metric_samples (namespace, kind, model_name, recorded_at, payload)
                VALUES (?, ?, ?, ?, ?)
                ",
            )
            .bind(namespace)
            .bind(record.kind().as_str())
            .bind(record.model_name())
            .bind(to_millis(record.timestamp()))
            .bind(payload)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        Ok(())
    }

    /// Lists samples of one kind recorded at or after `since`, newest first.
    ///
    /// `model` restricts model samples to a single model name.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or a stored payload is corrupt.
    pub async fn list_since(
        pool: &SqlitePool,
        namespace: &str,
        kind: MetricKind,
        since: DateTime<Utc>,
        model: Option<&str>,
    ) -> Result<Vec<MetricRecord>, StoreError> {
        let rows: Vec<PayloadRow> = sqlx::query_as(
            r"
            SELECT payload
            FROM metric_samples
            WHERE namespace = ? AND kind = ? AND recorded_at >= ?
              AND (? IS NULL OR model_name = ?)
            ORDER BY recorded_at DESC, id DESC
            ",
        )
        .bind(namespace)
        .bind(kind.as_str())
        .bind(to_millis(since))
        .bind(model)
        .bind(model)
        .fetch_all(pool)
        .await?;

        rows.into_iter()
            .map(|row| serde_json::from_str(&row.payload).map_err(StoreError::from))
            .collect()
    }

    /// Deletes samples of one kind recorded before `cutoff`.
    ///
    /// Returns the number of deleted samples.
    ///
    /// # Errors
    ///
    /// Returns an error if the delete fails.
    pub async fn purge_before(
        pool: &SqlitePool,
        namespace: &str,
        kind: MetricKind,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "DELETE FROM metric_samples WHERE namespace = ? AND kind = ? AND recorded_at < ?",
        )
        .bind(namespace)
        .bind(kind.as_str())
        .bind(to_millis(cutoff))
        .execute(pool)
        .await?;

        Ok(result.rows_affected())
    }
}
