//! Orchestration history: completed runs and evaluated triggers.

use chrono::{DateTime, Utc};
use forecast_structs::{RetrainingResult, RetrainingTrigger};
use sqlx::SqlitePool;

use crate::{StoreError, to_millis};

#[derive(sqlx::FromRow)]
struct PayloadRow {
    payload: String,
}

#[derive(sqlx::FromRow)]
struct TriggerRow {
    payload: String,
    dispatched: bool,
}

/// Repository for retraining results.
pub struct RetrainingResultRepository;

impl RetrainingResultRepository {
    /// Stores a completed run.
    ///
    /// # Errors
    ///
    /// Returns an error if the result cannot be encoded or the insert fails.
    pub async fn insert(pool: &SqlitePool, result: &RetrainingResult) -> Result<(), StoreError> {
        sqlx::query(
            r"
            INSERT INTO retraining_results
                (id, trigger_type, model_scope, success, completed_at, payload)
            VALUES (?, ?, ?, ?, ?, ?)
            ",
        )
        .bind(result.id.to_string())
        .bind(result.trigger.trigger_type.to_string())
        .bind(result.trigger.model.to_string())
        .bind(result.success)
        .bind(to_millis(result.completed_at))
        .bind(serde_json::to_string(result)?)
        .execute(pool)
        .await?;

        Ok(())
    }

    /// Lists the most recent results, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or a payload is corrupt.
    pub async fn list_recent(
        pool: &SqlitePool,
        limit: u32,
    ) -> Result<Vec<RetrainingResult>, StoreError> {
        let rows: Vec<PayloadRow> = sqlx::query_as(
            "SELECT payload FROM retraining_results ORDER BY completed_at DESC LIMIT ?",
        )
        .bind(i64::from(limit))
        .fetch_all(pool)
        .await?;

        rows.into_iter()
            .map(|row| serde_json::from_str(&row.payload).map_err(StoreError::from))
            .collect()
    }
}

/// A trigger as recorded by the control loop.
#[derive(Debug, Clone, PartialEq)]
pub struct LoggedTrigger {
    pub trigger: RetrainingTrigger,
    /// Whether the trigger was handed to the retraining queue.
    pub dispatched: bool,
}

/// Repository for evaluated triggers, dispatched or not.
pub struct TriggerLogRepository;

impl TriggerLogRepository {
    /// Records a trigger.
    ///
    /// # Errors
    ///
    /// Returns an error if the trigger cannot be encoded or the insert fails.
    pub async fn insert(
        pool: &SqlitePool,
        trigger: &RetrainingTrigger,
        dispatched: bool,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r"
            INSERT OR IGNORE INTO trigger_log
                (id, trigger_type, model_scope, severity, dispatched, created_at, payload)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ",
        )
        .bind(trigger.id.to_string())
        .bind(trigger.trigger_type.to_string())
        .bind(trigger.model.to_string())
        .bind(trigger.severity.to_string())
        .bind(dispatched)
        .bind(to_millis(trigger.timestamp))
        .bind(trigger.to_json()?)
        .execute(pool)
        .await?;

        Ok(())
    }

    /// Lists the most recent triggers, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or a payload is corrupt.
    pub async fn list_recent(
        pool: &SqlitePool,
        limit: u32,
    ) -> Result<Vec<LoggedTrigger>, StoreError> {
        let rows: Vec<TriggerRow> = sqlx::query_as(
            "SELECT payload, dispatched FROM trigger_log ORDER BY created_at DESC LIMIT ?",
        )
        .bind(i64::from(limit))
        .fetch_all(pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok::<_, StoreError>(LoggedTrigger {
                    trigger: RetrainingTrigger::from_json(&row.payload)?,
                    dispatched: row.dispatched,
                })
            })
            .collect()
    }

    /// Triggers dispatched since `since` that have no retraining result yet.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn count_pending(pool: &SqlitePool, since: DateTime<Utc>) -> Result<u64, StoreError> {
        let pending: i64 = sqlx::query_scalar(
            r"
            SELECT COUNT(*) FROM trigger_log t
            WHERE t.dispatched = 1
              AND t.created_at >= ?
              AND NOT EXISTS (
                  SELECT 1 FROM retraining_results r
                  WHERE json_extract(r.payload, '$.trigger.id') = t.id
              )
            ",
        )
        .bind(to_millis(since))
        .fetch_one(pool)
        .await?;

        Ok(u64::try_from(pending).unwrap_or_default())
    }
}
