//! Performance monitor: fire-and-forget sample recording with running aggregates.
//!
//! Recording never blocks and never fails. Samples are handed to a background
//! writer over a bounded channel; storage errors are logged and dropped.

use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use config::MonitorConfig;
use database::MetricRepository;
use forecast_structs::{MetricKind, MetricRecord, PerformanceSample, RequestSample, SystemSample};
use serde::Serialize;
use sqlx::SqlitePool;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// Samples written per transaction by the background writer.
const WRITE_BATCH: usize = 64;

enum WriterCommand {
    Record(MetricRecord),
    Flush(oneshot::Sender<()>),
}

#[derive(Debug, Default)]
struct Aggregates {
    total_requests: u64,
    error_requests: u64,
    response_time_sum_ms: f64,
    latest_system: Option<SystemSample>,
    models: BTreeMap<String, ModelSummary>,
}

/// Running totals for one model.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ModelSummary {
    pub sample_count: u64,
    pub prediction_count: u64,
    pub last_rmse: f64,
    pub last_accuracy: f64,
}

/// Totals since process start, computed without scanning history.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PerformanceSummary {
    pub total_requests: u64,
    pub error_count: u64,
    pub error_rate: f64,
    pub avg_response_time_ms: f64,
    pub latest_system: Option<SystemSample>,
    pub models: BTreeMap<String, ModelSummary>,
}

/// Records request, system and model samples into the metric store.
pub struct PerformanceMonitor {
    pool: SqlitePool,
    config: MonitorConfig,
    sender: mpsc::Sender<WriterCommand>,
    aggregates: Mutex<Aggregates>,
}

impl PerformanceMonitor {
    /// Creates the monitor and spawns its background writer.
    ///
    /// Must be called inside a Tokio runtime. The writer stops once the
    /// monitor is dropped and its queue is drained.
    #[must_use]
    pub fn start(pool: SqlitePool, config: MonitorConfig) -> Self {
        let (sender, receiver) = mpsc::channel(config.channel_capacity.max(1));
        tokio::spawn(run_writer(pool.clone(), config.namespace.clone(), receiver));

        Self {
            pool,
            config,
            sender,
            aggregates: Mutex::new(Aggregates::default()),
        }
    }

    pub fn record_request(&self, sample: RequestSample) {
        {
            let mut aggregates = self.aggregates();
            aggregates.total_requests += 1;
            if sample.is_error() {
                aggregates.error_requests += 1;
            }
            aggregates.response_time_sum_ms += sample.response_time_ms;
        }
        self.enqueue(MetricRecord::Request(sample));
    }

    pub fn record_system(&self, sample: SystemSample) {
        self.aggregates().latest_system = Some(sample.clone());
        self.enqueue(MetricRecord::System(sample));
    }

    pub fn record_model_performance(&self, sample: PerformanceSample) {
        {
            let mut aggregates = self.aggregates();
            let summary = aggregates.models.entry(sample.model_name.clone()).or_default();
            summary.sample_count += 1;
            summary.prediction_count += sample.prediction_count;
            summary.last_rmse = sample.rmse;
            summary.last_accuracy = sample.accuracy;
        }
        self.enqueue(MetricRecord::Model(sample));
    }

    /// Waits until every sample recorded before this call has been written.
    pub async fn flush(&self) {
        let (done, wait) = oneshot::channel();
        if self.sender.send(WriterCommand::Flush(done)).await.is_err() {
            warn!("Metric writer stopped; flush skipped");
            return;
        }
        let _ = wait.await;
    }

    /// Samples of `kind` recorded within the last `window`, newest first.
    ///
    /// Storage errors are logged and yield an empty list.
    pub async fn query(&self, kind: MetricKind, window: Duration) -> Vec<MetricRecord> {
        self.query_filtered(kind, window, None).await
    }

    /// Model samples within `window`, optionally for a single model, newest first.
    pub async fn get_model_performance(
        &self,
        model_name: Option<&str>,
        window: Duration,
    ) -> Vec<PerformanceSample> {
        self.query_filtered(MetricKind::Model, window, model_name)
            .await
            .into_iter()
            .filter_map(|record| match record {
                MetricRecord::Model(sample) => Some(sample),
                MetricRecord::Request(_) | MetricRecord::System(_) => None,
            })
            .collect()
    }

    /// Summary from running aggregates only.
    pub fn get_performance_summary(&self) -> PerformanceSummary {
        let aggregates = self.aggregates();
        let requests = aggregates.total_requests;

        let (error_rate, avg_response_time_ms) = if requests == 0 {
            (0.0, 0.0)
        } else {
            (
                aggregates.error_requests as f64 / requests as f64,
                aggregates.response_time_sum_ms / requests as f64,
            )
        };

        PerformanceSummary {
            total_requests: requests,
            error_count: aggregates.error_requests,
            error_rate,
            avg_response_time_ms,
            latest_system: aggregates.latest_system.clone(),
            models: aggregates.models.clone(),
        }
    }

    /// Deletes samples older than their kind's retention. Returns the number deleted.
    pub async fn purge_expired(&self) -> u64 {
        let now = Utc::now();
        let mut purged = 0;

        for (kind, ttl) in [
            (MetricKind::Request, self.config.metrics_ttl),
            (MetricKind::System, self.config.metrics_ttl),
            (MetricKind::Model, self.config.model_ttl),
        ] {
            let cutoff = crate::window_start(now, ttl);
            match MetricRepository::purge_before(&self.pool, &self.config.namespace, kind, cutoff)
                .await
            {
                Ok(count) => purged += count,
                Err(error) => {
                    warn!(%error, kind = kind.as_str(), "Failed to purge expired samples");
                }
            }
        }

        if purged > 0 {
            debug!(purged, "Purged expired metric samples");
        }
        purged
    }

    async fn query_filtered(
        &self,
        kind: MetricKind,
        window: Duration,
        model_name: Option<&str>,
    ) -> Vec<MetricRecord> {
        let since = crate::window_start(Utc::now(), window);
        let namespace = &self.config.namespace;
        match MetricRepository::list_since(&self.pool, namespace, kind, since, model_name).await {
            Ok(records) => records,
            Err(error) => {
                warn!(%error, kind = kind.as_str(), "Failed to query metric samples");
                Vec::new()
            }
        }
    }

    fn enqueue(&self, record: MetricRecord) {
        match self.sender.try_send(WriterCommand::Record(record)) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("Metric queue full; sample dropped");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!("Metric writer stopped; sample dropped");
            }
        }
    }

    fn aggregates(&self) -> std::sync::MutexGuard<'_, Aggregates> {
        self.aggregates.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

async fn run_writer(
    pool: SqlitePool,
    namespace: String,
    mut receiver: mpsc::Receiver<WriterCommand>,
) {
    let mut batch: Vec<MetricRecord> = Vec::with_capacity(WRITE_BATCH);

    while let Some(command) = receiver.recv().await {
        let mut pending_flush = None;
        match command {
            WriterCommand::Record(record) => batch.push(record),
            WriterCommand::Flush(done) => pending_flush = Some(done),
        }

        // Drain whatever is already queued, stopping at a flush marker.
        while pending_flush.is_none() && batch.len() < WRITE_BATCH {
            match receiver.try_recv() {
                Ok(WriterCommand::Record(record)) => batch.push(record),
                Ok(WriterCommand::Flush(done)) => pending_flush = Some(done),
                Err(_) => break,
            }
        }

        if !batch.is_empty() {
            if let Err(error) = MetricRepository::insert_batch(&pool, &namespace, &batch).await {
                warn!(%error, dropped = batch.len(), "Failed to write metric samples");
            }
            batch.clear();
        }

        if let Some(done) = pending_flush {
            let _ = done.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn monitor() -> PerformanceMonitor {
        let pool = database::create_pool("sqlite::memory:").await.expect("pool");
        database::run_migrations(&pool).await.expect("migrations");
        PerformanceMonitor::start(pool, MonitorConfig::default())
    }

    fn model_sample(name: &str, rmse: f64, age: chrono::Duration) -> PerformanceSample {
        PerformanceSample {
            model_name: name.to_string(),
            model_version: "3".to_string(),
            rmse,
            mae: rmse * 0.7,
            accuracy: 78.0,
            prediction_count: 24,
            avg_response_time: 9.5,
            timestamp: Utc::now() - age,
        }
    }

    #[tokio::test]
    async fn test_recorded_samples_are_queryable_after_flush() {
        let monitor = monitor().await;

        let hours = chrono::Duration::hours;
        monitor.record_model_performance(model_sample("recurrent", 14.0, hours(2)));
        monitor.record_model_performance(model_sample("recurrent", 15.0, hours(1)));
        monitor.record_model_performance(model_sample("graph_spatial", 20.0, hours(1)));
        monitor.flush().await;

        let samples = monitor
            .get_model_performance(Some("recurrent"), Duration::from_secs(24 * 3600))
            .await;
        assert_eq!(samples.len(), 2);
        assert!((samples[0].rmse - 15.0).abs() < f64::EPSILON, "newest first");

        let all = monitor.query(MetricKind::Model, Duration::from_secs(24 * 3600)).await;
        assert_eq!(all.len(), 3);
    }

    #[tokio::test]
    async fn test_window_excludes_old_samples() {
        let monitor = monitor().await;

        let age = chrono::Duration::days(10);
        monitor.record_model_performance(model_sample("recurrent", 14.0, age));
        monitor.flush().await;

        let samples = monitor
            .get_model_performance(None, Duration::from_secs(7 * 24 * 3600))
            .await;
        assert!(samples.is_empty());
    }

    #[tokio::test]
    async fn test_summary_from_aggregates() {
        let monitor = monitor().await;

        for (status_code, response_time_ms) in [(200, 10.0), (500, 30.0)] {
            monitor.record_request(RequestSample {
                endpoint: "/forecast".to_string(),
                method: "GET".to_string(),
                status_code,
                response_time_ms,
                timestamp: Utc::now(),
            });
        }
        monitor.record_model_performance(model_sample("recurrent", 14.0, chrono::Duration::zero()));

        let summary = monitor.get_performance_summary();
        assert_eq!(summary.total_requests, 2);
        assert_eq!(summary.error_count, 1);
        assert!((summary.error_rate - 0.5).abs() < f64::EPSILON);
        assert!((summary.avg_response_time_ms - 20.0).abs() < f64::EPSILON);
        assert_eq!(summary.models["recurrent"].prediction_count, 24);
    }

    #[tokio::test]
    async fn test_purge_respects_kind_ttl() {
        let monitor = monitor().await;

        monitor.record_system(SystemSample {
            cpu_percent: 20.0,
            memory_percent: 30.0,
            disk_percent: 40.0,
            active_connections: 2,
            timestamp: Utc::now() - chrono::Duration::days(2),
        });
        let age = chrono::Duration::days(2);
        monitor.record_model_performance(model_sample("recurrent", 14.0, age));
        monitor.flush().await;

        assert_eq!(monitor.purge_expired().await, 1);
        let models = monitor
            .get_model_performance(None, Duration::from_secs(7 * 24 * 3600))
            .await;
        assert_eq!(models.len(), 1);
    }
}
