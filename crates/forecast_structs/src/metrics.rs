use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Namespaces of samples kept by the performance monitor.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum MetricKind {
    Request,
    System,
    Model,
}

impl MetricKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Request => "request",
            Self::System => "system",
            Self::Model => "model",
        }
    }
}

/// One served API request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestSample {
    pub endpoint: String,
    pub method: String,
    pub status_code: u16,
    pub response_time_ms: f64,
    pub timestamp: DateTime<Utc>,
}

impl RequestSample {
    /// Whether the request ended in a client or server error.
    #[must_use]
    pub const fn is_error(&self) -> bool {
        self.status_code >= 400
    }
}

/// Host resource usage at a point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemSample {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub disk_percent: f64,
    pub active_connections: u32,
    pub timestamp: DateTime<Utc>,
}

/// Live accuracy of one model version. Immutable once written.
///
/// `accuracy` is a percentage in `[0, 100]`; `avg_response_time` is in milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceSample {
    pub model_name: String,
    pub model_version: String,
    pub rmse: f64,
    pub mae: f64,
    pub accuracy: f64,
    pub prediction_count: u64,
    pub avg_response_time: f64,
    pub timestamp: DateTime<Utc>,
}

/// A sample of any kind, as appended to the metric store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MetricRecord {
    Request(RequestSample),
    System(SystemSample),
    Model(PerformanceSample),
}

impl MetricRecord {
    #[must_use]
    pub const fn kind(&self) -> MetricKind {
        match self {
            Self::Request(_) => MetricKind::Request,
            Self::System(_) => MetricKind::System,
            Self::Model(_) => MetricKind::Model,
        }
    }

    #[must_use]
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::Request(sample) => sample.timestamp,
            Self::System(sample) => sample.timestamp,
            Self::Model(sample) => sample.timestamp,
        }
    }

    /// Model name for model samples, `None` otherwise.
    #[must_use]
    pub fn model_name(&self) -> Option<&str> {
        match self {
            Self::Model(sample) => Some(&sample.model_name),
            Self::Request(_) | Self::System(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_is_tagged_by_kind() {
        let record = MetricRecord::Request(RequestSample {
            endpoint: "/forecast".to_string(),
            method: "GET".to_string(),
            status_code: 503,
            response_time_ms: 84.0,
            timestamp: Utc::now(),
        });

        let value = serde_json::to_value(&record).expect("serialize");
        assert_eq!(value["kind"], "request");
        assert_eq!(record.kind(), MetricKind::Request);
        assert!(record.model_name().is_none());
    }

    #[test]
    fn test_request_error_status() {
        let mut sample = RequestSample {
            endpoint: "/health".to_string(),
            method: "GET".to_string(),
            status_code: 200,
            response_time_ms: 3.0,
            timestamp: Utc::now(),
        };
        assert!(!sample.is_error());
        sample.status_code = 404;
        assert!(sample.is_error());
    }
}
