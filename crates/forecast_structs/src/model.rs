use core::fmt;
use core::str::FromStr;
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::IntoEnumIterator;
use uuid::Uuid;

/// Scope string that addresses every constituent model at once.
pub const ENSEMBLE_SCOPE: &str = "ensemble";

/// The individual forecasters blended by the ensemble.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    strum::EnumIter,
    strum::EnumCount,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ModelKind {
    /// Gradient-boosted trees over tabular features. Fast to retrain.
    GradientBoost,
    /// Recurrent sequence model over hourly windows.
    Recurrent,
    /// Graph model that uses neighbouring stations.
    GraphSpatial,
}

impl ModelKind {
    /// Returns every model kind in a stable order.
    pub fn all() -> impl Iterator<Item = Self> {
        Self::iter()
    }

    /// Returns the registry name for this model kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::GradientBoost => "gradient_boost",
            Self::Recurrent => "recurrent",
            Self::GraphSpatial => "graph_spatial",
        }
    }

    /// Default number of days between scheduled retrains.
    #[must_use]
    pub const fn default_retrain_days(self) -> f64 {
        match self {
            Self::GradientBoost => 7.0,
            Self::Recurrent => 14.0,
            Self::GraphSpatial => 21.0,
        }
    }
}

/// Which models a trigger or run applies to.
///
/// Serialized as a plain string: `"ensemble"` or the model kind name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum ModelScope {
    /// All constituent models.
    Ensemble,
    /// A single named model.
    Model(ModelKind),
}

impl ModelScope {
    /// Returns the models this scope resolves to.
    #[must_use]
    pub fn targets(self) -> Vec<ModelKind> {
        match self {
            Self::Ensemble => ModelKind::all().collect(),
            Self::Model(kind) => vec![kind],
        }
    }
}

impl fmt::Display for ModelScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ensemble => f.write_str(ENSEMBLE_SCOPE),
            Self::Model(kind) => f.write_str(kind.as_str()),
        }
    }
}

impl FromStr for ModelScope {
    type Err = strum::ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case(ENSEMBLE_SCOPE) {
            return Ok(Self::Ensemble);
        }
        s.parse::<ModelKind>().map(Self::Model)
    }
}

impl From<ModelScope> for String {
    fn from(scope: ModelScope) -> Self {
        scope.to_string()
    }
}

impl TryFrom<String> for ModelScope {
    type Error = strum::ParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ModelKind> for ModelScope {
    fn from(kind: ModelKind) -> Self {
        Self::Model(kind)
    }
}

/// Lifecycle stage of a registered model version.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Default,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ModelStage {
    /// Registered but not assigned to any stage.
    #[default]
    None,
    /// Candidate under evaluation.
    Staging,
    /// Actively serving predictions.
    Production,
    /// Retired.
    Archived,
}

/// A registered version of a trained model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelVersion {
    pub model: ModelKind,
    pub version: i64,
    pub stage: ModelStage,
    /// Run that produced this version.
    pub run_id: Uuid,
    pub metrics: BTreeMap<String, f64>,
    /// Object store path of the saved parameters, if they were saved.
    #[serde(default)]
    pub artifact: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Metadata of one tracked training run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: Uuid,
    pub model: ModelKind,
    pub params: BTreeMap<String, serde_json::Value>,
    pub metrics: BTreeMap<String, f64>,
    pub tags: BTreeMap<String, String>,
    pub started_at: DateTime<Utc>,
}

impl RunRecord {
    /// Creates an empty run record for a model.
    #[must_use]
    pub fn new(model: ModelKind) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            model,
            params: BTreeMap::new(),
            metrics: BTreeMap::new(),
            tags: BTreeMap::new(),
            started_at: Utc::now(),
        }
    }
}

/// One row of a version comparison table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionComparison {
    pub version: i64,
    pub stage: ModelStage,
    /// Value of the compared metric, if the version logged it.
    pub metric_value: Option<f64>,
    pub created_at: DateTime<Utc>,
}
