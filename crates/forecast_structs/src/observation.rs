use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Pollutants whose distributions are watched for drift.
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
pub enum Pollutant {
    Pm25,
    Pm10,
    No2,
    O3,
}

impl Pollutant {
    /// Column name used by the observation store.
    #[must_use]
    pub const fn column(self) -> &'static str {
        match self {
            Self::Pm25 => "pm25",
            Self::Pm10 => "pm10",
            Self::No2 => "no2",
            Self::O3 => "o3",
        }
    }

    /// Reads this pollutant from an observation.
    #[must_use]
    pub const fn value(self, observation: &Observation) -> Option<f64> {
        match self {
            Self::Pm25 => Some(observation.pm25),
            Self::Pm10 => observation.pm10,
            Self::No2 => observation.no2,
            Self::O3 => observation.o3,
        }
    }
}

/// One hourly reading from a monitoring station.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub station_id: String,
    pub timestamp: DateTime<Utc>,
    /// µg/m³
    pub pm25: f64,
    pub pm10: Option<f64>,
    pub no2: Option<f64>,
    pub o3: Option<f64>,
    /// °C
    pub temperature: f64,
    /// %
    pub humidity: f64,
    /// m/s
    pub wind_speed: f64,
    /// hPa
    pub pressure: f64,
}

/// Forecast weather for one future hour.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WeatherForecast {
    pub timestamp: DateTime<Utc>,
    pub temperature: f64,
    pub humidity: f64,
    pub wind_speed: f64,
    pub pressure: f64,
}
