//! Feature extractor crate for the PM2.5 forecasters.
//!
//! This crate transforms raw hourly station observations into feature rows
//! that every forecaster can consume for training and inference.

use std::collections::BTreeMap;
use std::f64::consts::TAU;

use chrono::{DateTime, Datelike, Duration, Timelike, Utc};
use forecast_structs::{Observation, WeatherForecast};

/// Hours of PM2.5 history carried by every row.
pub const HISTORY_HOURS: usize = 24;

/// The number of features in a flattened row.
/// This includes:
/// - Hour of day, sin/cos (2)
/// - Day of week, sin/cos (2)
/// - Temperature, humidity, wind speed, pressure (4)
/// - PM2.5 one hour ago, 24 hours ago, 24h rolling mean (3)
/// - Mean PM2.5 of the other stations one hour ago (1)
///
/// Total: 12 features
pub const FEATURE_COUNT: usize = 12;

/// Scaling constants that bring raw units to roughly `[-1, 1]`.
pub mod scale {
    /// PM2.5 concentration divisor (µg/m³).
    pub const PM25: f64 = 100.0;
    /// Temperature divisor (°C).
    pub const TEMPERATURE: f64 = 40.0;
    /// Relative humidity divisor (%).
    pub const HUMIDITY: f64 = 100.0;
    /// Wind speed divisor (m/s).
    pub const WIND_SPEED: f64 = 20.0;
    /// Reference sea-level pressure (hPa).
    pub const PRESSURE_REFERENCE: f64 = 1013.0;
    /// Pressure deviation divisor (hPa).
    pub const PRESSURE_SPAN: f64 = 50.0;
}

/// Inputs for forecasting PM2.5 at one station for one hour.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureRow {
    pub station_id: String,
    /// The hour being forecast.
    pub timestamp: DateTime<Utc>,
    pub temperature: f64,
    pub humidity: f64,
    pub wind_speed: f64,
    pub pressure: f64,
    /// PM2.5 for the preceding hours, oldest first. Always `HISTORY_HOURS` long.
    pub history: Vec<f64>,
    /// Mean PM2.5 of other stations in the preceding hour, if any reported.
    pub neighbor_pm25: Option<f64>,
}

impl FeatureRow {
    /// PM2.5 one hour before `timestamp`.
    #[must_use]
    pub fn lag1(&self) -> f64 {
        self.history.last().copied().unwrap_or_default()
    }

    /// Oldest PM2.5 value in the history window.
    #[must_use]
    pub fn lag24(&self) -> f64 {
        self.history.first().copied().unwrap_or_default()
    }

    #[must_use]
    pub fn rolling_mean(&self) -> f64 {
        if self.history.is_empty() {
            return 0.0;
        }
        self.history.iter().sum::<f64>() / self.history.len() as f64
    }

    /// Neighbour mean, falling back to this station's own last reading.
    #[must_use]
    pub fn neighbor_or_lag(&self) -> f64 {
        self.neighbor_pm25.unwrap_or_else(|| self.lag1())
    }

    /// Flattens the row into a normalized feature vector.
    #[must_use]
    pub fn to_array(&self) -> [f32; FEATURE_COUNT] {
        let hour = f64::from(self.timestamp.hour()) / 24.0 * TAU;
        let weekday = f64::from(self.timestamp.weekday().num_days_from_monday()) / 7.0 * TAU;

        [
            hour.sin(),
            hour.cos(),
            weekday.sin(),
            weekday.cos(),
            self.temperature / scale::TEMPERATURE,
            self.humidity / scale::HUMIDITY,
            self.wind_speed / scale::WIND_SPEED,
            (self.pressure - scale::PRESSURE_REFERENCE) / scale::PRESSURE_SPAN,
            self.lag1() / scale::PM25,
            self.lag24() / scale::PM25,
            self.rolling_mean() / scale::PM25,
            self.neighbor_or_lag() / scale::PM25,
        ]
        .map(|value| value as f32)
    }

    /// Scaled PM2.5 history, oldest first.
    #[must_use]
    pub fn scaled_history(&self) -> Vec<f32> {
        self.history
            .iter()
            .map(|value| (value / scale::PM25) as f32)
            .collect()
    }

    /// Builds the row for the following hour.
    ///
    /// `previous_pm25` becomes the newest history entry and the weather is
    /// replaced by the forecast for the new hour.
    #[must_use]
    pub fn advance(&self, previous_pm25: f64, weather: &WeatherForecast) -> Self {
        let mut history = self.history.clone();
        history.push(previous_pm25);
        if history.len() > HISTORY_HOURS {
            history.drain(..history.len() - HISTORY_HOURS);
        }

        Self {
            station_id: self.station_id.clone(),
            timestamp: weather.timestamp,
            temperature: weather.temperature,
            humidity: weather.humidity,
            wind_speed: weather.wind_speed,
            pressure: weather.pressure,
            history,
            // Neighbours are not forecast; keep the last known value.
            neighbor_pm25: self.neighbor_pm25,
        }
    }
}

/// A feature row paired with the PM2.5 actually observed for its hour.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub row: FeatureRow,
    pub target: f64,
}

/// Builds training samples from observations.
///
/// Observations may be in any order and span several stations. Each
/// observation with at least one earlier reading from its station becomes a
/// sample whose target is the observed PM2.5.
#[must_use]
pub fn build_samples(observations: &[Observation]) -> Vec<Sample> {
    let by_station = group_by_station(observations);
    let hourly = readings_by_hour(observations);

    let mut samples = Vec::new();
    for (station_id, readings) in &by_station {
        for index in 1..readings.len() {
            let current = readings[index];
            let row = row_from_history(
                station_id,
                current.timestamp,
                weather_of(current),
                &readings[..index],
                neighbor_mean(&hourly, station_id, &readings[index - 1]),
            );
            samples.push(Sample {
                row,
                target: current.pm25,
            });
        }
    }

    samples.sort_by(|a, b| a.row.timestamp.cmp(&b.row.timestamp));
    samples
}

/// Builds one row per station for the hour after its latest observation.
///
/// The latest observed weather stands in for the unknown next-hour weather.
#[must_use]
pub fn next_hour_rows(observations: &[Observation]) -> Vec<FeatureRow> {
    let by_station = group_by_station(observations);
    let hourly = readings_by_hour(observations);

    by_station
        .iter()
        .filter_map(|(station_id, readings)| {
            let latest = readings.last()?;
            let mut weather = weather_of(latest);
            weather.timestamp = latest.timestamp + Duration::hours(1);
            Some(row_from_history(
                station_id,
                weather.timestamp,
                weather,
                readings,
                neighbor_mean(&hourly, station_id, latest),
            ))
        })
        .collect()
}

/// Weather of an observation, as a forecast for its own hour.
#[must_use]
pub fn weather_of(observation: &Observation) -> WeatherForecast {
    WeatherForecast {
        timestamp: observation.timestamp,
        temperature: observation.temperature,
        humidity: observation.humidity,
        wind_speed: observation.wind_speed,
        pressure: observation.pressure,
    }
}

fn group_by_station(observations: &[Observation]) -> BTreeMap<&str, Vec<&Observation>> {
    let mut by_station: BTreeMap<&str, Vec<&Observation>> = BTreeMap::new();
    for observation in observations {
        by_station
            .entry(observation.station_id.as_str())
            .or_default()
            .push(observation);
    }
    for readings in by_station.values_mut() {
        readings.sort_by_key(|observation| observation.timestamp);
    }
    by_station
}

/// PM2.5 readings of every station, keyed by hour.
type HourlyReadings<'a> = BTreeMap<DateTime<Utc>, Vec<(&'a str, f64)>>;

fn readings_by_hour(observations: &[Observation]) -> HourlyReadings<'_> {
    let mut readings: HourlyReadings<'_> = BTreeMap::new();
    for observation in observations {
        readings
            .entry(observation.timestamp)
            .or_default()
            .push((observation.station_id.as_str(), observation.pm25));
    }
    readings
}

fn neighbor_mean(readings: &HourlyReadings<'_>, station_id: &str, at: &Observation) -> Option<f64> {
    let others: Vec<f64> = readings
        .get(&at.timestamp)?
        .iter()
        .filter(|(station, _)| *station != station_id)
        .map(|(_, pm25)| *pm25)
        .collect();

    if others.is_empty() {
        None
    } else {
        Some(others.iter().sum::<f64>() / others.len() as f64)
    }
}

fn row_from_history(
    station_id: &str,
    timestamp: DateTime<Utc>,
    weather: WeatherForecast,
    earlier: &[&Observation],
    neighbor_pm25: Option<f64>,
) -> FeatureRow {
    let start = earlier.len().saturating_sub(HISTORY_HOURS);
    let mut history: Vec<f64> = earlier[start..].iter().map(|o| o.pm25).collect();

    // Short histories are front-padded with the oldest reading.
    if let Some(&oldest) = history.first() {
        let mut padded = vec![oldest; HISTORY_HOURS - history.len()];
        padded.append(&mut history);
        history = padded;
    }

    FeatureRow {
        station_id: station_id.to_string(),
        timestamp,
        temperature: weather.temperature,
        humidity: weather.humidity,
        wind_speed: weather.wind_speed,
        pressure: weather.pressure,
        history,
        neighbor_pm25,
    }
}
