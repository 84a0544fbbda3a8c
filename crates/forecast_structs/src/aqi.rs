//! PM2.5 to AQI conversion.

use serde::{Deserialize, Serialize};

/// One segment of the piecewise-linear AQI scale.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AqiBreakpoint {
    /// Lower concentration bound in µg/m³ (inclusive).
    pub concentration_low: f64,
    /// Upper concentration bound in µg/m³ (inclusive).
    pub concentration_high: f64,
    pub index_low: u32,
    pub index_high: u32,
}

impl AqiBreakpoint {
    const fn new(
        concentration_low: f64,
        concentration_high: f64,
        index_low: u32,
        index_high: u32,
    ) -> Self {
        Self {
            concentration_low,
            concentration_high,
            index_low,
            index_high,
        }
    }
}

/// US EPA 24-hour PM2.5 breakpoints.
pub const PM25_BREAKPOINTS: [AqiBreakpoint; 7] = [
    AqiBreakpoint::new(0.0, 12.0, 0, 50),
    AqiBreakpoint::new(12.1, 35.4, 51, 100),
    AqiBreakpoint::new(35.5, 55.4, 101, 150),
    AqiBreakpoint::new(55.5, 150.4, 151, 200),
    AqiBreakpoint::new(150.5, 250.4, 201, 300),
    AqiBreakpoint::new(250.5, 350.4, 301, 400),
    AqiBreakpoint::new(350.5, 500.4, 401, 500),
];

/// Health category of an AQI value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AqiCategory {
    Good,
    Moderate,
    UnhealthyForSensitiveGroups,
    Unhealthy,
    VeryUnhealthy,
    Hazardous,
}

impl AqiCategory {
    /// Maps an AQI value to its category.
    #[must_use]
    pub const fn from_aqi(aqi: u32) -> Self {
        match aqi {
            0..=50 => Self::Good,
            51..=100 => Self::Moderate,
            101..=150 => Self::UnhealthyForSensitiveGroups,
            151..=200 => Self::Unhealthy,
            201..=300 => Self::VeryUnhealthy,
            _ => Self::Hazardous,
        }
    }
}

/// Converts a PM2.5 concentration to an AQI value using the given breakpoints.
///
/// Concentrations are truncated to one decimal place before lookup. Values above
/// the last breakpoint saturate at its upper index; negative or non-finite
/// concentrations map to 0.
#[must_use]
pub fn pm25_to_aqi_with(pm25: f64, breakpoints: &[AqiBreakpoint]) -> u32 {
    if !pm25.is_finite() || pm25 <= 0.0 {
        return 0;
    }

    let concentration = (pm25 * 10.0).floor() / 10.0;

    for bp in breakpoints {
        if concentration <= bp.concentration_high {
            let index_span = f64::from(bp.index_high - bp.index_low);
            let concentration_span = bp.concentration_high - bp.concentration_low;
            let offset = (concentration - bp.concentration_low).max(0.0);
            let aqi = index_span / concentration_span * offset + f64::from(bp.index_low);
            return aqi.round() as u32;
        }
    }

    breakpoints.last().map_or(0, |bp| bp.index_high)
}

/// Converts a PM2.5 concentration to an AQI value using the EPA table.
#[must_use]
pub fn pm25_to_aqi(pm25: f64) -> u32 {
    pm25_to_aqi_with(pm25, &PM25_BREAKPOINTS)
}
