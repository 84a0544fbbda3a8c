//! Spatial model: ridge regression on a station's own lags and its neighbours.

use feature_extractor::{FeatureRow, scale};
use forecast_structs::ModelKind;
use serde::{Deserialize, Serialize};

use crate::{
    CALIBRATION_FRACTION, CancelToken, ForecastError, Forecaster, PredictionOutput, TrainingData,
    TrainingMetrics, metrics, uncertainty_from,
};

const PREDICTORS: usize = 7;

#[derive(Debug, Clone, PartialEq)]
pub struct GraphSpatialConfig {
    /// L2 penalty on non-intercept coefficients.
    pub ridge: f64,
    pub min_samples: usize,
}

impl Default for GraphSpatialConfig {
    fn default() -> Self {
        Self {
            ridge: 1e-3,
            min_samples: 24,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Fitted {
    coefficients: [f64; PREDICTORS],
    uncertainty: f64,
}

/// Regresses PM2.5 on neighbour-station readings and the station's own history.
#[derive(Debug, Clone)]
pub struct GraphSpatialForecaster {
    config: GraphSpatialConfig,
    fitted: Option<Fitted>,
}

impl GraphSpatialForecaster {
    #[must_use]
    pub const fn new(config: GraphSpatialConfig) -> Self {
        Self {
            config,
            fitted: None,
        }
    }

    /// Solves the ridge normal equations over `data`.
    fn fit(&self, data: &TrainingData) -> Result<[f64; PREDICTORS], ForecastError> {
        let mut xtx = [[0.0; PREDICTORS]; PREDICTORS];
        let mut xty = [0.0; PREDICTORS];
        for sample in &data.samples {
            let x = predictors(&sample.row);
            let y = sample.target / scale::PM25;
            for i in 0..PREDICTORS {
                xty[i] += x[i] * y;
                for j in 0..PREDICTORS {
                    xtx[i][j] += x[i] * x[j];
                }
            }
        }
        for (i, diagonal) in xtx.iter_mut().enumerate().skip(1) {
            diagonal[i] += self.config.ridge * data.len() as f64;
        }

        solve(xtx, xty)
            .ok_or_else(|| ForecastError::Training("normal equations are singular".to_string()))
    }
}

fn predictors(row: &FeatureRow) -> [f64; PREDICTORS] {
    [
        1.0,
        row.lag1() / scale::PM25,
        row.neighbor_or_lag() / scale::PM25,
        row.rolling_mean() / scale::PM25,
        row.lag24() / scale::PM25,
        row.wind_speed / scale::WIND_SPEED,
        row.humidity / scale::HUMIDITY,
    ]
}

fn apply(coefficients: &[f64; PREDICTORS], row: &FeatureRow) -> f64 {
    let x = predictors(row);
    let scaled: f64 = coefficients.iter().zip(x).map(|(c, v)| c * v).sum();
    (scaled * scale::PM25).max(0.0)
}

/// Solves `a · x = b` by Gaussian elimination with partial pivoting.
fn solve(
    mut a: [[f64; PREDICTORS]; PREDICTORS],
    mut b: [f64; PREDICTORS],
) -> Option<[f64; PREDICTORS]> {
    for col in 0..PREDICTORS {
        let pivot =
            (col..PREDICTORS).max_by(|&i, &j| a[i][col].abs().total_cmp(&a[j][col].abs()))?;
        if a[pivot][col].abs() < 1e-12 {
            return None;
        }
        a.swap(col, pivot);
        b.swap(col, pivot);

        for row in (col + 1)..PREDICTORS {
            let factor = a[row][col] / a[col][col];
            for k in col..PREDICTORS {
                a[row][k] -= factor * a[col][k];
            }
            b[row] -= factor * b[col];
        }
    }

    let mut x = [0.0; PREDICTORS];
    for row in (0..PREDICTORS).rev() {
        let tail: f64 = ((row + 1)..PREDICTORS).map(|k| a[row][k] * x[k]).sum();
        x[row] = (b[row] - tail) / a[row][row];
    }
    Some(x)
}

impl Forecaster for GraphSpatialForecaster {
    fn kind(&self) -> ModelKind {
        ModelKind::GraphSpatial
    }

    fn is_trained(&self) -> bool {
        self.fitted.is_some()
    }

    fn train_cancellable(
        &mut self,
        data: &TrainingData,
        cancel: &CancelToken,
    ) -> Result<TrainingMetrics, ForecastError> {
        data.require(self.config.min_samples)?;

        // Interval width comes from a fit on earlier hours scored on the latest ones.
        let (earlier, latest) = data.split_latest(CALIBRATION_FRACTION);
        let calibration = self.fit(&earlier)?;
        let held_out: Vec<f64> = latest.rows().iter().map(|row| apply(&calibration, row)).collect();
        let uncertainty = uncertainty_from(&held_out, &latest.targets());

        cancel.check()?;
        let coefficients = self.fit(data)?;
        let rows = data.rows();
        let targets = data.targets();
        let predictions: Vec<f64> = rows.iter().map(|row| apply(&coefficients, row)).collect();
        self.fitted = Some(Fitted {
            coefficients,
            uncertainty,
        });

        Ok(TrainingMetrics {
            rmse: metrics::rmse(&predictions, &targets),
            mae: metrics::mae(&predictions, &targets),
            sample_count: data.len(),
        })
    }

    fn predict(
        &self,
        rows: &[FeatureRow],
        return_confidence: bool,
    ) -> Result<PredictionOutput, ForecastError> {
        let fitted = self
            .fitted
            .as_ref()
            .ok_or(ForecastError::NotTrained(self.kind()))?;

        let predictions = rows.iter().map(|row| apply(&fitted.coefficients, row)).collect();
        Ok(PredictionOutput::with_interval(
            predictions,
            fitted.uncertainty,
            return_confidence,
        ))
    }

    fn save(&self) -> Result<Vec<u8>, ForecastError> {
        let fitted = self
            .fitted
            .as_ref()
            .ok_or(ForecastError::NotTrained(self.kind()))?;
        Ok(serde_json::to_vec(fitted)?)
    }

    fn restore(&mut self, bytes: &[u8]) -> Result<(), ForecastError> {
        self.fitted = Some(serde_json::from_slice(bytes)?);
        Ok(())
    }
}
