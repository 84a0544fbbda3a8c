//! Recurrent sequence model over the hourly PM2.5 history.
//!
//! The network trains on all but the latest hours; those are held out to
//! size the prediction interval.

use std::sync::Mutex;

use burn::backend::ndarray::NdArrayDevice;
use burn::backend::{Autodiff, NdArray};
use burn::module::AutodiffModule;
use burn::nn::{Linear, LinearConfig, Lstm, LstmConfig, Relu};
use burn::prelude::*;
use burn::record::{BinBytesRecorder, FullPrecisionSettings, Recorder};
use feature_extractor::{FEATURE_COUNT, FeatureRow};
use forecast_structs::ModelKind;
use serde::{Deserialize, Serialize};

use crate::dataset::{SequenceBatcher, SequenceDataset, SequenceItem, unscale_prediction};
use crate::training::{TrainingConfig, train_network};
use crate::{
    CALIBRATION_FRACTION, CancelToken, ForecastError, Forecaster, PredictionOutput, TrainingData,
    TrainingMetrics, metrics, uncertainty_from,
};

type TrainBackend = Autodiff<NdArray>;
type InferBackend = NdArray;

/// LSTM over the history window joined with the flat row features.
#[derive(Module, Debug)]
pub struct SequenceNet<B: Backend> {
    lstm: Lstm<B>,
    hidden: Linear<B>,
    output: Linear<B>,
    activation: Relu,
}

impl<B: Backend> SequenceNet<B> {
    /// Creates a new network with `hidden_size` LSTM units.
    pub fn new(device: &B::Device, hidden_size: usize) -> Self {
        Self {
            lstm: LstmConfig::new(1, hidden_size, true).init(device),
            hidden: LinearConfig::new(hidden_size + FEATURE_COUNT, hidden_size).init(device),
            output: LinearConfig::new(hidden_size, 1).init(device),
            activation: Relu::new(),
        }
    }

    /// Forward pass.
    ///
    /// * `history` - Tensor of shape [`batch_size`, `HISTORY_HOURS`, 1]
    /// * `features` - Tensor of shape [`batch_size`, `FEATURE_COUNT`]
    ///
    /// Returns a tensor of shape [`batch_size`, 1].
    pub fn forward(&self, history: Tensor<B, 3>, features: Tensor<B, 2>) -> Tensor<B, 2> {
        let (sequence, _) = self.lstm.forward(history, None);
        let [batch_size, steps, hidden_size] = sequence.dims();
        let last = sequence
            .narrow(1, steps - 1, 1)
            .reshape([batch_size, hidden_size]);

        let x = Tensor::cat(vec![last, features], 1);
        let x = self.hidden.forward(x);
        let x = self.activation.forward(x);
        self.output.forward(x)
    }
}

struct Fitted {
    net: SequenceNet<InferBackend>,
    hidden_size: usize,
    uncertainty: f64,
}

/// Saved form of a fit: the burn record plus what is needed to rebuild the net.
#[derive(Serialize, Deserialize)]
struct SavedNet {
    hidden_size: usize,
    uncertainty: f64,
    weights: Vec<u8>,
}

fn recorder() -> BinBytesRecorder<FullPrecisionSettings> {
    BinBytesRecorder::default()
}

/// Recurrent forecaster backed by a `burn` LSTM on the CPU.
pub struct RecurrentForecaster {
    config: TrainingConfig,
    device: NdArrayDevice,
    fitted: Mutex<Option<Fitted>>,
}

impl RecurrentForecaster {
    #[must_use]
    pub fn new(config: TrainingConfig) -> Self {
        Self {
            config,
            device: NdArrayDevice::default(),
            fitted: Mutex::new(None),
        }
    }

    fn infer(
        net: &SequenceNet<InferBackend>,
        rows: &[FeatureRow],
        device: &NdArrayDevice,
    ) -> Vec<f64> {
        if rows.is_empty() {
            return Vec::new();
        }

        let batcher = SequenceBatcher::<InferBackend>::new(*device);
        let items = rows.iter().map(SequenceItem::from_row).collect();
        let batch = batcher.batch(items);

        let outputs: Vec<f32> = net
            .forward(batch.history, batch.features)
            .into_data()
            .to_vec()
            .unwrap_or_default();

        rows.iter()
            .zip(outputs)
            .map(|(row, output)| unscale_prediction(row, output))
            .collect()
    }
}

impl Forecaster for RecurrentForecaster {
    fn kind(&self) -> ModelKind {
        ModelKind::Recurrent
    }

    fn is_trained(&self) -> bool {
        self.fitted.lock().is_ok_and(|fitted| fitted.is_some())
    }

    fn train_cancellable(
        &mut self,
        data: &TrainingData,
        cancel: &CancelToken,
    ) -> Result<TrainingMetrics, ForecastError> {
        data.require(self.config.min_samples)?;
        let hidden_size = self.config.hidden_size;
        let (earlier, latest) = data.split_latest(CALIBRATION_FRACTION);

        let model = SequenceNet::<TrainBackend>::new(&self.device, hidden_size);
        let dataset = SequenceDataset::from_slice(&earlier.samples);
        let (model, output) = train_network(model, &dataset, &self.config, &self.device, cancel)?;
        if !output.final_train_loss.is_finite() {
            return Err(ForecastError::Training(format!(
                "loss diverged to {}",
                output.final_train_loss
            )));
        }

        let net = model.valid();
        let held_out = Self::infer(&net, &latest.rows(), &self.device);
        let uncertainty = uncertainty_from(&held_out, &latest.targets());
        let predictions = Self::infer(&net, &data.rows(), &self.device);
        let targets = data.targets();

        let fitted = self
            .fitted
            .get_mut()
            .map_err(|_| ForecastError::Training("model lock poisoned".to_string()))?;
        *fitted = Some(Fitted {
            net,
            hidden_size,
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
        let guard = self
            .fitted
            .lock()
            .map_err(|_| ForecastError::InvalidInput("model lock poisoned".to_string()))?;
        let fitted = guard.as_ref().ok_or(ForecastError::NotTrained(self.kind()))?;

        let predictions = Self::infer(&fitted.net, rows, &self.device);
        Ok(PredictionOutput::with_interval(
            predictions,
            fitted.uncertainty,
            return_confidence,
        ))
    }

    fn save(&self) -> Result<Vec<u8>, ForecastError> {
        let guard = self
            .fitted
            .lock()
            .map_err(|_| ForecastError::State("model lock poisoned".to_string()))?;
        let fitted = guard.as_ref().ok_or(ForecastError::NotTrained(self.kind()))?;

        let record = fitted.net.clone().into_record();
        let weights = Recorder::<InferBackend>::record(&recorder(), record, ())
            .map_err(|error| ForecastError::State(format!("{error:?}")))?;
        Ok(serde_json::to_vec(&SavedNet {
            hidden_size: fitted.hidden_size,
            uncertainty: fitted.uncertainty,
            weights,
        })?)
    }

    fn restore(&mut self, bytes: &[u8]) -> Result<(), ForecastError> {
        let saved: SavedNet = serde_json::from_slice(bytes)?;
        let record = Recorder::<InferBackend>::load(&recorder(), saved.weights, &self.device)
            .map_err(|error| ForecastError::State(format!("{error:?}")))?;
        let net =
            SequenceNet::<InferBackend>::new(&self.device, saved.hidden_size).load_record(record);

        let fitted = self
            .fitted
            .get_mut()
            .map_err(|_| ForecastError::State("model lock poisoned".to_string()))?;
        *fitted = Some(Fitted {
            net,
            hidden_size: saved.hidden_size,
            uncertainty: saved.uncertainty,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::synthetic_data;

    fn small_config() -> TrainingConfig {
        TrainingConfig {
            epochs: 3,
            batch_size: 32,
            hidden_size: 8,
            ..TrainingConfig::default()
        }
    }

    #[test]
    fn test_not_enough_data() {
        let mut model = RecurrentForecaster::new(small_config());
        let data = synthetic_data(10);

        let result = model.train(&data);
        assert!(matches!(result, Err(ForecastError::NotEnoughData { required: 48, .. })));
        assert!(!model.is_trained());
    }

    #[test]
    fn test_train_then_predict_with_interval() {
        let mut model = RecurrentForecaster::new(small_config());
        let data = synthetic_data(48);

        let metrics = model.train(&data).expect("training should succeed");
        assert!(model.is_trained());
        assert!(metrics.rmse.is_finite());
        assert_eq!(metrics.sample_count, data.len());

        let rows = data.rows();
        let output = model.predict(&rows[..5], true).expect("predict");
        assert_eq!(output.predictions.len(), 5);

        let lower = output.lower_bound.as_ref().expect("lower");
        let upper = output.upper_bound.as_ref().expect("upper");
        for ((l, p), u) in lower.iter().zip(&output.predictions).zip(upper) {
            assert!(l <= p && p <= u);
        }
    }

    #[test]
    fn test_restored_net_predicts_like_the_original() {
        let mut model = RecurrentForecaster::new(small_config());
        let data = synthetic_data(48);
        model.train(&data).expect("train");
        let bytes = model.save().expect("save");

        let mut restored = RecurrentForecaster::new(TrainingConfig::default());
        restored.restore(&bytes).expect("restore");
        assert!(restored.is_trained());

        let rows = data.rows();
        let original = model.predict(&rows[..4], true).expect("predict");
        let reloaded = restored.predict(&rows[..4], true).expect("predict");
        for (a, b) in original.predictions.iter().zip(&reloaded.predictions) {
            assert!((a - b).abs() < 1e-3, "{a} vs {b}");
        }
        let (before, after) = (original.uncertainty(0), reloaded.uncertainty(0));
        assert!((before.expect("interval") - after.expect("interval")).abs() < 1e-9);
    }

    #[test]
    fn test_evaluate_reports_accuracy() {
        let mut model = RecurrentForecaster::new(small_config());
        let data = synthetic_data(48);
        model.train(&data).expect("train");

        let evaluation = model.evaluate(&data).expect("evaluate");
        assert!((0.0..=100.0).contains(&evaluation.accuracy_within_20pct));
        assert!(evaluation.accuracy_within_10pct <= evaluation.accuracy_within_20pct);
    }
}
