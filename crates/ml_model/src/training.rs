//! Training logic for the sequence network.

use burn::data::dataset::Dataset;
use burn::nn::loss::{MseLoss, Reduction};
use burn::optim::{AdamConfig, GradientsParams, Optimizer};
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;

use crate::dataset::{SequenceBatcher, SequenceDataset};
use crate::recurrent::SequenceNet;
use crate::{CancelToken, ForecastError};

/// Configuration for training the sequence network.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingConfig {
    /// Learning rate for the optimizer.
    pub learning_rate: f64,
    /// Number of training epochs.
    pub epochs: usize,
    /// Batch size for training.
    pub batch_size: usize,
    /// Hidden units of the LSTM cell.
    pub hidden_size: usize,
    /// Minimum samples required to train.
    pub min_samples: usize,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            learning_rate: 1e-3,
            epochs: 20,
            batch_size: 64,
            hidden_size: 32,
            min_samples: 48,
        }
    }
}

/// Output from training.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrainingOutput {
    /// Mean batch loss of the last epoch.
    pub final_train_loss: f32,
    /// Number of epochs completed.
    pub epochs_completed: usize,
}

/// Trains the network on the provided dataset.
///
/// Uses a simple training loop with Adam optimizer and MSE loss. `cancel` is
/// checked before every epoch.
pub fn train_network<B: AutodiffBackend>(
    mut model: SequenceNet<B>,
    dataset: &SequenceDataset,
    config: &TrainingConfig,
    device: &B::Device,
    cancel: &CancelToken,
) -> Result<(SequenceNet<B>, TrainingOutput), ForecastError> {
    let batcher = SequenceBatcher::<B>::new(device.clone());
    let mut optimizer = AdamConfig::new().init();
    let loss_fn = MseLoss::new();
    let batch_size = config.batch_size.max(1);

    let mut final_train_loss = 0.0;

    for epoch in 0..config.epochs {
        cancel.check()?;
        let mut epoch_loss = 0.0;
        let mut batch_count = 0;

        let num_samples = dataset.len();
        let mut indices: Vec<usize> = (0..num_samples).collect();
        shuffle_indices(&mut indices, epoch as u64);

        for batch_start in (0..num_samples).step_by(batch_size) {
            let batch_end = (batch_start + batch_size).min(num_samples);
            let Some(batch_indices) = indices.get(batch_start..batch_end) else {
                continue;
            };

            let items: Vec<_> = batch_indices
                .iter()
                .filter_map(|&i| dataset.get(i))
                .collect();

            if items.is_empty() {
                continue;
            }

            let batch = batcher.batch(items);

            let predictions = model.forward(batch.history, batch.features);
            let loss = loss_fn.forward(predictions, batch.targets, Reduction::Mean);

            epoch_loss += f64::from(scalar(loss.clone()));
            batch_count += 1;

            let grads = loss.backward();
            let grads = GradientsParams::from_grads(grads, &model);
            model = optimizer.step(config.learning_rate, model, grads);
        }

        final_train_loss = if batch_count > 0 {
            (epoch_loss / f64::from(batch_count)) as f32
        } else {
            0.0
        };

        if epoch % 5 == 0 || epoch + 1 == config.epochs {
            tracing::debug!(
                epoch = epoch + 1,
                train_loss = final_train_loss,
                "Sequence training progress"
            );
        }
    }

    Ok((
        model,
        TrainingOutput {
            final_train_loss,
            epochs_completed: config.epochs,
        },
    ))
}

/// Reads the first element of a tensor as `f32`.
pub(crate) fn scalar<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> f32 {
    tensor
        .into_data()
        .to_vec::<f32>()
        .unwrap_or_else(|_| vec![0.0])
        .first()
        .copied()
        .unwrap_or(0.0)
}

/// Shuffles indices using a simple LCG-based shuffle.
fn shuffle_indices(indices: &mut [usize], seed: u64) {
    let mut rng_state = seed.wrapping_add(12345);

    for i in (1..indices.len()).rev() {
        rng_state = rng_state
            .wrapping_mul(6_364_136_223_846_793_005)
            .wrapping_add(1);
        let j = ((rng_state >> 33) as usize) % (i + 1);
        indices.swap(i, j);
    }
}
