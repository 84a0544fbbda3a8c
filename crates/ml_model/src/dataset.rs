//! Dataset and batching for Burn training of the sequence model.

use burn::prelude::*;
use feature_extractor::{FEATURE_COUNT, FeatureRow, HISTORY_HOURS, Sample, scale};

/// A single item in the sequence dataset.
///
/// The target is the scaled change from the last observed hour, so an
/// untrained network starts from a persistence forecast.
#[derive(Debug, Clone)]
pub struct SequenceItem {
    /// Scaled PM2.5 history, oldest first, `HISTORY_HOURS` long.
    pub history: Vec<f32>,
    /// Flattened row features.
    pub features: [f32; FEATURE_COUNT],
    /// Scaled change from the previous hour.
    pub target: f32,
}

impl SequenceItem {
    /// Builds an inference item; the target is unused.
    #[must_use]
    pub fn from_row(row: &FeatureRow) -> Self {
        let mut history = row.scaled_history();
        history.resize(HISTORY_HOURS, history.last().copied().unwrap_or_default());

        Self {
            history,
            features: row.to_array(),
            target: 0.0,
        }
    }
}

impl From<&Sample> for SequenceItem {
    fn from(sample: &Sample) -> Self {
        let mut item = Self::from_row(&sample.row);
        item.target = ((sample.target - sample.row.lag1()) / scale::PM25) as f32;
        item
    }
}

/// Converts a scaled network output back to PM2.5 for `row`.
#[must_use]
pub fn unscale_prediction(row: &FeatureRow, output: f32) -> f64 {
    f64::from(output).mul_add(scale::PM25, row.lag1()).max(0.0)
}

/// Dataset for sequence training.
#[derive(Debug, Clone)]
pub struct SequenceDataset {
    items: Vec<SequenceItem>,
}

impl SequenceDataset {
    /// Creates a dataset from a slice of training samples.
    #[must_use]
    pub fn from_slice(samples: &[Sample]) -> Self {
        let items = samples.iter().map(SequenceItem::from).collect();
        Self { items }
    }
}

impl burn::data::dataset::Dataset<SequenceItem> for SequenceDataset {
    fn get(&self, index: usize) -> Option<SequenceItem> {
        self.items.get(index).cloned()
    }

    fn len(&self) -> usize {
        self.items.len()
    }

    fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// A batch of sequence data.
#[derive(Debug, Clone)]
pub struct SequenceBatch<B: Backend> {
    /// History tensor of shape `[batch_size, HISTORY_HOURS, 1]`.
    pub history: Tensor<B, 3>,
    /// Row features of shape `[batch_size, FEATURE_COUNT]`.
    pub features: Tensor<B, 2>,
    /// Targets of shape `[batch_size, 1]`.
    pub targets: Tensor<B, 2>,
}

/// Batcher for creating sequence batches.
#[derive(Debug, Clone)]
pub struct SequenceBatcher<B: Backend> {
    device: B::Device,
}

impl<B: Backend> SequenceBatcher<B> {
    /// Creates a new batcher for the given device.
    #[must_use]
    pub const fn new(device: B::Device) -> Self {
        Self { device }
    }

    /// Creates a batch from a vector of items.
    pub fn batch(&self, items: Vec<SequenceItem>) -> SequenceBatch<B> {
        let batch_size = items.len();

        let mut history_data = Vec::with_capacity(batch_size * HISTORY_HOURS);
        let mut features_data = Vec::with_capacity(batch_size * FEATURE_COUNT);
        let mut targets_data = Vec::with_capacity(batch_size);

        for item in items {
            history_data.extend_from_slice(&item.history);
            features_data.extend_from_slice(&item.features);
            targets_data.push(item.target);
        }

        let history = Tensor::<B, 1>::from_floats(history_data.as_slice(), &self.device)
            .reshape([batch_size, HISTORY_HOURS, 1]);

        let features = Tensor::<B, 1>::from_floats(features_data.as_slice(), &self.device)
            .reshape([batch_size, FEATURE_COUNT]);

        let targets = Tensor::<B, 1>::from_floats(targets_data.as_slice(), &self.device)
            .reshape([batch_size, 1]);

        SequenceBatch {
            history,
            features,
            targets,
        }
    }
}

#[cfg(test)]
mod tests {
    use burn::backend::NdArray;
    use burn::data::dataset::Dataset;

    use super::*;
    use crate::test_support::synthetic_data;

    type TestBackend = NdArray;

    #[test]
    fn test_dataset_creation() {
        let data = synthetic_data(6);
        let dataset = SequenceDataset::from_slice(&data.samples);

        assert_eq!(dataset.len(), data.len());
        assert!(!dataset.is_empty());
        assert!(dataset.get(0).is_some());
        assert!(dataset.get(data.len()).is_none());
    }

    #[test]
    fn test_batcher() {
        let device = burn::backend::ndarray::NdArrayDevice::default();
        let batcher = SequenceBatcher::<TestBackend>::new(device);

        let data = synthetic_data(4);
        let items: Vec<_> = data.samples.iter().take(2).map(SequenceItem::from).collect();
        let batch = batcher.batch(items);

        assert_eq!(batch.history.dims(), [2, HISTORY_HOURS, 1]);
        assert_eq!(batch.features.dims(), [2, FEATURE_COUNT]);
        assert_eq!(batch.targets.dims(), [2, 1]);
    }

    #[test]
    fn test_target_is_change_from_last_hour() {
        let data = synthetic_data(3);
        let sample = &data.samples[0];
        let item = SequenceItem::from(sample);

        let restored = unscale_prediction(&sample.row, item.target);
        assert!((restored - sample.target).abs() < 1e-3);
    }
}
