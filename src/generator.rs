use crate::data::{CvaeBatch, CvaeBatcher, PredictionBatcher, SampleBatch};
use burn::data::dataloader::batcher::Batcher;
use burn::prelude::*;
use rand::seq::SliceRandom;
use rand::{rngs::StdRng, SeedableRng};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Disjoint training/validation rows.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SplitIndices {
    pub train: Vec<usize>,
    pub validation: Vec<usize>,
    /// False when the split left no validation rows; `validation` then holds a
    /// small placeholder set drawn from the training rows.
    pub validation_enabled: bool,
}

/// Randomly partition `0..total` with `floor(total * val_size)` validation rows.
pub fn split_indices(total: usize, val_size: f64, rng: &mut StdRng) -> SplitIndices {
    let val_num = (total as f64 * val_size).floor() as usize;
    let val_num = val_num.min(total);

    if val_num == 0 {
        log::warn!("validation split of {val_size} on {total} samples is empty, validation disabled");
        return SplitIndices {
            train: (0..total).collect(),
            validation: (0..total.min(2)).collect(),
            validation_enabled: false,
        };
    }

    let mut order: Vec<usize> = (0..total).collect();
    order.shuffle(rng);
    let mut validation = order[..val_num].to_vec();
    let mut train = order[val_num..].to_vec();
    validation.sort_unstable();
    train.sort_unstable();

    SplitIndices {
        train,
        validation,
        validation_enabled: true,
    }
}

/// Batch size, ordering and reset policy of one generator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BatchDescriptor {
    pub batch_size: usize,
    pub shuffle: bool,
    pub steps_per_epoch: usize,
    pub manual_reset: bool,
}

impl BatchDescriptor {
    pub fn new(batch_size: usize, steps_per_epoch: usize) -> Self {
        Self {
            batch_size,
            shuffle: false,
            steps_per_epoch,
            manual_reset: false,
        }
    }

    pub fn with_shuffle(mut self, shuffle: bool) -> Self {
        self.shuffle = shuffle;
        self
    }

    pub fn with_manual_reset(mut self, manual_reset: bool) -> Self {
        self.manual_reset = manual_reset;
        self
    }
}

/// Serves `(x, y, weight?)` batches over a subset of rows.
#[derive(Debug)]
pub struct BatchGenerator {
    batcher: CvaeBatcher,
    rows: Vec<usize>,
    order: Vec<usize>,
    descriptor: BatchDescriptor,
    rng: StdRng,
}

impl BatchGenerator {
    /// `rows` index into the batcher's arrays; `seed` fixes the shuffle stream.
    pub fn new(
        batcher: CvaeBatcher,
        rows: Vec<usize>,
        descriptor: BatchDescriptor,
        seed: Option<u64>,
    ) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let order = (0..rows.len()).collect();
        let mut generator = Self {
            batcher,
            rows,
            order,
            descriptor,
            rng,
        };
        generator.on_epoch_end();
        generator
    }

    /// Steps per epoch, regardless of any remainder rows.
    pub fn len(&self) -> usize {
        self.descriptor.steps_per_epoch
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn descriptor(&self) -> &BatchDescriptor {
        &self.descriptor
    }

    pub fn num_samples(&self) -> usize {
        self.rows.len()
    }

    /// Rows of batch `index`; short or empty past the end of the data.
    pub fn indices(&self, index: usize) -> Vec<usize> {
        let n = self.order.len();
        let start = index.saturating_mul(self.descriptor.batch_size).min(n);
        let end = (index + 1)
            .saturating_mul(self.descriptor.batch_size)
            .min(n);
        self.order[start..end]
            .iter()
            .map(|&pos| self.rows[pos])
            .collect()
    }

    /// Host arrays of batch `index`.
    pub fn get(&self, index: usize) -> SampleBatch {
        self.batcher.host_batch(&self.indices(index))
    }

    /// Device tensors of batch `index`, or `None` when the batch is empty.
    pub fn batch<B: Backend>(&self, index: usize, device: &B::Device) -> Option<CvaeBatch<B>> {
        let items = self.indices(index);
        if items.is_empty() {
            return None;
        }
        Some(Batcher::<B, usize, CvaeBatch<B>>::batch(
            &self.batcher,
            items,
            device,
        ))
    }

    /// Redraw the permutation when shuffling.
    pub fn on_epoch_end(&mut self) {
        if self.descriptor.shuffle {
            self.order.shuffle(&mut self.rng);
        }
    }

    /// End-of-epoch hook; manual-reset generators are reset by their owner.
    pub fn epoch_finished(&mut self) {
        if !self.descriptor.manual_reset {
            self.on_epoch_end();
        }
    }
}

/// Serves input-only batches in order, optionally reporting progress.
#[derive(Debug)]
pub struct PredictionBatchGenerator {
    batcher: PredictionBatcher,
    rows: Vec<usize>,
    batch_size: usize,
    steps_per_epoch: usize,
    progress: Option<Arc<AtomicUsize>>,
    last_index: Option<usize>,
}

impl PredictionBatchGenerator {
    pub fn new(
        batcher: PredictionBatcher,
        rows: Vec<usize>,
        batch_size: usize,
        steps_per_epoch: usize,
    ) -> Self {
        Self {
            batcher,
            rows,
            batch_size,
            steps_per_epoch,
            progress: None,
            last_index: None,
        }
    }

    /// Count served samples into `progress`.
    pub fn with_progress(mut self, progress: Arc<AtomicUsize>) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn len(&self) -> usize {
        self.steps_per_epoch
    }

    pub fn is_empty(&self) -> bool {
        self.steps_per_epoch == 0
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn indices(&self, index: usize) -> Vec<usize> {
        let n = self.rows.len();
        let start = index.saturating_mul(self.batch_size).min(n);
        let end = (index + 1).saturating_mul(self.batch_size).min(n);
        self.rows[start..end].to_vec()
    }

    /// Device inputs of batch `index`, or `None` when the batch is empty.
    pub fn batch<B: Backend>(&mut self, index: usize, device: &B::Device) -> Option<Tensor<B, 3>> {
        self.track(index);
        let items = self.indices(index);
        if items.is_empty() {
            return None;
        }
        Some(Batcher::<B, usize, Tensor<B, 3>>::batch(
            &self.batcher,
            items,
            device,
        ))
    }

    fn track(&mut self, index: usize) {
        let advanced = match self.last_index {
            Some(last) => index > last,
            None => true,
        };
        if !advanced {
            return;
        }
        self.last_index = Some(index);
        if let Some(progress) = &self.progress {
            progress.fetch_add(self.batch_size, Ordering::Relaxed);
        }
    }
}
