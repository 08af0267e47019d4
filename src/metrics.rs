use burn::prelude::*;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;

pub const LOSS: &str = "loss";
pub const RECONSTRUCTION_LOSS: &str = "reconstruction_loss";
pub const KL_LOSS: &str = "kl_loss";

/// Running unweighted mean of per-step values.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MeanTracker {
    name: String,
    total: f64,
    count: usize,
}

impl MeanTracker {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            total: 0.0,
            count: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn update_state(&mut self, value: f64) {
        self.total += value;
        self.count += 1;
    }

    pub fn result(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.total / self.count as f64
        }
    }

    pub fn reset_state(&mut self) {
        self.total = 0.0;
        self.count = 0;
    }
}

/// Masked metrics that may be scored alongside the loss terms.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegisteredMetric {
    MeanAbsoluteError,
    MeanError,
}

impl RegisteredMetric {
    pub fn name(&self) -> &'static str {
        match self {
            RegisteredMetric::MeanAbsoluteError => "mean_absolute_error",
            RegisteredMetric::MeanError => "mean_error",
        }
    }

    /// Score `predictions` against `targets` over entries where `mask` is set.
    pub fn compute<B: Backend>(
        &self,
        targets: Tensor<B, 3>,
        predictions: Tensor<B, 3>,
        mask: Tensor<B, 3>,
    ) -> f64 {
        let diff = predictions - targets;
        let diff = match self {
            RegisteredMetric::MeanAbsoluteError => diff.abs(),
            RegisteredMetric::MeanError => diff,
        };
        let missing = mask.clone().equal_elem(0.0);
        let sum = diff.mask_fill(missing, 0.0).sum().into_scalar().elem::<f64>();
        let valid = mask.sum().into_scalar().elem::<f64>().max(1.0);
        sum / valid
    }
}

impl fmt::Display for RegisteredMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The three loss trackers followed by one tracker per registered metric.
#[derive(Clone, Debug)]
pub struct MetricTrackers {
    loss: MeanTracker,
    reconstruction: MeanTracker,
    kl: MeanTracker,
    extra: Vec<(RegisteredMetric, MeanTracker)>,
}

impl MetricTrackers {
    pub fn new(metrics: &[RegisteredMetric]) -> Self {
        Self {
            loss: MeanTracker::new(LOSS),
            reconstruction: MeanTracker::new(RECONSTRUCTION_LOSS),
            kl: MeanTracker::new(KL_LOSS),
            extra: metrics
                .iter()
                .map(|&metric| (metric, MeanTracker::new(metric.name())))
                .collect(),
        }
    }

    pub fn registered(&self) -> impl Iterator<Item = RegisteredMetric> + '_ {
        self.extra.iter().map(|(metric, _)| *metric)
    }

    pub fn update_losses(&mut self, total: f64, reconstruction: f64, kl: f64) {
        self.loss.update_state(total);
        self.reconstruction.update_state(reconstruction);
        self.kl.update_state(kl);
    }

    pub fn update_metric(&mut self, metric: RegisteredMetric, value: f64) {
        if let Some((_, tracker)) = self.extra.iter_mut().find(|(m, _)| *m == metric) {
            tracker.update_state(value);
        }
    }

    /// Current means keyed by tracker name.
    pub fn results(&self) -> IndexMap<String, f64> {
        self.trackers()
            .map(|tracker| (tracker.name().to_string(), tracker.result()))
            .collect()
    }

    pub fn reset(&mut self) {
        self.loss.reset_state();
        self.reconstruction.reset_state();
        self.kl.reset_state();
        for (_, tracker) in &mut self.extra {
            tracker.reset_state();
        }
    }

    fn trackers(&self) -> impl Iterator<Item = &MeanTracker> {
        [&self.loss, &self.reconstruction, &self.kl]
            .into_iter()
            .chain(self.extra.iter().map(|(_, tracker)| tracker))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::MAGIC_NUMBER;
    use burn::backend::NdArray;
    use burn::tensor::TensorData;

    type TestBackend = NdArray<f32>;

    fn tensor3(values: Vec<f32>) -> Tensor<TestBackend, 3> {
        let len = values.len();
        Tensor::from_data(TensorData::new(values, [1, len, 1]), &Default::default())
    }

    #[test]
    fn mean_tracker_averages_steps_and_resets() {
        let mut tracker = MeanTracker::new(LOSS);
        assert_eq!(tracker.result(), 0.0);
        tracker.update_state(1.0);
        tracker.update_state(3.0);
        assert_eq!(tracker.result(), 2.0);
        tracker.reset_state();
        assert_eq!(tracker.result(), 0.0);
    }

    #[test]
    fn results_keep_tracker_order() {
        let mut trackers = MetricTrackers::new(&[RegisteredMetric::MeanError]);
        trackers.update_losses(3.0, 2.0, 1.0);
        trackers.update_metric(RegisteredMetric::MeanError, -0.5);

        let results = trackers.results();
        let names: Vec<&str> = results.keys().map(String::as_str).collect();
        assert_eq!(names, vec![LOSS, RECONSTRUCTION_LOSS, KL_LOSS, "mean_error"]);
        assert_eq!(results["mean_error"], -0.5);
    }

    #[test]
    fn masked_metrics_skip_sentinels() {
        let targets = tensor3(vec![1.0, MAGIC_NUMBER, 2.0]);
        let predictions = tensor3(vec![2.0, 0.0, 1.0]);
        let mask = tensor3(vec![1.0, 0.0, 1.0]);

        let mae = RegisteredMetric::MeanAbsoluteError
            .compute(targets.clone(), predictions.clone(), mask.clone());
        let me = RegisteredMetric::MeanError.compute(targets, predictions, mask);
        assert!((mae - 1.0).abs() < 1e-6);
        assert!(me.abs() < 1e-6);
    }
}
