use crate::data::CvaeBatch;
use crate::metrics::{MetricTrackers, RegisteredMetric};
use crate::model::{compute_losses, CvaeLosses, CvaeNet, LossConfig};
use burn::module::Ignored;
use burn::optim::adaptor::OptimizerAdaptor;
use burn::optim::Adam;
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use burn::train::{InferenceStep, ItemLazy, TrainOutput, TrainStep};
use indexmap::IndexMap;
use std::sync::Arc;

pub type CvaeOptimizer<B> = OptimizerAdaptor<Adam, CvaeModel<B>, B>;

/// Computes the losses of one batch. Strategies installed on a [`crate::Cvae`]
/// run on the autodiff backend for training and on its inner backend for
/// validation and evaluation.
pub trait StepStrategy<B: Backend>: Send + Sync {
    fn name(&self) -> &str;

    /// Strategies returning `false` are replaced by [`DefaultStep`].
    fn is_implemented(&self) -> bool {
        true
    }

    fn losses(&self, network: &CvaeNet<B>, loss: &LossConfig, batch: CvaeBatch<B>)
        -> CvaeLosses<B>;
}

/// Reconstruction plus KL divergence through the sampled latent.
#[derive(Clone, Copy, Debug, Default)]
pub struct ElboStep;

impl<B: Backend> StepStrategy<B> for ElboStep {
    fn name(&self) -> &str {
        "elbo"
    }

    fn losses(
        &self,
        network: &CvaeNet<B>,
        loss: &LossConfig,
        batch: CvaeBatch<B>,
    ) -> CvaeLosses<B> {
        compute_losses(network, loss, batch)
    }
}

/// End-to-end reconstruction only; the KL term is reported as zero.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultStep;

impl<B: Backend> StepStrategy<B> for DefaultStep {
    fn name(&self) -> &str {
        "default"
    }

    fn losses(
        &self,
        network: &CvaeNet<B>,
        loss: &LossConfig,
        batch: CvaeBatch<B>,
    ) -> CvaeLosses<B> {
        let (_, predictions) = network.forward(batch.inputs);
        let reconstruction = loss.reconstruction.forward(
            batch.targets.clone(),
            predictions.clone(),
            batch.mask.clone(),
            batch.sample_weight,
        );
        let kl = Tensor::zeros([1], &predictions.device());
        CvaeLosses {
            total: reconstruction.clone(),
            reconstruction,
            kl,
            predictions,
            targets: batch.targets,
            mask: batch.mask,
        }
    }
}

/// One strategy seen from both the autodiff backend and its inner backend.
#[derive(Clone)]
pub struct SharedStep<B: AutodiffBackend> {
    train: Arc<dyn StepStrategy<B>>,
    eval: Arc<dyn StepStrategy<B::InnerBackend>>,
}

impl<B: AutodiffBackend> SharedStep<B> {
    pub fn new<S>(strategy: S) -> Self
    where
        S: StepStrategy<B> + StepStrategy<B::InnerBackend> + 'static,
    {
        let strategy = Arc::new(strategy);
        Self {
            train: strategy.clone(),
            eval: strategy,
        }
    }

    pub fn name(&self) -> &str {
        self.train.name()
    }

    /// Fall back to [`DefaultStep`] when the strategy is not implemented.
    pub fn resolve(self) -> Self {
        if self.train.is_implemented() {
            self
        } else {
            log::debug!("step `{}` not implemented, using default step", self.name());
            Self::new(DefaultStep)
        }
    }
}

/// Input of a train or inference step: the batch and the strategy scoring it.
pub struct StepInput<B: Backend> {
    pub batch: CvaeBatch<B>,
    pub strategy: Arc<dyn StepStrategy<B>>,
}

/// Scalar losses and registered metrics of one step.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StepOutput {
    pub batch_size: usize,
    pub loss: f64,
    pub reconstruction_loss: f64,
    pub kl_loss: f64,
    pub metrics: Vec<(RegisteredMetric, f64)>,
}

impl ItemLazy for StepOutput {
    type ItemSync = StepOutput;

    fn sync(self) -> Self::ItemSync {
        self
    }
}

/// The network with the loss settings it is optimized under.
#[derive(Module, Debug)]
pub struct CvaeModel<B: Backend> {
    pub network: CvaeNet<B>,
    loss: Ignored<LossConfig>,
    metrics: Ignored<Vec<RegisteredMetric>>,
}

impl<B: Backend> CvaeModel<B> {
    pub fn new(network: CvaeNet<B>, loss: LossConfig, metrics: &[RegisteredMetric]) -> Self {
        Self {
            network,
            loss: Ignored(loss),
            metrics: Ignored(metrics.to_vec()),
        }
    }

    pub fn into_network(self) -> CvaeNet<B> {
        self.network
    }

    fn summarize(&self, losses: &CvaeLosses<B>) -> StepOutput {
        let metrics = self
            .metrics
            .iter()
            .map(|&metric| {
                let value = metric.compute(
                    losses.targets.clone(),
                    losses.predictions.clone(),
                    losses.mask.clone(),
                );
                (metric, value)
            })
            .collect();
        StepOutput {
            batch_size: losses.targets.dims()[0],
            loss: losses.total.clone().into_scalar().elem::<f64>(),
            reconstruction_loss: losses.reconstruction.clone().into_scalar().elem::<f64>(),
            kl_loss: losses.kl.clone().into_scalar().elem::<f64>(),
            metrics,
        }
    }
}

impl<B: AutodiffBackend> TrainStep for CvaeModel<B> {
    type Input = StepInput<B>;
    type Output = StepOutput;

    fn step(&self, item: Self::Input) -> TrainOutput<Self::Output> {
        let losses = item.strategy.losses(&self.network, &self.loss, item.batch);
        let output = self.summarize(&losses);
        TrainOutput::new(self, losses.total.backward(), output)
    }
}

impl<B: Backend> InferenceStep for CvaeModel<B> {
    type Input = StepInput<B>;
    type Output = StepOutput;

    fn step(&self, item: Self::Input) -> Self::Output {
        let losses = item.strategy.losses(&self.network, &self.loss, item.batch);
        self.summarize(&losses)
    }
}

/// Drives train and inference steps with the installed strategy and keeps
/// the metric trackers.
pub struct StepEngine<B: AutodiffBackend> {
    strategy: SharedStep<B>,
    loss: LossConfig,
    metrics: Vec<RegisteredMetric>,
    optimizer: CvaeOptimizer<B>,
    trackers: MetricTrackers,
}

impl<B: AutodiffBackend> StepEngine<B> {
    pub fn new(
        strategy: SharedStep<B>,
        loss: LossConfig,
        optimizer: CvaeOptimizer<B>,
        metrics: &[RegisteredMetric],
    ) -> Self {
        Self {
            strategy: strategy.resolve(),
            loss,
            metrics: metrics.to_vec(),
            optimizer,
            trackers: MetricTrackers::new(metrics),
        }
    }

    pub fn strategy_name(&self) -> &str {
        self.strategy.name()
    }

    pub fn loss_config(&self) -> &LossConfig {
        &self.loss
    }

    /// Wrap `network` with this engine's loss settings.
    pub fn model<M: Backend>(&self, network: CvaeNet<M>) -> CvaeModel<M> {
        CvaeModel::new(network, self.loss.clone(), &self.metrics)
    }

    /// One optimizer update on `batch`; returns the updated model and the
    /// running tracker values.
    pub fn train_step(
        &mut self,
        model: CvaeModel<B>,
        batch: CvaeBatch<B>,
        lr: f64,
    ) -> (CvaeModel<B>, IndexMap<String, f64>) {
        let input = StepInput {
            batch,
            strategy: self.strategy.train.clone(),
        };
        let output = TrainStep::step(&model, input);
        self.record(&output.item);
        let model = model.optimize::<B, _>(&mut self.optimizer, lr, output.grads);
        (model, self.trackers.results())
    }

    /// Loss and metrics without any update.
    pub fn eval_step(
        &mut self,
        model: &CvaeModel<B::InnerBackend>,
        batch: CvaeBatch<B::InnerBackend>,
    ) -> IndexMap<String, f64> {
        let input = StepInput {
            batch,
            strategy: self.strategy.eval.clone(),
        };
        let output = InferenceStep::step(model, input);
        self.record(&output);
        self.trackers.results()
    }

    pub fn results(&self) -> IndexMap<String, f64> {
        self.trackers.results()
    }

    pub fn reset_trackers(&mut self) {
        self.trackers.reset();
    }

    fn record(&mut self, output: &StepOutput) {
        self.trackers
            .update_losses(output.loss, output.reconstruction_loss, output.kl_loss);
        for &(metric, value) in &output.metrics {
            self.trackers.update_metric(metric, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{CvaeBatcher, INPUT_NAME, MAGIC_NUMBER, OUTPUT_NAME};
    use crate::metrics::{KL_LOSS, LOSS, RECONSTRUCTION_LOSS};
    use crate::model::{ModelConfig, ModelShapes};
    use burn::backend::{Autodiff, NdArray};
    use burn::data::dataloader::batcher::Batcher;
    use burn::module::AutodiffModule;
    use burn::optim::AdamConfig;
    use ndarray::{Array, IxDyn};

    type TestBackend = Autodiff<NdArray<f32>>;

    struct Unfinished;

    impl<B: Backend> StepStrategy<B> for Unfinished {
        fn name(&self) -> &str {
            "unfinished"
        }

        fn is_implemented(&self) -> bool {
            false
        }

        fn losses(
            &self,
            network: &CvaeNet<B>,
            loss: &LossConfig,
            batch: CvaeBatch<B>,
        ) -> CvaeLosses<B> {
            compute_losses(network, loss, batch)
        }
    }

    fn net(device: &<TestBackend as Backend>::Device) -> CvaeNet<TestBackend> {
        let mut shapes = ModelShapes::default();
        shapes.input.insert(INPUT_NAME.to_string(), vec![24, 1]);
        shapes.labels.insert(OUTPUT_NAME.to_string(), vec![24, 1]);
        let (encoder, decoder) = ModelConfig::new()
            .with_num_hidden(vec![8, 4])
            .with_filter_len(4)
            .init::<TestBackend>(&shapes, device)
            .unwrap();
        CvaeNet::new(encoder, decoder)
    }

    fn batch<B: Backend>(device: &B::Device) -> CvaeBatch<B> {
        let data = Array::from_shape_fn(IxDyn(&[4, 24, 1]), |idx| (idx[1] as f32 * 0.1).sin());
        let mut targets = data.clone();
        targets[[0, 3, 0]] = MAGIC_NUMBER;
        let batcher = CvaeBatcher::new(data.into(), targets.into(), None);
        batcher.batch(vec![0, 1, 2, 3], device)
    }

    fn engine(strategy: SharedStep<TestBackend>) -> StepEngine<TestBackend> {
        StepEngine::new(
            strategy,
            LossConfig::new(),
            AdamConfig::new().init::<TestBackend, CvaeModel<TestBackend>>(),
            &[RegisteredMetric::MeanAbsoluteError],
        )
    }

    #[test]
    fn unimplemented_strategy_falls_back_to_default() {
        let engine = engine(SharedStep::new(Unfinished));
        assert_eq!(engine.strategy_name(), "default");
    }

    #[test]
    fn default_step_reports_zero_kl() {
        let device = Default::default();
        let mut engine = engine(SharedStep::new(DefaultStep));
        let model = engine.model(net(&device).valid());

        let metrics = engine.eval_step(&model, batch(&device));
        assert_eq!(metrics[KL_LOSS], 0.0);
        assert_eq!(metrics[LOSS], metrics[RECONSTRUCTION_LOSS]);
    }

    #[test]
    fn train_step_output_carries_gradients_and_scores() {
        let device = Default::default();
        let model = CvaeModel::new(
            net(&device),
            LossConfig::new(),
            &[RegisteredMetric::MeanError],
        );
        let input = StepInput {
            batch: batch::<TestBackend>(&device),
            strategy: Arc::new(ElboStep),
        };

        let output = TrainStep::step(&model, input);
        assert_eq!(output.item.batch_size, 4);
        assert!(output.item.loss.is_finite());
        assert!(output.item.kl_loss >= 0.0);
        assert_eq!(output.item.metrics.len(), 1);
        assert_eq!(output.item.metrics[0].0, RegisteredMetric::MeanError);
    }

    #[test]
    fn inference_step_scores_on_the_inner_backend() {
        let device = Default::default();
        let model = CvaeModel::new(net(&device), LossConfig::new(), &[]).valid();
        let input = StepInput {
            batch: batch::<NdArray<f32>>(&device),
            strategy: Arc::new(DefaultStep),
        };

        let output = InferenceStep::step(&model, input);
        assert_eq!(output.kl_loss, 0.0);
        assert_eq!(output.loss, output.reconstruction_loss);
        assert!(output.metrics.is_empty());
    }

    #[test]
    fn train_step_updates_weights_and_trackers() {
        let device = Default::default();
        let mut engine = engine(SharedStep::new(ElboStep));
        let model = engine.model(net(&device));
        let before = model.valid();

        let (model, metrics) = engine.train_step(model, batch(&device), 1e-2);
        assert!(metrics[LOSS].is_finite());
        assert!(metrics[KL_LOSS] >= 0.0);
        assert!(metrics.contains_key("mean_absolute_error"));

        let x = batch::<NdArray<f32>>(&device).inputs;
        let eps = Tensor::zeros([4, 2], &device);
        let (_, old) = before.network.forward_with_noise(x.clone(), eps.clone());
        let (_, new) = model.valid().network.forward_with_noise(x, eps);
        assert_ne!(old.into_data(), new.into_data());
    }

    #[test]
    fn trackers_average_until_reset() {
        let device = Default::default();
        let mut engine = engine(SharedStep::new(ElboStep));
        let model = engine.model(net(&device).valid());

        let first = engine.eval_step(&model, batch(&device));
        let second = engine.eval_step(&model, batch(&device));
        assert!(first[RECONSTRUCTION_LOSS].is_finite());
        assert!(second[RECONSTRUCTION_LOSS].is_finite());
        assert_eq!(
            first.keys().collect::<Vec<_>>(),
            second.keys().collect::<Vec<_>>()
        );

        engine.reset_trackers();
        assert_eq!(engine.results()[LOSS], 0.0);
    }
}
