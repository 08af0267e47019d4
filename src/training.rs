use crate::callbacks::{Callback, Logs, ReduceLrOnPlateau, TrainingContext, VirtualCsvLogger};
use crate::data::{CvaeBatcher, NamedArrays, INPUT_NAME, OUTPUT_NAME};
use crate::error::{CvaeError, Result};
use crate::generator::{split_indices, BatchDescriptor, BatchGenerator};
use crate::metrics::{RegisteredMetric, LOSS};
use crate::model::{CvaeNet, LossConfig, ModelConfig, ModelShapes};
use crate::normalizer::{NormMode, NormalizationStatistics, Normalizer};
use crate::step::{CvaeModel, CvaeOptimizer, ElboStep, SharedStep, StepEngine, StepStrategy};
use burn::config::Config;
use burn::module::AutodiffModule;
use burn::optim::AdamConfig;
use burn::tensor::backend::AutodiffBackend;
use indexmap::IndexMap;
use ndarray::{Array1, ArrayD};
use rand::{rngs::StdRng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

/// Kind of problem the network is trained for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Task {
    Regression,
    Classification,
    BinaryClassification,
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Task::Regression => "regression",
            Task::Classification => "classification",
            Task::BinaryClassification => "binary classification",
        };
        f.write_str(name)
    }
}

/// Training, normalization and persistence settings, saved as `config.json`.
#[derive(Config, Debug)]
pub struct CvaeConfig {
    #[config(default = "ModelConfig::new()")]
    pub model: ModelConfig,
    #[config(default = "LossConfig::new()")]
    pub loss: LossConfig,
    #[config(default = "Task::Regression")]
    pub task: Task,
    #[config(default = 64)]
    pub batch_size: usize,
    #[config(default = 100)]
    pub max_epochs: usize,
    #[config(default = 0.0005)]
    pub learning_rate: f64,
    #[config(default = 0.9)]
    pub beta_1: f64,
    #[config(default = 0.999)]
    pub beta_2: f64,
    #[config(default = 1e-7)]
    pub optimizer_epsilon: f64,
    #[config(default = 0.1)]
    pub val_size: f64,
    #[config(default = 4)]
    pub reduce_lr_patience: usize,
    #[config(default = 0.0005)]
    pub reduce_lr_epsilon: f64,
    #[config(default = 1e-8)]
    pub reduce_lr_min: f64,
    #[config(default = "NormMode::Image")]
    pub input_norm_mode: NormMode,
    #[config(default = "NormMode::Image")]
    pub labels_norm_mode: NormMode,
    #[config(default = "Vec::new()")]
    pub metrics: Vec<RegisteredMetric>,
    /// Seeds weight init, the split and batch shuffling; entropy when unset.
    #[config(default = "None")]
    pub seed: Option<u64>,
    /// Seeds the latent noise drawn at inference.
    #[config(default = 42)]
    pub inference_seed: u64,
    #[config(default = false)]
    pub autosave: bool,
    /// Where `fit` saves when `autosave` is on.
    #[config(default = "None")]
    pub model_dir: Option<String>,
}

/// Convolutional variational autoencoder with its normalization state.
pub struct Cvae<B: AutodiffBackend> {
    pub(crate) config: CvaeConfig,
    pub(crate) device: B::Device,
    pub(crate) network: Option<CvaeNet<B>>,
    pub(crate) engine: Option<StepEngine<B>>,
    pub(crate) shapes: Option<ModelShapes>,
    pub(crate) input_normalizer: Option<Normalizer>,
    pub(crate) labels_normalizer: Option<Normalizer>,
    /// Statistics restored without a normalizer, applied as-is.
    pub(crate) input_stats: Option<NormalizationStatistics>,
    pub(crate) labels_stats: Option<NormalizationStatistics>,
    pub(crate) history: VirtualCsvLogger,
    callbacks: Vec<Box<dyn Callback>>,
    strategy: SharedStep<B>,
    learning_rate: f64,
}

impl<B: AutodiffBackend> Cvae<B> {
    pub fn new(config: CvaeConfig, device: B::Device) -> Self {
        let learning_rate = config.learning_rate;
        Self {
            config,
            device,
            network: None,
            engine: None,
            shapes: None,
            input_normalizer: None,
            labels_normalizer: None,
            input_stats: None,
            labels_stats: None,
            history: VirtualCsvLogger::new(),
            callbacks: Vec::new(),
            strategy: SharedStep::new(ElboStep),
            learning_rate,
        }
    }

    /// Run `callback` after the built-in callbacks at every epoch end.
    pub fn with_callback(mut self, callback: impl Callback + 'static) -> Self {
        self.callbacks.push(Box::new(callback));
        self
    }

    /// Step logic installed by the next compile.
    pub fn with_step_strategy<S>(mut self, strategy: S) -> Self
    where
        S: StepStrategy<B> + StepStrategy<B::InnerBackend> + 'static,
    {
        self.strategy = SharedStep::new(strategy);
        self
    }

    pub fn config(&self) -> &CvaeConfig {
        &self.config
    }

    pub fn device(&self) -> &B::Device {
        &self.device
    }

    pub fn has_model(&self) -> bool {
        self.network.is_some()
    }

    pub fn network(&self) -> Option<&CvaeNet<B>> {
        self.network.as_ref()
    }

    pub fn shapes(&self) -> Option<&ModelShapes> {
        self.shapes.as_ref()
    }

    pub fn history(&self) -> &VirtualCsvLogger {
        &self.history
    }

    /// Learning rate after any plateau reductions.
    pub fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    pub fn step_name(&self) -> Option<&str> {
        self.engine.as_ref().map(StepEngine::strategy_name)
    }

    /// Input statistics, from the normalizer or restored from disk.
    pub fn input_statistics(&self) -> Option<&NormalizationStatistics> {
        self.input_normalizer
            .as_ref()
            .and_then(Normalizer::statistics)
            .or(self.input_stats.as_ref())
    }

    pub fn labels_statistics(&self) -> Option<&NormalizationStatistics> {
        self.labels_normalizer
            .as_ref()
            .and_then(Normalizer::statistics)
            .or(self.labels_stats.as_ref())
    }

    /// Build the network for `shapes`, install the step strategy and reset the
    /// trackers. Adam from the config is used unless `optimizer` is given.
    pub fn compile(
        &mut self,
        shapes: ModelShapes,
        optimizer: Option<CvaeOptimizer<B>>,
    ) -> Result<()> {
        if let Some(seed) = self.config.seed {
            B::seed(&self.device, seed);
        }
        let (encoder, decoder) = self.config.model.init::<B>(&shapes, &self.device)?;
        let optimizer = optimizer.unwrap_or_else(|| {
            AdamConfig::new()
                .with_beta_1(self.config.beta_1 as f32)
                .with_beta_2(self.config.beta_2 as f32)
                .with_epsilon(self.config.optimizer_epsilon as f32)
                .init::<B, CvaeModel<B>>()
        });
        let engine = StepEngine::new(
            self.strategy.clone(),
            self.config.loss.clone(),
            optimizer,
            &self.config.metrics,
        );

        log::info!(
            "compiled CVAE: input {:?}, output {:?}, latent {}, step `{}`",
            shapes.input,
            shapes.labels,
            self.config.model.latent_dim,
            engine.strategy_name()
        );
        self.network = Some(CvaeNet::new(encoder, decoder));
        self.engine = Some(engine);
        self.shapes = Some(shapes);
        self.learning_rate = self.config.learning_rate;
        Ok(())
    }

    /// Train on `inputs` reconstructing `targets` for `max_epochs`.
    pub fn fit(
        &mut self,
        inputs: ArrayD<f32>,
        targets: ArrayD<f32>,
        sample_weight: Option<Array1<f32>>,
    ) -> Result<()> {
        self.fit_named(
            NamedArrays::single(INPUT_NAME, inputs),
            NamedArrays::single(OUTPUT_NAME, targets),
            sample_weight,
        )
    }

    /// [`Cvae::fit`] on named bundles; keys the network does not use are dropped.
    pub fn fit_named(
        &mut self,
        inputs: NamedArrays,
        targets: NamedArrays,
        sample_weight: Option<Array1<f32>>,
    ) -> Result<()> {
        self.check_task()?;
        let (inputs, targets, total) = self.prepare(inputs, targets, sample_weight.as_ref())?;
        self.ensure_compiled(&inputs, &targets)?;

        let mut rng = match self.config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let split = split_indices(total, self.config.val_size, &mut rng);
        let batcher = batcher(inputs, targets, sample_weight)?;

        let batch_size = self.config.batch_size.max(1);
        let train_steps = (split.train.len() / batch_size).max(1);
        let mut training = BatchGenerator::new(
            batcher.clone(),
            split.train,
            BatchDescriptor::new(batch_size, train_steps).with_shuffle(true),
            self.config.seed,
        );
        let mut validation = if split.validation_enabled {
            let val_len = split.validation.len();
            let descriptor = BatchDescriptor::new(batch_size.min(val_len), (val_len / batch_size).max(1))
                .with_shuffle(true)
                .with_manual_reset(true);
            Some(BatchGenerator::new(
                batcher,
                split.validation,
                descriptor,
                self.config.seed.map(|seed| seed.wrapping_add(1)),
            ))
        } else {
            None
        };

        log::info!(
            "training on {} samples, validating on {}",
            training.num_samples(),
            validation.as_ref().map_or(0, BatchGenerator::num_samples)
        );
        let start = Instant::now();
        self.history.clear();
        self.run_epochs(&mut training, validation.as_mut(), self.config.max_epochs, true)?;
        log::info!(
            "completed training, {:.2}s in total",
            start.elapsed().as_secs_f64()
        );

        if self.config.autosave {
            let dir = self.model_dir();
            self.save(&dir)?;
        }
        Ok(())
    }

    /// One epoch with every sample in a single unshuffled batch; for fine-tuning.
    pub fn fit_on_batch(
        &mut self,
        inputs: ArrayD<f32>,
        targets: ArrayD<f32>,
        sample_weight: Option<Array1<f32>>,
    ) -> Result<()> {
        self.check_task()?;
        let (inputs, targets, total) = self.prepare(
            NamedArrays::single(INPUT_NAME, inputs),
            NamedArrays::single(OUTPUT_NAME, targets),
            sample_weight.as_ref(),
        )?;
        self.ensure_compiled(&inputs, &targets)?;

        let mut generator = BatchGenerator::new(
            batcher(inputs, targets, sample_weight)?,
            (0..total).collect(),
            BatchDescriptor::new(total, 1),
            self.config.seed,
        );
        let start = Instant::now();
        self.run_epochs(&mut generator, None, 1, false)?;
        log::info!(
            "completed training on batch, {:.2}s in total",
            start.elapsed().as_secs_f64()
        );
        Ok(())
    }

    /// Loss terms and metrics of the network on `inputs`/`targets`.
    pub fn evaluate(
        &mut self,
        inputs: ArrayD<f32>,
        targets: ArrayD<f32>,
    ) -> Result<IndexMap<String, f64>> {
        if self.network.is_none() {
            return Err(CvaeError::NoModel);
        }
        let (inputs, targets, total) = self.prepare(
            NamedArrays::single(INPUT_NAME, inputs),
            NamedArrays::single(OUTPUT_NAME, targets),
            None,
        )?;
        if let Some(shapes) = &self.shapes {
            inputs.check_shapes(&shapes.input)?;
            targets.check_shapes(&shapes.labels)?;
        }

        let generator = BatchGenerator::new(
            batcher(inputs, targets, None)?,
            (0..total).collect(),
            evaluation_descriptor(self.config.batch_size, total),
            None,
        );

        let start = Instant::now();
        log::info!("starting evaluation");
        let network = self.network.as_ref().ok_or(CvaeError::NoModel)?.valid();
        let engine = self.engine.as_mut().ok_or(CvaeError::NoModel)?;
        let model = engine.model(network);
        engine.reset_trackers();
        for step in 0..generator.len() {
            if let Some(batch) = generator.batch::<B::InnerBackend>(step, &self.device) {
                engine.eval_step(&model, batch);
            }
        }
        let scores = engine.results();
        engine.reset_trackers();
        log::info!(
            "completed evaluation, {:.2}s elapsed",
            start.elapsed().as_secs_f64()
        );
        Ok(scores)
    }

    #[deprecated(note = "use `fit`")]
    pub fn train(
        &mut self,
        inputs: ArrayD<f32>,
        targets: ArrayD<f32>,
        sample_weight: Option<Array1<f32>>,
    ) -> Result<()> {
        self.fit(inputs, targets, sample_weight)
    }

    #[deprecated(note = "use `fit_on_batch`")]
    pub fn train_on_batch(
        &mut self,
        inputs: ArrayD<f32>,
        targets: ArrayD<f32>,
        sample_weight: Option<Array1<f32>>,
    ) -> Result<()> {
        self.fit_on_batch(inputs, targets, sample_weight)
    }

    fn check_task(&self) -> Result<()> {
        match self.config.task {
            Task::Regression => Ok(()),
            task => Err(CvaeError::UnsupportedTask(task)),
        }
    }

    fn model_dir(&self) -> PathBuf {
        match &self.config.model_dir {
            Some(dir) => PathBuf::from(dir),
            None => PathBuf::from(format!(
                "cvae_model_{}",
                std::time::SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)
                    .map_or(0, |elapsed| elapsed.as_secs())
            )),
        }
    }

    /// Sanitize, shape and normalize a training pair; computes the statistics
    /// on first use and reuses them afterwards.
    fn prepare(
        &mut self,
        inputs: NamedArrays,
        targets: NamedArrays,
        sample_weight: Option<&Array1<f32>>,
    ) -> Result<(NamedArrays, NamedArrays, usize)> {
        let inputs = inputs
            .sanitize(CvaeNet::<B>::input_names())?
            .with_channel_axis();
        let targets = targets
            .sanitize(CvaeNet::<B>::output_names())?
            .with_channel_axis();
        inputs.check_rank3()?;
        targets.check_rank3()?;

        let total = inputs.sample_count()?;
        if total == 0 {
            return Err(CvaeError::EmptyInput);
        }
        let found = targets.sample_count()?;
        if found != total {
            return Err(CvaeError::SampleCountMismatch {
                name: OUTPUT_NAME.to_string(),
                expected: total,
                found,
            });
        }
        if let Some(weights) = sample_weight {
            if weights.len() != total {
                return Err(CvaeError::SampleCountMismatch {
                    name: "sample_weight".to_string(),
                    expected: total,
                    found: weights.len(),
                });
            }
        }

        let fresh = self.input_normalizer.is_none() && self.input_stats.is_none();
        if fresh {
            let mut input_normalizer = Normalizer::new(self.config.input_norm_mode);
            let mut labels_normalizer = Normalizer::new(self.config.labels_norm_mode);
            let inputs = input_normalizer.normalize(inputs, true)?;
            let targets = labels_normalizer.normalize(targets, true)?;
            self.input_normalizer = Some(input_normalizer);
            self.labels_normalizer = Some(labels_normalizer);
            return Ok((inputs, targets, total));
        }
        let inputs = self.normalize_inputs(inputs)?;
        let targets = self.normalize_labels(targets)?;
        Ok((inputs, targets, total))
    }

    pub(crate) fn normalize_inputs(&mut self, data: NamedArrays) -> Result<NamedArrays> {
        match &mut self.input_normalizer {
            Some(normalizer) => normalizer.normalize(data, false),
            None => self
                .input_stats
                .as_ref()
                .ok_or_else(|| CvaeError::MissingStatistics(INPUT_NAME.to_string()))?
                .normalize(data),
        }
    }

    pub(crate) fn normalize_labels(&mut self, data: NamedArrays) -> Result<NamedArrays> {
        match &mut self.labels_normalizer {
            Some(normalizer) => normalizer.normalize(data, false),
            None => self
                .labels_stats
                .as_ref()
                .ok_or_else(|| CvaeError::MissingStatistics(OUTPUT_NAME.to_string()))?
                .normalize(data),
        }
    }

    pub(crate) fn denormalize_labels(&self, data: NamedArrays) -> Result<NamedArrays> {
        match &self.labels_normalizer {
            Some(normalizer) => normalizer.denormalize(data),
            None => self
                .labels_stats
                .as_ref()
                .ok_or_else(|| CvaeError::MissingStatistics(OUTPUT_NAME.to_string()))?
                .denormalize(data),
        }
    }

    fn ensure_compiled(&mut self, inputs: &NamedArrays, targets: &NamedArrays) -> Result<()> {
        match &self.shapes {
            Some(shapes) if self.network.is_some() => {
                inputs.check_shapes(&shapes.input)?;
                targets.check_shapes(&shapes.labels)
            }
            _ => self.compile(ModelShapes::from_data(inputs, targets), None),
        }
    }

    fn run_epochs(
        &mut self,
        training: &mut BatchGenerator,
        mut validation: Option<&mut BatchGenerator>,
        epochs: usize,
        with_callbacks: bool,
    ) -> Result<()> {
        let engine = self.engine.as_mut().ok_or(CvaeError::NoModel)?;
        let mut model = engine.model(self.network.take().ok_or(CvaeError::NoModel)?);

        let mut ctx = TrainingContext::new(self.learning_rate);
        let mut reduce_lr = ReduceLrOnPlateau::new(
            LOSS,
            0.5,
            self.config.reduce_lr_epsilon,
            self.config.reduce_lr_patience,
            self.config.reduce_lr_min,
        );
        if with_callbacks {
            reduce_lr.on_train_begin(&mut ctx);
            self.history.on_train_begin(&mut ctx);
            for callback in &mut self.callbacks {
                callback.on_train_begin(&mut ctx);
            }
        }

        for epoch in 0..epochs {
            engine.reset_trackers();
            for step in 0..training.len() {
                let batch = match training.batch::<B>(step, &self.device) {
                    Some(batch) => batch,
                    None => continue,
                };
                let (updated, metrics) = engine.train_step(model, batch, ctx.learning_rate);
                model = updated;
                log::debug!(
                    "epoch {} step {}/{}: loss {:.5}",
                    epoch + 1,
                    step + 1,
                    training.len(),
                    metrics.get(LOSS).copied().unwrap_or_default()
                );
            }
            training.epoch_finished();
            let mut logs: Logs = engine.results();

            if let Some(validation) = validation.as_deref_mut() {
                engine.reset_trackers();
                let valid = model.valid();
                for step in 0..validation.len() {
                    if let Some(batch) = validation.batch::<B::InnerBackend>(step, &self.device) {
                        engine.eval_step(&valid, batch);
                    }
                }
                for (name, value) in engine.results() {
                    logs.insert(format!("val_{name}"), value);
                }
                validation.on_epoch_end();
            }
            engine.reset_trackers();

            log::info!("epoch {}/{}: {}", epoch + 1, epochs, format_logs(&logs));
            if with_callbacks {
                reduce_lr.on_epoch_end(epoch, &logs, &mut ctx);
                self.history.on_epoch_end(epoch, &logs, &mut ctx);
                for callback in &mut self.callbacks {
                    callback.on_epoch_end(epoch, &logs, &mut ctx);
                }
                if ctx.stop_training {
                    log::info!("stopping early after epoch {}", epoch + 1);
                    break;
                }
            }
        }

        if with_callbacks {
            for callback in &mut self.callbacks {
                callback.on_train_end(&mut ctx);
            }
        }
        self.learning_rate = ctx.learning_rate;
        self.network = Some(model.into_network());
        Ok(())
    }
}

fn batcher(
    mut inputs: NamedArrays,
    mut targets: NamedArrays,
    sample_weight: Option<Array1<f32>>,
) -> Result<CvaeBatcher> {
    Ok(CvaeBatcher::new(
        Arc::new(inputs.take(INPUT_NAME)?),
        Arc::new(targets.take(OUTPUT_NAME)?),
        sample_weight.map(Arc::new),
    ))
}

/// Evaluation serves `max(1, total / batch_size)` batches of
/// `min(batch_size, total)` rows; a remainder past the last full batch is not
/// scored.
fn evaluation_descriptor(batch_size: usize, total: usize) -> BatchDescriptor {
    let batch_size = batch_size.max(1);
    BatchDescriptor::new(batch_size.min(total), (total / batch_size).max(1))
}

fn format_logs(logs: &Logs) -> String {
    logs.iter()
        .map(|(name, value)| format!("{name} {value:.5}"))
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callbacks::Logs;
    use crate::metrics::{KL_LOSS, RECONSTRUCTION_LOSS};
    use burn::backend::{Autodiff, NdArray};
    use ndarray::{Array, IxDyn};
    use std::sync::atomic::{AtomicUsize, Ordering};

    type TestBackend = Autodiff<NdArray<f32>>;

    fn init_logger() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn config() -> CvaeConfig {
        CvaeConfig::new()
            .with_model(
                ModelConfig::new()
                    .with_num_hidden(vec![8, 4])
                    .with_filter_len(4),
            )
            .with_batch_size(8)
            .with_max_epochs(2)
            .with_input_norm_mode(NormMode::Featurewise)
            .with_labels_norm_mode(NormMode::Featurewise)
            .with_seed(Some(11))
    }

    fn spectra(samples: usize, len: usize) -> ArrayD<f32> {
        Array::from_shape_fn(IxDyn(&[samples, len]), |idx| {
            ((idx[1] as f32) * 0.3 + idx[0] as f32 * 0.05).sin() + 2.0
        })
    }

    struct StopAfter {
        epochs: usize,
        seen: Arc<AtomicUsize>,
    }

    impl Callback for StopAfter {
        fn on_epoch_end(&mut self, _epoch: usize, _logs: &Logs, ctx: &mut TrainingContext) {
            let seen = self.seen.fetch_add(1, Ordering::Relaxed) + 1;
            if seen >= self.epochs {
                ctx.stop_training = true;
            }
        }
    }

    #[test]
    fn classification_is_rejected_before_data() {
        let mut cvae = Cvae::<TestBackend>::new(
            config().with_task(Task::Classification),
            Default::default(),
        );
        let err = cvae
            .fit(ArrayD::zeros(IxDyn(&[0])), ArrayD::zeros(IxDyn(&[0])), None)
            .unwrap_err();
        assert!(matches!(err, CvaeError::UnsupportedTask(Task::Classification)));
        assert!(!cvae.has_model());
    }

    #[test]
    fn fit_freezes_statistics_and_logs_history() {
        init_logger();
        let mut cvae = Cvae::<TestBackend>::new(config(), Default::default());
        let data = spectra(40, 24);
        cvae.fit(data.clone(), data.clone(), None).unwrap();

        assert!(cvae.has_model());
        assert_eq!(cvae.history().len(), 2);
        let first = cvae.history().history()[0].1.clone();
        assert!(first.contains_key("val_loss"));
        assert!(first.contains_key(KL_LOSS));
        let stats = cvae.input_statistics().cloned().unwrap();

        cvae.fit(spectra(40, 24).mapv(|v| v * 10.0), data, None).unwrap();
        assert_eq!(cvae.input_statistics().unwrap(), &stats);
    }

    #[test]
    fn small_split_trains_without_validation() {
        let mut cvae = Cvae::<TestBackend>::new(config().with_max_epochs(1), Default::default());
        let data = spectra(9, 24);
        cvae.fit(data.clone(), data, None).unwrap();

        let logs = &cvae.history().history()[0].1;
        assert!(!logs.contains_key("val_loss"));
        assert!(logs.contains_key(RECONSTRUCTION_LOSS));
    }

    #[test]
    fn callback_can_stop_training() {
        let seen = Arc::new(AtomicUsize::new(0));
        let mut cvae = Cvae::<TestBackend>::new(config().with_max_epochs(5), Default::default())
            .with_callback(StopAfter {
                epochs: 1,
                seen: seen.clone(),
            });
        let data = spectra(20, 24);
        cvae.fit(data.clone(), data, None).unwrap();

        assert_eq!(seen.load(Ordering::Relaxed), 1);
        assert_eq!(cvae.history().len(), 1);
    }

    #[test]
    fn fit_on_batch_compiles_and_skips_history() {
        let mut cvae = Cvae::<TestBackend>::new(config(), Default::default());
        let data = spectra(6, 24);
        let weights = Array1::from(vec![1.0, 1.0, 0.5, 0.5, 2.0, 2.0]);
        cvae.fit_on_batch(data.clone(), data, Some(weights)).unwrap();

        assert!(cvae.has_model());
        assert!(cvae.history().is_empty());
        assert_eq!(cvae.step_name(), Some("elbo"));
    }

    #[test]
    fn mismatched_weights_are_rejected() {
        let mut cvae = Cvae::<TestBackend>::new(config(), Default::default());
        let data = spectra(6, 24);
        let err = cvae
            .fit_on_batch(data.clone(), data, Some(Array1::ones(5)))
            .unwrap_err();
        assert!(matches!(err, CvaeError::SampleCountMismatch { found: 5, .. }));
    }

    #[test]
    fn evaluate_requires_model_and_reports_trackers() {
        let mut cvae = Cvae::<TestBackend>::new(config(), Default::default());
        let data = spectra(12, 24);
        assert!(matches!(
            cvae.evaluate(data.clone(), data.clone()),
            Err(CvaeError::NoModel)
        ));

        cvae.fit_on_batch(data.clone(), data.clone(), None).unwrap();
        let scores = cvae.evaluate(data.clone(), data).unwrap();
        let names: Vec<&str> = scores.keys().map(String::as_str).collect();
        assert_eq!(names, vec![LOSS, RECONSTRUCTION_LOSS, KL_LOSS]);
        assert!(scores[KL_LOSS] >= 0.0);
    }

    #[test]
    fn installed_step_strategy_drives_training() {
        let mut cvae = Cvae::<TestBackend>::new(config().with_max_epochs(1), Default::default())
            .with_step_strategy(crate::step::DefaultStep);
        let data = spectra(40, 24);
        cvae.fit(data.clone(), data, None).unwrap();

        assert_eq!(cvae.step_name(), Some("default"));
        assert_eq!(cvae.history().series(KL_LOSS), vec![0.0]);
    }

    #[test]
    fn evaluation_batches_drop_the_remainder() {
        let data = Arc::new(ArrayD::zeros(IxDyn(&[20, 24, 1])));
        let batcher = CvaeBatcher::new(data.clone(), data, None);

        let generator = BatchGenerator::new(
            batcher.clone(),
            (0..20).collect(),
            evaluation_descriptor(8, 20),
            None,
        );
        assert_eq!(generator.len(), 2);
        assert_eq!(generator.indices(0), (0..8).collect::<Vec<_>>());
        assert_eq!(generator.indices(1), (8..16).collect::<Vec<_>>());

        let short = BatchGenerator::new(batcher, (0..5).collect(), evaluation_descriptor(8, 5), None);
        assert_eq!(short.len(), 1);
        assert_eq!(short.indices(0), (0..5).collect::<Vec<_>>());
    }

    #[test]
    fn config_round_trips_through_json() {
        let config = config().with_metrics(vec![RegisteredMetric::MeanError]);
        let json = serde_json::to_string(&config).unwrap();
        let restored: CvaeConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.batch_size, 8);
        assert_eq!(restored.input_norm_mode, NormMode::Featurewise);
        assert_eq!(restored.metrics, vec![RegisteredMetric::MeanError]);
    }
}
