use crate::data::OUTPUT_NAME;
use crate::error::{CvaeError, Result};
use crate::model::{Activation, LossConfig, ModelConfig, ModelShapes};
use crate::normalizer::{NormMode, NormalizationStatistics};
use crate::training::{Cvae, CvaeConfig, Task};
use burn::config::Config;
use burn::module::Module;
use burn::record::{CompactRecorder, Recorder};
use burn::tensor::backend::AutodiffBackend;
use indexmap::IndexMap;
use ndarray::{ArrayD, ArrayViewD, IxDyn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::path::Path;

pub const PARAMETER_FILE: &str = "model_parameter.json";
pub const CONFIG_FILE: &str = "config.json";
pub const WEIGHTS_FILE: &str = "model_weights";
pub const LOG_FILE: &str = "log.csv";

/// Hyperparameters and normalization statistics written next to the weights.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelParameters {
    pub id: String,
    pub pool_length: usize,
    pub filterlen: usize,
    pub filternum: Vec<usize>,
    pub hidden: Vec<usize>,
    pub input: IndexMap<String, Vec<usize>>,
    pub labels: IndexMap<String, Vec<usize>>,
    pub task: Task,
    pub activation: Activation,
    pub input_mean: IndexMap<String, Value>,
    pub labels_mean: IndexMap<String, Value>,
    pub input_std: IndexMap<String, Value>,
    pub labels_std: IndexMap<String, Value>,
    pub valsize: f64,
    pub targetname: Vec<String>,
    pub dropout_rate: f64,
    pub l1: f64,
    pub l2: f64,
    pub maxnorm: Option<f64>,
    pub input_norm_mode: NormMode,
    pub labels_norm_mode: NormMode,
    pub batch_size: usize,
    pub latent: usize,
}

impl ModelParameters {
    fn new(
        config: &CvaeConfig,
        shapes: &ModelShapes,
        input: &NormalizationStatistics,
        labels: &NormalizationStatistics,
    ) -> Self {
        let model = &config.model;
        Self {
            id: "Cvae".to_string(),
            pool_length: model.pool_length,
            filterlen: model.filter_len,
            filternum: model.num_filters.clone(),
            hidden: model.num_hidden.clone(),
            input: shapes.input.clone(),
            labels: shapes.labels.clone(),
            task: config.task,
            activation: model.activation,
            input_mean: arrays_to_json(&input.mean),
            labels_mean: arrays_to_json(&labels.mean),
            input_std: arrays_to_json(&input.std),
            labels_std: arrays_to_json(&labels.std),
            valsize: config.val_size,
            targetname: vec![OUTPUT_NAME.to_string()],
            dropout_rate: model.dropout_rate,
            l1: config.loss.l1,
            l2: config.loss.l2,
            maxnorm: model.maxnorm,
            input_norm_mode: config.input_norm_mode,
            labels_norm_mode: config.labels_norm_mode,
            batch_size: config.batch_size,
            latent: model.latent_dim,
        }
    }

    pub fn shapes(&self) -> ModelShapes {
        ModelShapes {
            input: self.input.clone(),
            labels: self.labels.clone(),
        }
    }

    /// Configuration rebuilt from the persisted fields alone.
    pub fn config(&self) -> CvaeConfig {
        let model = ModelConfig::new()
            .with_num_filters(self.filternum.clone())
            .with_filter_len(self.filterlen)
            .with_pool_length(self.pool_length)
            .with_num_hidden(self.hidden.clone())
            .with_latent_dim(self.latent)
            .with_dropout_rate(self.dropout_rate)
            .with_activation(self.activation)
            .with_maxnorm(self.maxnorm);
        CvaeConfig::new()
            .with_model(model)
            .with_loss(LossConfig::new().with_l1(self.l1).with_l2(self.l2))
            .with_task(self.task)
            .with_batch_size(self.batch_size)
            .with_val_size(self.valsize)
            .with_input_norm_mode(self.input_norm_mode)
            .with_labels_norm_mode(self.labels_norm_mode)
    }

    pub fn input_statistics(&self) -> Result<NormalizationStatistics> {
        Ok(NormalizationStatistics {
            mean: arrays_from_json(&self.input_mean)?,
            std: arrays_from_json(&self.input_std)?,
        })
    }

    pub fn labels_statistics(&self) -> Result<NormalizationStatistics> {
        Ok(NormalizationStatistics {
            mean: arrays_from_json(&self.labels_mean)?,
            std: arrays_from_json(&self.labels_std)?,
        })
    }

    /// Pretty JSON with keys in sorted order.
    pub fn to_json(&self) -> Result<String> {
        let value = serde_json::to_value(self)?;
        Ok(serde_json::to_string_pretty(&value)?)
    }
}

impl<B: AutodiffBackend> Cvae<B> {
    /// Write weights, `config.json`, the parameter document and the epoch log to `dir`.
    pub fn save(&self, dir: impl AsRef<Path>) -> Result<()> {
        let dir = dir.as_ref();
        let network = self.network.as_ref().ok_or(CvaeError::NoModel)?;
        let shapes = self.shapes.as_ref().ok_or(CvaeError::NoModel)?;
        let input = self
            .input_statistics()
            .ok_or_else(|| CvaeError::MissingStatistics("input".to_string()))?;
        let labels = self
            .labels_statistics()
            .ok_or_else(|| CvaeError::MissingStatistics(OUTPUT_NAME.to_string()))?;

        fs::create_dir_all(dir)?;
        network
            .clone()
            .save_file(dir.join(WEIGHTS_FILE), &CompactRecorder::new())
            .map_err(|err| CvaeError::Record(format!("{err:?}")))?;
        self.config.save(dir.join(CONFIG_FILE))?;

        let parameters = ModelParameters::new(&self.config, shapes, input, labels);
        fs::write(dir.join(PARAMETER_FILE), parameters.to_json()?)?;
        if !self.history.is_empty() {
            self.history.save(dir.join(LOG_FILE))?;
        }
        log::info!("model saved to {}", dir.display());
        Ok(())
    }

    /// Restore a model written by [`Cvae::save`], ready for inference or
    /// further training.
    pub fn load(dir: impl AsRef<Path>, device: B::Device) -> Result<Self> {
        let dir = dir.as_ref();
        let text = fs::read_to_string(dir.join(PARAMETER_FILE))?;
        let parameters: ModelParameters = serde_json::from_str(&text)?;

        let config_path = dir.join(CONFIG_FILE);
        let config = if config_path.exists() {
            CvaeConfig::load(&config_path).map_err(|err| CvaeError::Parameters(format!("{err:?}")))?
        } else {
            parameters.config()
        };

        let mut cvae = Cvae::new(config, device);
        cvae.compile(parameters.shapes(), None)?;
        let network = cvae.network.take().ok_or(CvaeError::NoModel)?;
        let record = CompactRecorder::new()
            .load(dir.join(WEIGHTS_FILE), &cvae.device)
            .map_err(|err| CvaeError::Record(format!("{err:?}")))?;
        cvae.network = Some(network.load_record(record));
        cvae.input_stats = Some(parameters.input_statistics()?);
        cvae.labels_stats = Some(parameters.labels_statistics()?);

        log::info!("model loaded from {}", dir.display());
        Ok(cvae)
    }
}

fn arrays_to_json(arrays: &IndexMap<String, ArrayD<f32>>) -> IndexMap<String, Value> {
    arrays
        .iter()
        .map(|(name, array)| (name.clone(), array_to_json(array.view())))
        .collect()
}

fn arrays_from_json(values: &IndexMap<String, Value>) -> Result<IndexMap<String, ArrayD<f32>>> {
    values
        .iter()
        .map(|(name, value)| Ok((name.clone(), array_from_json(value)?)))
        .collect()
}

/// Nested lists, one level per axis; a 0-d array is a bare number.
fn array_to_json(array: ArrayViewD<f32>) -> Value {
    if array.ndim() == 0 {
        return array.iter().next().map_or(Value::Null, |&v| Value::from(v as f64));
    }
    Value::Array(array.outer_iter().map(array_to_json).collect())
}

fn array_from_json(value: &Value) -> Result<ArrayD<f32>> {
    let mut shape = Vec::new();
    let mut cursor = value;
    while let Value::Array(items) = cursor {
        shape.push(items.len());
        match items.first() {
            Some(first) => cursor = first,
            None => break,
        }
    }
    let mut values = Vec::new();
    flatten(value, &mut values)?;
    Ok(ArrayD::from_shape_vec(IxDyn(&shape), values)?)
}

fn flatten(value: &Value, out: &mut Vec<f32>) -> Result<()> {
    match value {
        Value::Array(items) => items.iter().try_for_each(|item| flatten(item, out)),
        Value::Number(number) => {
            let number = number
                .as_f64()
                .ok_or_else(|| CvaeError::Parameters(format!("{number} is not a float")))?;
            out.push(number as f32);
            Ok(())
        }
        other => Err(CvaeError::Parameters(format!(
            "expected a number or list, found {other}"
        ))),
    }
}
