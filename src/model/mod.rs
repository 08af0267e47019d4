pub mod decoder;
pub mod encoder;
pub mod layers;

use crate::data::{CvaeBatch, NamedArrays, INPUT_NAME, OUTPUT_NAME};
use crate::error::{CvaeError, Result};
use burn::module::{ModuleVisitor, Param};
use burn::prelude::*;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;

pub use decoder::{Decoder, DecoderConfig};
pub use encoder::{Encoder, EncoderConfig};
pub use layers::Activation;

/// Architecture hyperparameters shared by the encoder and decoder.
#[derive(Config, Debug)]
pub struct ModelConfig {
    #[config(default = "vec![2, 4]")]
    pub num_filters: Vec<usize>,
    #[config(default = 8)]
    pub filter_len: usize,
    #[config(default = 4)]
    pub pool_length: usize,
    #[config(default = "vec![196, 96]")]
    pub num_hidden: Vec<usize>,
    #[config(default = 2)]
    pub latent_dim: usize,
    #[config(default = 0.0)]
    pub dropout_rate: f64,
    #[config(default = "Activation::Relu")]
    pub activation: Activation,
    /// Recorded with the model parameters; weights are not clipped.
    #[config(default = "None")]
    pub maxnorm: Option<f64>,
}

/// Reconstruction objective and kernel regularization strengths.
#[derive(Config, Debug)]
pub struct LossConfig {
    #[config(default = "ReconstructionLoss::MeanSquared")]
    pub reconstruction: ReconstructionLoss,
    #[config(default = 0.0)]
    pub l1: f64,
    #[config(default = 0.0)]
    pub l2: f64,
}

/// Per-sample shapes of the named inputs and reconstruction targets.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelShapes {
    pub input: IndexMap<String, Vec<usize>>,
    pub labels: IndexMap<String, Vec<usize>>,
}

impl ModelShapes {
    pub fn from_data(inputs: &NamedArrays, targets: &NamedArrays) -> Self {
        Self {
            input: inputs.sample_shapes(),
            labels: targets.sample_shapes(),
        }
    }

    /// `(len, channels)` of the encoder input.
    pub fn input_dims(&self) -> Result<(usize, usize)> {
        sequence_dims(&self.input, INPUT_NAME)
    }

    /// `(len, channels)` of the decoder output.
    pub fn output_dims(&self) -> Result<(usize, usize)> {
        sequence_dims(&self.labels, OUTPUT_NAME)
    }
}

fn sequence_dims(shapes: &IndexMap<String, Vec<usize>>, name: &str) -> Result<(usize, usize)> {
    let shape = shapes.get(name).ok_or_else(|| CvaeError::MissingArray {
        name: name.to_string(),
        expected: vec![name.to_string()],
    })?;
    match shape.as_slice() {
        [len] => Ok((*len, 1)),
        [len, channels] => Ok((*len, *channels)),
        other => Err(CvaeError::RankMismatch {
            name: name.to_string(),
            expected: 2,
            found: other.len(),
        }),
    }
}

/// Encoder outputs, each `[batch, latent_dim]`.
#[derive(Clone, Debug)]
pub struct LatentEncoding<B: Backend> {
    pub mean: Tensor<B, 2>,
    pub log_var: Tensor<B, 2>,
    pub sample: Tensor<B, 2>,
}

/// Encoder and decoder chained through the sampled latent.
#[derive(Module, Debug)]
pub struct CvaeNet<B: Backend> {
    pub encoder: Encoder<B>,
    pub decoder: Decoder<B>,
}

impl ModelConfig {
    pub fn encoder_config(&self, shapes: &ModelShapes) -> Result<EncoderConfig> {
        let (len, channels) = shapes.input_dims()?;
        Ok(EncoderConfig::new(
            len,
            channels,
            self.num_filters.clone(),
            self.filter_len,
            self.pool_length,
            self.num_hidden.clone(),
            self.latent_dim,
        )
        .with_dropout_rate(self.dropout_rate)
        .with_activation(self.activation))
    }

    pub fn decoder_config(&self, shapes: &ModelShapes) -> Result<DecoderConfig> {
        let (len, channels) = shapes.output_dims()?;
        Ok(DecoderConfig::new(
            self.latent_dim,
            len,
            channels,
            self.num_filters.clone(),
            self.filter_len,
            self.num_hidden.clone(),
        )
        .with_dropout_rate(self.dropout_rate)
        .with_activation(self.activation))
    }

    /// Build the encoder/decoder pair for data of the given shapes.
    pub fn init<B: Backend>(
        &self,
        shapes: &ModelShapes,
        device: &B::Device,
    ) -> Result<(Encoder<B>, Decoder<B>)> {
        let encoder = self.encoder_config(shapes)?.init(device)?;
        let decoder = self.decoder_config(shapes)?.init(device)?;
        Ok((encoder, decoder))
    }
}

impl<B: Backend> CvaeNet<B> {
    pub fn new(encoder: Encoder<B>, decoder: Decoder<B>) -> Self {
        Self { encoder, decoder }
    }

    pub fn input_names() -> &'static [&'static str] {
        &[INPUT_NAME]
    }

    pub fn output_names() -> &'static [&'static str] {
        &[OUTPUT_NAME]
    }

    pub fn latent_dim(&self) -> usize {
        self.encoder.latent_dim()
    }

    pub fn forward(&self, x: Tensor<B, 3>) -> (LatentEncoding<B>, Tensor<B, 3>) {
        let latent = self.encoder.forward(x);
        let y = self.decoder.forward(latent.sample.clone());
        (latent, y)
    }

    pub fn forward_with_noise(
        &self,
        x: Tensor<B, 3>,
        eps: Tensor<B, 2>,
    ) -> (LatentEncoding<B>, Tensor<B, 3>) {
        let latent = self.encoder.forward_with_noise(x, eps);
        let y = self.decoder.forward(latent.sample.clone());
        (latent, y)
    }
}

/// Per-entry error reduced over valid entries of each sample.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconstructionLoss {
    MeanSquared,
    MeanAbsolute,
}

impl ReconstructionLoss {
    /// Masked per-sample mean error, scaled by `sample_weight` and averaged
    /// over the batch. Entries with a zero mask contribute exactly nothing.
    pub fn forward<B: Backend>(
        &self,
        targets: Tensor<B, 3>,
        predictions: Tensor<B, 3>,
        mask: Tensor<B, 3>,
        sample_weight: Option<Tensor<B, 1>>,
    ) -> Tensor<B, 1> {
        let [batch, len, channels] = targets.dims();
        let diff = predictions - targets;
        let error = match self {
            ReconstructionLoss::MeanSquared => diff.square(),
            ReconstructionLoss::MeanAbsolute => diff.abs(),
        };
        let error = error.mask_fill(mask.clone().equal_elem(0.0), 0.0);

        let error_sum = error.reshape([batch, len * channels]).sum_dim(1).reshape([batch]);
        let valid = mask
            .reshape([batch, len * channels])
            .sum_dim(1)
            .reshape([batch])
            .clamp_min(1.0);
        let per_sample = error_sum / valid;
        let per_sample = match sample_weight {
            Some(weight) => per_sample * weight,
            None => per_sample,
        };
        per_sample.sum().div_scalar(batch as f64)
    }
}

impl fmt::Display for ReconstructionLoss {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReconstructionLoss::MeanSquared => f.write_str("mean_squared_error"),
            ReconstructionLoss::MeanAbsolute => f.write_str("mean_absolute_error"),
        }
    }
}

/// KL divergence to a standard normal, summed over latents and averaged over the batch.
pub fn kl_divergence<B: Backend>(mean: Tensor<B, 2>, log_var: Tensor<B, 2>) -> Tensor<B, 1> {
    let term = log_var.clone().add_scalar(1.0) - mean.square() - log_var.exp();
    term.sum_dim(1).mul_scalar(-0.5).mean()
}

/// Loss terms and the tensors needed to score extra metrics.
#[derive(Debug)]
pub struct CvaeLosses<B: Backend> {
    pub total: Tensor<B, 1>,
    pub reconstruction: Tensor<B, 1>,
    pub kl: Tensor<B, 1>,
    pub predictions: Tensor<B, 3>,
    pub targets: Tensor<B, 3>,
    pub mask: Tensor<B, 3>,
}

/// Reconstruction + KL (+ kernel penalty when configured) for one batch.
pub fn compute_losses<B: Backend>(
    model: &CvaeNet<B>,
    loss_config: &LossConfig,
    batch: CvaeBatch<B>,
) -> CvaeLosses<B> {
    let (latent, predictions) = model.forward(batch.inputs);
    let reconstruction = loss_config.reconstruction.forward(
        batch.targets.clone(),
        predictions.clone(),
        batch.mask.clone(),
        batch.sample_weight,
    );
    let kl = kl_divergence(latent.mean, latent.log_var);

    let mut total = reconstruction.clone() + kl.clone();
    if let Some(penalty) = kernel_penalty(model, loss_config.l1, loss_config.l2) {
        total = total + penalty;
    }

    CvaeLosses {
        total,
        reconstruction,
        kl,
        predictions,
        targets: batch.targets,
        mask: batch.mask,
    }
}

/// `l1 * sum|w| + l2 * sum w^2` over every kernel (rank >= 2) parameter.
pub fn kernel_penalty<B: Backend>(model: &CvaeNet<B>, l1: f64, l2: f64) -> Option<Tensor<B, 1>> {
    if l1 == 0.0 && l2 == 0.0 {
        return None;
    }
    let mut visitor = KernelPenalty::<B> {
        l1,
        l2,
        total: None,
    };
    model.visit(&mut visitor);
    visitor.total
}

struct KernelPenalty<B: Backend> {
    l1: f64,
    l2: f64,
    total: Option<Tensor<B, 1>>,
}

impl<B: Backend> ModuleVisitor<B> for KernelPenalty<B> {
    fn visit_float<const D: usize>(&mut self, param: &Param<Tensor<B, D>>) {
        // Biases are rank 1.
        if D < 2 {
            return;
        }
        let weight = param.val();
        let term = weight
            .clone()
            .abs()
            .sum()
            .mul_scalar(self.l1)
            .add(weight.square().sum().mul_scalar(self.l2));
        self.total = Some(match self.total.take() {
            Some(total) => total + term,
            None => term,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::MAGIC_NUMBER;
    use burn::backend::NdArray;
    use burn::tensor::TensorData;

    type TestBackend = NdArray<f32>;

    fn tensor3(values: Vec<f32>, dims: [usize; 3]) -> Tensor<TestBackend, 3> {
        Tensor::from_data(TensorData::new(values, dims), &Default::default())
    }

    fn shapes(len: usize) -> ModelShapes {
        let mut shapes = ModelShapes::default();
        shapes.input.insert(INPUT_NAME.to_string(), vec![len, 1]);
        shapes.labels.insert(OUTPUT_NAME.to_string(), vec![len, 1]);
        shapes
    }

    #[test]
    fn kl_is_zero_at_standard_normal() {
        let device = Default::default();
        let mean = Tensor::<TestBackend, 2>::zeros([4, 3], &device);
        let log_var = Tensor::<TestBackend, 2>::zeros([4, 3], &device);
        assert_eq!(kl_divergence(mean, log_var).into_scalar(), 0.0);
    }

    #[test]
    fn kl_is_positive_away_from_prior() {
        let device = Default::default();
        let mean = Tensor::<TestBackend, 2>::from_data(
            TensorData::new(vec![1.0f32, -0.5, 0.0, 2.0], [2, 2]),
            &device,
        );
        let log_var = Tensor::<TestBackend, 2>::from_data(
            TensorData::new(vec![0.3f32, -1.0, 2.0, 0.0], [2, 2]),
            &device,
        );
        assert!(kl_divergence(mean, log_var).into_scalar() > 0.0);
    }

    #[test]
    fn masked_loss_ignores_sentinel_entries() {
        let targets = tensor3(vec![1.0, MAGIC_NUMBER, 3.0, 4.0], [2, 2, 1]);
        let mask = tensor3(vec![1.0, 0.0, 1.0, 1.0], [2, 2, 1]);
        let close = tensor3(vec![1.0, 0.0, 3.0, 4.0], [2, 2, 1]);
        let wild = tensor3(vec![1.0, 1.0e30, 3.0, 4.0], [2, 2, 1]);

        let loss = ReconstructionLoss::MeanSquared;
        let a = loss.forward(targets.clone(), close, mask.clone(), None).into_scalar();
        let b = loss.forward(targets, wild, mask, None).into_scalar();
        assert_eq!(a, 0.0);
        assert_eq!(b, 0.0);
    }

    #[test]
    fn sample_weight_scales_per_sample_error() {
        let targets = tensor3(vec![0.0, 0.0], [2, 1, 1]);
        let predictions = tensor3(vec![1.0, 2.0], [2, 1, 1]);
        let mask = tensor3(vec![1.0, 1.0], [2, 1, 1]);
        let weights = Tensor::<TestBackend, 1>::from_data(
            TensorData::new(vec![1.0f32, 0.0], [2]),
            &Default::default(),
        );

        let loss = ReconstructionLoss::MeanSquared
            .forward(targets, predictions, mask, Some(weights))
            .into_scalar();
        assert!((loss - 0.5).abs() < 1e-6);
    }

    #[test]
    fn factory_builds_matching_pair() {
        let device = Default::default();
        let config = ModelConfig::new()
            .with_num_hidden(vec![16, 8])
            .with_latent_dim(3);
        let (encoder, decoder) = config.init::<TestBackend>(&shapes(40), &device).unwrap();
        let net = CvaeNet::new(encoder, decoder);

        let x = Tensor::<TestBackend, 3>::ones([2, 40, 1], &device);
        let (latent, y) = net.forward(x);
        assert_eq!(latent.sample.dims(), [2, 3]);
        assert_eq!(y.dims(), [2, 40, 1]);
    }

    #[test]
    fn penalty_is_skipped_without_regularization() {
        let device = Default::default();
        let config = ModelConfig::new().with_num_hidden(vec![8, 4]);
        let (encoder, decoder) = config.init::<TestBackend>(&shapes(40), &device).unwrap();
        let net = CvaeNet::new(encoder, decoder);

        assert!(kernel_penalty(&net, 0.0, 0.0).is_none());
        let penalty = kernel_penalty(&net, 0.0, 1e-3).unwrap().into_scalar();
        assert!(penalty > 0.0);
    }

    #[test]
    fn one_dimensional_shapes_are_mono_channel() {
        let mut shapes = ModelShapes::default();
        shapes.input.insert(INPUT_NAME.to_string(), vec![12]);
        assert_eq!(shapes.input_dims().unwrap(), (12, 1));
        assert!(matches!(
            shapes.output_dims(),
            Err(CvaeError::MissingArray { .. })
        ));
    }
}
