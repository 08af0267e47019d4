use crate::error::{CvaeError, Result};
use crate::model::layers::{conv_out, sample_latent, Activation};
use crate::model::LatentEncoding;
use burn::module::Ignored;
use burn::nn::conv::{Conv1d, Conv1dConfig};
use burn::nn::pool::{MaxPool1d, MaxPool1dConfig};
use burn::nn::{Dropout, DropoutConfig, Linear, LinearConfig};
use burn::prelude::*;
use burn::tensor::Distribution;

/// Configuration for the convolutional encoder `x -> (z_mean, z_log_var, z)`.
#[derive(Config, Debug)]
pub struct EncoderConfig {
    pub input_len: usize,
    pub input_channels: usize,
    pub num_filters: Vec<usize>,
    pub filter_len: usize,
    pub pool_length: usize,
    pub num_hidden: Vec<usize>,
    pub latent_dim: usize,
    #[config(default = 0.0)]
    pub dropout_rate: f64,
    #[config(default = "Activation::Relu")]
    pub activation: Activation,
}

/// Conv1d stack, max-pool, dense stack, then the two latent heads.
#[derive(Module, Debug)]
pub struct Encoder<B: Backend> {
    convs: Vec<Conv1d<B>>,
    pool: MaxPool1d,
    hidden: Vec<Linear<B>>,
    z_mean: Linear<B>,
    z_log_var: Linear<B>,
    dropout: Dropout,
    activation: Ignored<Activation>,
}

impl EncoderConfig {
    /// Initialize encoder layers on the given device.
    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<Encoder<B>> {
        if self.num_filters.is_empty() || self.num_hidden.is_empty() {
            return Err(CvaeError::Architecture(
                "encoder needs at least one conv and one dense layer".to_string(),
            ));
        }

        if self.filter_len == 0 || self.pool_length == 0 {
            return Err(CvaeError::Architecture(format!(
                "filter length {} and pool length {} must be positive",
                self.filter_len, self.pool_length
            )));
        }

        let mut len = self.input_len;
        let mut channels = self.input_channels;
        let mut convs = Vec::with_capacity(self.num_filters.len());
        for &filters in &self.num_filters {
            if len < self.filter_len {
                return Err(CvaeError::Architecture(format!(
                    "input length {} too short for {} conv layers of length {}",
                    self.input_len,
                    self.num_filters.len(),
                    self.filter_len
                )));
            }
            convs.push(Conv1dConfig::new(channels, filters, self.filter_len).init(device));
            len = conv_out(len, self.filter_len, 1, 0);
            channels = filters;
        }

        if len < self.pool_length {
            return Err(CvaeError::Architecture(format!(
                "feature length {len} shorter than pool length {}",
                self.pool_length
            )));
        }
        let pool = MaxPool1dConfig::new(self.pool_length)
            .with_stride(self.pool_length)
            .init();
        let pooled = conv_out(len, self.pool_length, self.pool_length, 0);

        let mut features = channels * pooled;
        let mut hidden = Vec::with_capacity(self.num_hidden.len());
        for &units in &self.num_hidden {
            hidden.push(LinearConfig::new(features, units).init(device));
            features = units;
        }

        Ok(Encoder {
            convs,
            pool,
            hidden,
            z_mean: LinearConfig::new(features, self.latent_dim).init(device),
            z_log_var: LinearConfig::new(features, self.latent_dim).init(device),
            dropout: DropoutConfig::new(self.dropout_rate).init(),
            activation: Ignored(self.activation),
        })
    }
}

impl<B: Backend> Encoder<B> {
    /// Encode `[batch, len, channels]` and sample with standard-normal noise.
    pub fn forward(&self, x: Tensor<B, 3>) -> LatentEncoding<B> {
        let (mean, log_var) = self.moments(x);
        let eps = Tensor::random(mean.dims(), Distribution::Normal(0.0, 1.0), &mean.device());
        let sample = sample_latent(mean.clone(), log_var.clone(), eps);
        LatentEncoding {
            mean,
            log_var,
            sample,
        }
    }

    /// Encode with caller-provided noise `eps` of shape `[batch, latent_dim]`.
    pub fn forward_with_noise(&self, x: Tensor<B, 3>, eps: Tensor<B, 2>) -> LatentEncoding<B> {
        let (mean, log_var) = self.moments(x);
        let sample = sample_latent(mean.clone(), log_var.clone(), eps);
        LatentEncoding {
            mean,
            log_var,
            sample,
        }
    }

    pub fn latent_dim(&self) -> usize {
        self.z_mean.weight.dims()[1]
    }

    fn moments(&self, x: Tensor<B, 3>) -> (Tensor<B, 2>, Tensor<B, 2>) {
        // Data is channels-last, Conv1d wants [batch, channels, len].
        let mut x = x.swap_dims(1, 2);
        for conv in &self.convs {
            x = self.dropout.forward(self.activation.apply(conv.forward(x)));
        }
        let x = self.pool.forward(x);

        let [batch, channels, len] = x.dims();
        let mut h = x.reshape([batch, channels * len]);
        for layer in &self.hidden {
            h = self.dropout.forward(self.activation.apply(layer.forward(h)));
        }
        (self.z_mean.forward(h.clone()), self.z_log_var.forward(h))
    }
}
