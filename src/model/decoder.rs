use crate::error::{CvaeError, Result};
use crate::model::layers::Activation;
use burn::module::Ignored;
use burn::nn::conv::{Conv1d, Conv1dConfig};
use burn::nn::{Dropout, DropoutConfig, Linear, LinearConfig};
use burn::prelude::*;

/// Configuration for the decoder `z -> y_pred`, mirroring the encoder layers.
#[derive(Config, Debug)]
pub struct DecoderConfig {
    pub latent_dim: usize,
    pub output_len: usize,
    pub output_channels: usize,
    /// Encoder filter counts, in encoder order.
    pub num_filters: Vec<usize>,
    pub filter_len: usize,
    /// Encoder hidden sizes, in encoder order.
    pub num_hidden: Vec<usize>,
    #[config(default = 0.0)]
    pub dropout_rate: f64,
    #[config(default = "Activation::Relu")]
    pub activation: Activation,
}

/// Dense stack, projection to a seed sequence, then valid Conv1d layers that
/// shrink the seed back to the output length.
#[derive(Module, Debug)]
pub struct Decoder<B: Backend> {
    hidden: Vec<Linear<B>>,
    expand: Linear<B>,
    convs: Vec<Conv1d<B>>,
    dropout: Dropout,
    activation: Ignored<Activation>,
    #[module(ignore)]
    seed_channels: usize,
    #[module(ignore)]
    seed_len: usize,
}

impl DecoderConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<Decoder<B>> {
        let seed_channels = match self.num_filters.last() {
            Some(&filters) if !self.num_hidden.is_empty() => filters,
            _ => {
                return Err(CvaeError::Architecture(
                    "decoder needs at least one conv and one dense layer".to_string(),
                ))
            }
        };
        if self.filter_len == 0 {
            return Err(CvaeError::Architecture("filter length must be positive".to_string()));
        }

        let mut features = self.latent_dim;
        let mut hidden = Vec::with_capacity(self.num_hidden.len());
        for &units in self.num_hidden.iter().rev() {
            hidden.push(LinearConfig::new(features, units).init(device));
            features = units;
        }

        let seed_len = self.output_len + self.num_filters.len() * (self.filter_len - 1);
        let expand = LinearConfig::new(features, seed_channels * seed_len).init(device);

        let mut convs = Vec::with_capacity(self.num_filters.len());
        let mut channels = seed_channels;
        let targets = self
            .num_filters
            .iter()
            .rev()
            .skip(1)
            .copied()
            .chain(std::iter::once(self.output_channels));
        for filters in targets {
            convs.push(Conv1dConfig::new(channels, filters, self.filter_len).init(device));
            channels = filters;
        }

        Ok(Decoder {
            hidden,
            expand,
            convs,
            dropout: DropoutConfig::new(self.dropout_rate).init(),
            activation: Ignored(self.activation),
            seed_channels,
            seed_len,
        })
    }
}

impl<B: Backend> Decoder<B> {
    /// Decode `[batch, latent_dim]` into channels-last `[batch, len, channels]`.
    pub fn forward(&self, z: Tensor<B, 2>) -> Tensor<B, 3> {
        let mut h = z;
        for layer in &self.hidden {
            h = self.dropout.forward(self.activation.apply(layer.forward(h)));
        }
        let h = self.activation.apply(self.expand.forward(h));

        let [batch, _] = h.dims();
        let mut x = h.reshape([batch, self.seed_channels, self.seed_len]);
        let last = self.convs.len().saturating_sub(1);
        for (idx, conv) in self.convs.iter().enumerate() {
            x = conv.forward(x);
            // Output layer stays linear.
            if idx < last {
                x = self.dropout.forward(self.activation.apply(x));
            }
        }
        x.swap_dims(1, 2)
    }
}
