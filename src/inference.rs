use crate::data::{tensor_to_array, tensor_to_vec, NamedArrays, PredictionBatcher, INPUT_NAME, OUTPUT_NAME};
use crate::error::{CvaeError, Result};
use crate::generator::PredictionBatchGenerator;
use crate::model::{CvaeNet, LatentEncoding};
use crate::training::Cvae;
use burn::module::AutodiffModule;
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::TensorData;
use ndarray::{s, Array2, Array3, ArrayD, Ix3};
use rand::{rngs::StdRng, Rng, SeedableRng};
use rand_distr::StandardNormal;
use std::ops::Range;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Encoder outputs for every sample, each `(total, latent_dim)`.
#[derive(Clone, Debug, PartialEq)]
pub struct LatentPrediction {
    pub mean: Array2<f32>,
    /// `exp(0.5 * log_var)`.
    pub uncertainty: Array2<f32>,
    pub sample: Array2<f32>,
}

type InnerNet<B> = CvaeNet<<B as AutodiffBackend>::InnerBackend>;
type InnerLatent<B> = LatentEncoding<<B as AutodiffBackend>::InnerBackend>;

impl<B: AutodiffBackend> Cvae<B> {
    /// Reconstruct `inputs`, returning denormalized `(total, len, channels)`.
    pub fn predict(&mut self, inputs: ArrayD<f32>) -> Result<ArrayD<f32>> {
        let (model, inputs, total) = self.prepare_inference(inputs)?;
        let (out_len, out_channels) = self
            .shapes
            .as_ref()
            .ok_or(CvaeError::NoModel)?
            .output_dims()?;

        let start = Instant::now();
        log::info!("starting inference on {total} samples");
        let mut predictions = Array3::<f32>::zeros((total, out_len, out_channels));
        self.infer_blocks(&model, inputs, total, |rows, _, y| {
            let block = tensor_to_array(y)?.into_dimensionality::<Ix3>()?;
            predictions.slice_mut(s![rows, .., ..]).assign(&block);
            Ok(())
        })?;

        let mut denormalized =
            self.denormalize_labels(NamedArrays::single(OUTPUT_NAME, predictions.into_dyn()))?;
        log::info!(
            "completed inference, {:.2}s elapsed",
            start.elapsed().as_secs_f64()
        );
        denormalized.take(OUTPUT_NAME)
    }

    /// Latent mean, uncertainty and sample for `inputs`; not denormalized.
    pub fn predict_encoder(&mut self, inputs: ArrayD<f32>) -> Result<LatentPrediction> {
        let (model, inputs, total) = self.prepare_inference(inputs)?;
        let latent_dim = model.latent_dim();

        let start = Instant::now();
        log::info!("starting inference on encoder for {total} samples");
        let mut mean = Array2::<f32>::zeros((total, latent_dim));
        let mut uncertainty = Array2::<f32>::zeros((total, latent_dim));
        let mut sample = Array2::<f32>::zeros((total, latent_dim));
        self.infer_blocks(&model, inputs, total, |rows, latent, _| {
            let count = rows.len();
            let block = |tensor: Tensor<B::InnerBackend, 2>| -> Result<Array2<f32>> {
                Ok(Array2::from_shape_vec((count, latent_dim), tensor_to_vec(tensor)?)?)
            };
            mean.slice_mut(s![rows.clone(), ..])
                .assign(&block(latent.mean)?);
            uncertainty
                .slice_mut(s![rows.clone(), ..])
                .assign(&block(latent.log_var.mul_scalar(0.5).exp())?);
            sample.slice_mut(s![rows, ..]).assign(&block(latent.sample)?);
            Ok(())
        })?;

        log::info!(
            "completed inference on encoder, {:.2}s elapsed",
            start.elapsed().as_secs_f64()
        );
        Ok(LatentPrediction {
            mean,
            uncertainty,
            sample,
        })
    }

    #[deprecated(note = "use `predict`")]
    pub fn test(&mut self, inputs: ArrayD<f32>) -> Result<ArrayD<f32>> {
        self.predict(inputs)
    }

    #[deprecated(note = "use `predict_encoder`")]
    pub fn test_encoder(&mut self, inputs: ArrayD<f32>) -> Result<LatentPrediction> {
        self.predict_encoder(inputs)
    }

    /// Shape and normalize `inputs` with the frozen statistics.
    fn prepare_inference(
        &mut self,
        inputs: ArrayD<f32>,
    ) -> Result<(InnerNet<B>, Arc<ArrayD<f32>>, usize)> {
        let model = self.network.as_ref().ok_or(CvaeError::NoModel)?.valid();
        let shapes = self.shapes.as_ref().ok_or(CvaeError::NoModel)?;

        let inputs = NamedArrays::single(INPUT_NAME, inputs)
            .sanitize(CvaeNet::<B>::input_names())?
            .conform_to(&shapes.input)
            .with_channel_axis();
        inputs.check_rank3()?;
        let expected = shapes.input_dims()?;
        let found = inputs.sample_shapes()[INPUT_NAME].clone();
        if found != [expected.0, expected.1] {
            return Err(CvaeError::ShapeMismatch {
                name: INPUT_NAME.to_string(),
                expected: vec![expected.0, expected.1],
                found,
            });
        }

        let total = inputs.sample_count()?;
        if total == 0 {
            return Err(CvaeError::EmptyInput);
        }
        let mut inputs = self.normalize_inputs(inputs)?;
        Ok((model, Arc::new(inputs.take(INPUT_NAME)?), total))
    }

    /// Run the network over full batches then the remainder, handing each
    /// block's rows and outputs to `sink` in order.
    fn infer_blocks<F>(
        &self,
        model: &InnerNet<B>,
        inputs: Arc<ArrayD<f32>>,
        total: usize,
        mut sink: F,
    ) -> Result<()>
    where
        F: FnMut(Range<usize>, InnerLatent<B>, Tensor<B::InnerBackend, 3>) -> Result<()>,
    {
        let effective_batch_size = self.config.batch_size.max(1).min(total);
        let main = (total / effective_batch_size) * effective_batch_size;
        let remainder = total - main;

        let batcher = PredictionBatcher::new(inputs);
        let progress = Arc::new(AtomicUsize::new(0));
        let latent_dim = model.latent_dim();
        let mut rng = StdRng::seed_from_u64(self.config.inference_seed);

        let mut generators = vec![PredictionBatchGenerator::new(
            batcher.clone(),
            (0..main).collect(),
            effective_batch_size,
            total / effective_batch_size,
        )
        .with_progress(progress.clone())];
        if remainder != 0 {
            generators.push(
                PredictionBatchGenerator::new(batcher, (main..total).collect(), remainder, 1)
                    .with_progress(progress.clone()),
            );
        }

        let mut offset = 0;
        for generator in &mut generators {
            for step in 0..generator.len() {
                let x = match generator.batch::<B::InnerBackend>(step, &self.device) {
                    Some(x) => x,
                    None => continue,
                };
                let rows = x.dims()[0];
                let eps = standard_normal::<B::InnerBackend>(&mut rng, rows, latent_dim, &self.device);
                let (latent, y) = model.forward_with_noise(x, eps);
                sink(offset..offset + rows, latent, y)?;
                offset += rows;
            }
        }
        log::debug!(
            "served {}/{} samples",
            progress.load(Ordering::Relaxed),
            total
        );
        Ok(())
    }
}

fn standard_normal<B: Backend>(
    rng: &mut StdRng,
    rows: usize,
    cols: usize,
    device: &B::Device,
) -> Tensor<B, 2> {
    let values: Vec<f32> = (0..rows * cols).map(|_| rng.sample(StandardNormal)).collect();
    Tensor::from_data(TensorData::new(values, [rows, cols]), device)
}
