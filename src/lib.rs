//! Convolutional variational autoencoder for one-dimensional spectra on Burn:
//! normalization, masked ELBO training with callbacks, batched inference and
//! on-disk persistence.

pub mod callbacks;
pub mod data;
pub mod error;
pub mod generator;
pub mod inference;
pub mod metrics;
pub mod model;
pub mod normalizer;
pub mod persist;
pub mod step;
pub mod training;

pub use callbacks::{Callback, Logs, ReduceLrOnPlateau, TrainingContext, VirtualCsvLogger};
pub use data::{NamedArrays, INPUT_NAME, MAGIC_NUMBER, OUTPUT_NAME};
pub use error::{CvaeError, Result};
pub use inference::LatentPrediction;
pub use metrics::RegisteredMetric;
pub use model::{CvaeNet, LossConfig, ModelConfig, ModelShapes, ReconstructionLoss};
pub use normalizer::{NormMode, NormalizationStatistics, Normalizer};
pub use persist::ModelParameters;
pub use step::{CvaeModel, DefaultStep, ElboStep, SharedStep, StepStrategy};
pub use training::{Cvae, CvaeConfig, Task};
