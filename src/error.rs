use crate::training::Task;
use thiserror::Error;

/// Errors raised by the CVAE pipeline.
#[derive(Debug, Error)]
pub enum CvaeError {
    #[error("CVAE does not support {0} task")]
    UnsupportedTask(Task),
    #[error("missing array `{name}`, model expects {expected:?}")]
    MissingArray { name: String, expected: Vec<String> },
    #[error("array `{name}` has {found} samples, expected {expected}")]
    SampleCountMismatch {
        name: String,
        expected: usize,
        found: usize,
    },
    #[error("array `{name}` has per-sample shape {found:?}, expected {expected:?}")]
    ShapeMismatch {
        name: String,
        expected: Vec<usize>,
        found: Vec<usize>,
    },
    #[error("array `{name}` has rank {found}, expected {expected}")]
    RankMismatch {
        name: String,
        expected: usize,
        found: usize,
    },
    #[error("no samples provided")]
    EmptyInput,
    #[error("no model has been trained or loaded")]
    NoModel,
    #[error("normalization statistics for `{0}` are missing")]
    MissingStatistics(String),
    #[error("invalid architecture: {0}")]
    Architecture(String),
    #[error("failed to read tensor data: {0}")]
    TensorData(String),
    #[error("failed to record model: {0}")]
    Record(String),
    #[error("invalid parameter document: {0}")]
    Parameters(String),
    #[error(transparent)]
    Shape(#[from] ndarray::ShapeError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Csv(#[from] csv::Error),
}

pub type Result<T, E = CvaeError> = std::result::Result<T, E>;
