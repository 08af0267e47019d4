use crate::error::{CvaeError, Result};
use burn::data::dataloader::batcher::Batcher;
use burn::prelude::*;
use burn::tensor::TensorData;
use indexmap::IndexMap;
use ndarray::{Array1, ArrayD, Axis};
use std::ops::Range;
use std::sync::Arc;

/// Marker for a missing value in both inputs and reconstruction targets.
pub const MAGIC_NUMBER: f32 = -9999.0;

/// Name of the single encoder input.
pub const INPUT_NAME: &str = "input";
/// Name of the single decoder output.
pub const OUTPUT_NAME: &str = "output";

/// Named n-dimensional host arrays sharing the sample axis (axis 0).
#[derive(Clone, Debug, Default, PartialEq)]
pub struct NamedArrays {
    arrays: IndexMap<String, ArrayD<f32>>,
}

impl NamedArrays {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bundle holding one array under `name`.
    pub fn single(name: impl Into<String>, array: ArrayD<f32>) -> Self {
        let mut arrays = IndexMap::new();
        arrays.insert(name.into(), array);
        Self { arrays }
    }

    pub fn insert(&mut self, name: impl Into<String>, array: ArrayD<f32>) -> Option<ArrayD<f32>> {
        self.arrays.insert(name.into(), array)
    }

    pub fn get(&self, name: &str) -> Option<&ArrayD<f32>> {
        self.arrays.get(name)
    }

    /// Take the array stored under `name` out of the bundle.
    pub fn take(&mut self, name: &str) -> Result<ArrayD<f32>> {
        self.arrays
            .shift_remove(name)
            .ok_or_else(|| CvaeError::MissingArray {
                name: name.to_string(),
                expected: vec![name.to_string()],
            })
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.arrays.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ArrayD<f32>)> {
        self.arrays.iter().map(|(name, array)| (name.as_str(), array))
    }

    pub fn len(&self) -> usize {
        self.arrays.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arrays.is_empty()
    }

    /// Shared sample count, checking every array agrees.
    pub fn sample_count(&self) -> Result<usize> {
        let mut iter = self.arrays.iter();
        let (_, first) = iter.next().ok_or(CvaeError::EmptyInput)?;
        let expected = first.len_of(Axis(0));
        for (name, array) in iter {
            let found = array.len_of(Axis(0));
            if found != expected {
                return Err(CvaeError::SampleCountMismatch {
                    name: name.clone(),
                    expected,
                    found,
                });
            }
        }
        Ok(expected)
    }

    /// Per-sample shape of each array (everything after axis 0).
    pub fn sample_shapes(&self) -> IndexMap<String, Vec<usize>> {
        self.arrays
            .iter()
            .map(|(name, array)| (name.clone(), array.shape()[1..].to_vec()))
            .collect()
    }

    /// Gather rows `indices` from every array.
    pub fn select(&self, indices: &[usize]) -> NamedArrays {
        self.arrays
            .iter()
            .map(|(name, array)| (name.clone(), array.select(Axis(0), indices)))
            .collect()
    }

    /// Contiguous row range from every array.
    pub fn slice_rows(&self, rows: Range<usize>) -> NamedArrays {
        let indices: Vec<usize> = rows.collect();
        self.select(&indices)
    }

    /// Keep exactly the arrays named in `names`; extra keys are dropped.
    pub fn sanitize(mut self, names: &[&str]) -> Result<NamedArrays> {
        let mut arrays = IndexMap::with_capacity(names.len());
        for &name in names {
            let array = self
                .arrays
                .shift_remove(name)
                .ok_or_else(|| CvaeError::MissingArray {
                    name: name.to_string(),
                    expected: names.iter().map(|n| n.to_string()).collect(),
                })?;
            arrays.insert(name.to_string(), array);
        }
        Ok(NamedArrays { arrays })
    }

    /// Treat `(N, len)` arrays as mono-channel `(N, len, 1)`.
    pub fn with_channel_axis(self) -> NamedArrays {
        self.arrays
            .into_iter()
            .map(|(name, array)| {
                let array = if array.ndim() == 2 {
                    array.insert_axis(Axis(2))
                } else {
                    array
                };
                (name, array)
            })
            .collect()
    }

    /// Append a trailing singleton axis wherever the data is one rank short
    /// of the expected per-sample shape.
    pub fn conform_to(self, shapes: &IndexMap<String, Vec<usize>>) -> NamedArrays {
        self.arrays
            .into_iter()
            .map(|(name, array)| {
                let expected_rank = shapes.get(&name).map(Vec::len);
                let array = match expected_rank {
                    Some(rank) if array.ndim() == rank => {
                        let axis = array.ndim();
                        array.insert_axis(Axis(axis))
                    }
                    _ => array,
                };
                (name, array)
            })
            .collect()
    }

    /// Check arrays named in `shapes` match the expected per-sample shape.
    pub fn check_shapes(&self, shapes: &IndexMap<String, Vec<usize>>) -> Result<()> {
        for (name, array) in &self.arrays {
            let found = array.shape()[1..].to_vec();
            let expected = match shapes.get(name) {
                Some(expected) => expected.clone(),
                None => continue,
            };
            if found != expected {
                return Err(CvaeError::ShapeMismatch {
                    name: name.clone(),
                    expected,
                    found,
                });
            }
        }
        Ok(())
    }

    /// Check every array has the `(N, len, channels)` layout the network consumes.
    pub fn check_rank3(&self) -> Result<()> {
        for (name, array) in &self.arrays {
            if array.ndim() != 3 {
                return Err(CvaeError::RankMismatch {
                    name: name.clone(),
                    expected: 3,
                    found: array.ndim(),
                });
            }
        }
        Ok(())
    }

    pub fn into_inner(self) -> IndexMap<String, ArrayD<f32>> {
        self.arrays
    }
}

impl FromIterator<(String, ArrayD<f32>)> for NamedArrays {
    fn from_iter<T: IntoIterator<Item = (String, ArrayD<f32>)>>(iter: T) -> Self {
        Self {
            arrays: iter.into_iter().collect(),
        }
    }
}

impl IntoIterator for NamedArrays {
    type Item = (String, ArrayD<f32>);
    type IntoIter = indexmap::map::IntoIter<String, ArrayD<f32>>;

    fn into_iter(self) -> Self::IntoIter {
        self.arrays.into_iter()
    }
}

/// Host-side slice of a training batch.
#[derive(Clone, Debug)]
pub struct SampleBatch {
    pub inputs: NamedArrays,
    pub targets: NamedArrays,
    pub sample_weight: Option<Array1<f32>>,
}

/// A device batch ready for a training or evaluation step.
#[derive(Clone, Debug)]
pub struct CvaeBatch<B: Backend> {
    pub inputs: Tensor<B, 3>,
    pub targets: Tensor<B, 3>,
    /// 1 where the target holds a value, 0 where it holds [`MAGIC_NUMBER`].
    pub mask: Tensor<B, 3>,
    pub sample_weight: Option<Tensor<B, 1>>,
}

impl<B: Backend> CvaeBatch<B> {
    pub fn batch_size(&self) -> usize {
        self.inputs.dims()[0]
    }
}

/// Gather rows of a `(N, len, channels)` array into a device tensor.
pub fn rows_to_tensor<B: Backend>(
    array: &ArrayD<f32>,
    rows: &[usize],
    device: &B::Device,
) -> Tensor<B, 3> {
    let selected = array.select(Axis(0), rows);
    let shape = selected.shape();
    let dims = [shape[0], shape[1], shape[2]];
    let values: Vec<f32> = selected.iter().copied().collect();
    Tensor::from_data(TensorData::new(values, dims), device)
}

/// Validity mask for rows of a target array, computed once per batch.
pub fn rows_to_mask<B: Backend>(
    array: &ArrayD<f32>,
    rows: &[usize],
    device: &B::Device,
) -> Tensor<B, 3> {
    let selected = array.select(Axis(0), rows);
    let shape = selected.shape();
    let dims = [shape[0], shape[1], shape[2]];
    let values: Vec<f32> = selected
        .iter()
        .map(|&value| if value == MAGIC_NUMBER { 0.0 } else { 1.0 })
        .collect();
    Tensor::from_data(TensorData::new(values, dims), device)
}

/// Copy a `(N, d1, d2)` tensor back into a host array.
pub fn tensor_to_array<B: Backend>(tensor: Tensor<B, 3>) -> Result<ArrayD<f32>> {
    let dims = tensor.dims();
    let values = tensor
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|err| CvaeError::TensorData(format!("{err:?}")))?;
    Ok(ArrayD::from_shape_vec(dims.to_vec(), values)?)
}

/// Copy a `(N, d)` tensor into a row-major vector.
pub fn tensor_to_vec<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> Result<Vec<f32>> {
    tensor
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|err| CvaeError::TensorData(format!("{err:?}")))
}

/// Builds training/evaluation batches from sample indices.
#[derive(Clone, Debug)]
pub struct CvaeBatcher {
    inputs: Arc<ArrayD<f32>>,
    targets: Arc<ArrayD<f32>>,
    sample_weight: Option<Arc<Array1<f32>>>,
}

impl CvaeBatcher {
    pub fn new(
        inputs: Arc<ArrayD<f32>>,
        targets: Arc<ArrayD<f32>>,
        sample_weight: Option<Arc<Array1<f32>>>,
    ) -> Self {
        Self {
            inputs,
            targets,
            sample_weight,
        }
    }

    /// Number of samples behind this batcher.
    pub fn len(&self) -> usize {
        self.inputs.len_of(Axis(0))
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Host-side rows `items`, keyed by the network's input/output names.
    pub fn host_batch(&self, items: &[usize]) -> SampleBatch {
        SampleBatch {
            inputs: NamedArrays::single(INPUT_NAME, self.inputs.select(Axis(0), items)),
            targets: NamedArrays::single(OUTPUT_NAME, self.targets.select(Axis(0), items)),
            sample_weight: self
                .sample_weight
                .as_ref()
                .map(|weights| weights.select(Axis(0), items)),
        }
    }
}

impl<B: Backend> Batcher<B, usize, CvaeBatch<B>> for CvaeBatcher {
    fn batch(&self, items: Vec<usize>, device: &B::Device) -> CvaeBatch<B> {
        let inputs = rows_to_tensor(&self.inputs, &items, device);
        let targets = rows_to_tensor(&self.targets, &items, device);
        let mask = rows_to_mask(&self.targets, &items, device);
        let sample_weight = self.sample_weight.as_ref().map(|weights| {
            let values: Vec<f32> = items.iter().map(|&idx| weights[idx]).collect();
            Tensor::<B, 1>::from_data(TensorData::new(values, [items.len()]), device)
        });

        CvaeBatch {
            inputs,
            targets,
            mask,
            sample_weight,
        }
    }
}

/// Builds input-only batches for inference.
#[derive(Clone, Debug)]
pub struct PredictionBatcher {
    inputs: Arc<ArrayD<f32>>,
}

impl PredictionBatcher {
    pub fn new(inputs: Arc<ArrayD<f32>>) -> Self {
        Self { inputs }
    }

    pub fn len(&self) -> usize {
        self.inputs.len_of(Axis(0))
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<B: Backend> Batcher<B, usize, Tensor<B, 3>> for PredictionBatcher {
    fn batch(&self, items: Vec<usize>, device: &B::Device) -> Tensor<B, 3> {
        rows_to_tensor(&self.inputs, &items, device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use ndarray::{Array, IxDyn};

    type TestBackend = NdArray<f32>;

    fn ramp(samples: usize, len: usize) -> ArrayD<f32> {
        Array::from_shape_fn(IxDyn(&[samples, len, 1]), |idx| (idx[0] * len + idx[1]) as f32)
    }

    #[test]
    fn sanitize_drops_extra_and_rejects_missing() {
        let mut bundle = NamedArrays::single(INPUT_NAME, ramp(4, 3));
        bundle.insert("extra", ramp(4, 3));

        let cleaned = bundle.clone().sanitize(&[INPUT_NAME]).unwrap();
        assert_eq!(cleaned.names().collect::<Vec<_>>(), vec![INPUT_NAME]);

        let err = bundle.sanitize(&[OUTPUT_NAME]).unwrap_err();
        assert!(matches!(err, CvaeError::MissingArray { ref name, .. } if name == OUTPUT_NAME));
    }

    #[test]
    fn sample_count_detects_mismatch() {
        let mut bundle = NamedArrays::single("a", ramp(4, 3));
        bundle.insert("b", ramp(5, 3));
        assert!(matches!(
            bundle.sample_count(),
            Err(CvaeError::SampleCountMismatch { expected: 4, found: 5, .. })
        ));
        assert!(matches!(NamedArrays::new().sample_count(), Err(CvaeError::EmptyInput)));
    }

    #[test]
    fn conform_appends_trailing_axis_for_mono_data() {
        let flat = Array::from_shape_fn(IxDyn(&[3, 5]), |idx| idx[1] as f32);
        let mut shapes = IndexMap::new();
        shapes.insert(INPUT_NAME.to_string(), vec![5, 1]);

        let conformed = NamedArrays::single(INPUT_NAME, flat).conform_to(&shapes);
        assert_eq!(conformed.get(INPUT_NAME).unwrap().shape(), &[3, 5, 1]);

        let untouched = NamedArrays::single(INPUT_NAME, ramp(3, 5)).conform_to(&shapes);
        assert_eq!(untouched.get(INPUT_NAME).unwrap().shape(), &[3, 5, 1]);
    }

    #[test]
    fn batcher_masks_magic_targets() {
        let device = Default::default();
        let inputs = ramp(3, 2);
        let mut targets = ramp(3, 2);
        targets[[1, 0, 0]] = MAGIC_NUMBER;
        let weights = Array1::from(vec![1.0, 2.0, 3.0]);
        let batcher = CvaeBatcher::new(
            Arc::new(inputs),
            Arc::new(targets),
            Some(Arc::new(weights)),
        );

        let batch: CvaeBatch<TestBackend> = batcher.batch(vec![2, 1], &device);
        assert_eq!(batch.batch_size(), 2);
        let mask = tensor_to_vec(batch.mask).unwrap();
        assert_eq!(mask, vec![1.0, 1.0, 0.0, 1.0]);
        let weights = tensor_to_vec(batch.sample_weight.unwrap()).unwrap();
        assert_eq!(weights, vec![3.0, 2.0]);
        let inputs = tensor_to_vec(batch.inputs).unwrap();
        assert_eq!(inputs, vec![4.0, 5.0, 2.0, 3.0]);
    }
}
