use crate::data::{NamedArrays, MAGIC_NUMBER};
use crate::error::{CvaeError, Result};
use indexmap::IndexMap;
use ndarray::{arr0, ArrayD, Axis, IxDyn, Zip};
use serde::{Deserialize, Serialize};
use std::fmt;

/// How a named array is centred and scaled.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u16", into = "u16")]
pub enum NormMode {
    /// 0: leave data untouched.
    Identity,
    /// 1: per-feature mean and std over the sample axis.
    Featurewise,
    /// 2: one mean and std over the whole array.
    Datasetwise,
    /// 3: per-feature mean only.
    FeaturewiseCenter,
    /// 4: dataset mean only.
    DatasetwiseCenter,
    /// 255: 8-bit image scaling to `[0, 1]`.
    Image,
}

impl TryFrom<u16> for NormMode {
    type Error = String;

    fn try_from(value: u16) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Identity),
            1 => Ok(Self::Featurewise),
            2 => Ok(Self::Datasetwise),
            3 => Ok(Self::FeaturewiseCenter),
            4 => Ok(Self::DatasetwiseCenter),
            255 => Ok(Self::Image),
            other => Err(format!("unknown normalization mode {other}")),
        }
    }
}

impl From<NormMode> for u16 {
    fn from(mode: NormMode) -> Self {
        match mode {
            NormMode::Identity => 0,
            NormMode::Featurewise => 1,
            NormMode::Datasetwise => 2,
            NormMode::FeaturewiseCenter => 3,
            NormMode::DatasetwiseCenter => 4,
            NormMode::Image => 255,
        }
    }
}

impl fmt::Display for NormMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", u16::from(*self))
    }
}

/// Frozen per-name mean/std, each broadcastable against one sample.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct NormalizationStatistics {
    pub mean: IndexMap<String, ArrayD<f32>>,
    pub std: IndexMap<String, ArrayD<f32>>,
}

impl NormalizationStatistics {
    fn lookup(&self, name: &str) -> Result<(&ArrayD<f32>, &ArrayD<f32>)> {
        let mean = self
            .mean
            .get(name)
            .ok_or_else(|| CvaeError::MissingStatistics(name.to_string()))?;
        let std = self
            .std
            .get(name)
            .ok_or_else(|| CvaeError::MissingStatistics(name.to_string()))?;
        Ok((mean, std))
    }

    /// `(x - mean) / std` on every non-sentinel entry.
    pub fn normalize(&self, data: NamedArrays) -> Result<NamedArrays> {
        data.into_iter()
            .map(|(name, array)| {
                let (mean, std) = self.lookup(&name)?;
                let out = apply_elementwise(&name, array, mean, std, |v, m, s| (v - m) / s)?;
                Ok((name, out))
            })
            .collect()
    }

    /// `x * std + mean` on every non-sentinel entry.
    pub fn denormalize(&self, data: NamedArrays) -> Result<NamedArrays> {
        data.into_iter()
            .map(|(name, array)| {
                let (mean, std) = self.lookup(&name)?;
                let out = apply_elementwise(&name, array, mean, std, |v, m, s| v * s + m)?;
                Ok((name, out))
            })
            .collect()
    }
}

fn apply_elementwise(
    name: &str,
    mut array: ArrayD<f32>,
    mean: &ArrayD<f32>,
    std: &ArrayD<f32>,
    op: impl Fn(f32, f32, f32) -> f32,
) -> Result<ArrayD<f32>> {
    let dim = array.raw_dim();
    let mismatch = |stat: &ArrayD<f32>| CvaeError::ShapeMismatch {
        name: name.to_string(),
        expected: stat.shape().to_vec(),
        found: array.shape()[1..].to_vec(),
    };
    let mean_view = mean.broadcast(dim.clone()).ok_or_else(|| mismatch(mean))?;
    let std_view = std.broadcast(dim).ok_or_else(|| mismatch(std))?;

    Zip::from(&mut array)
        .and(mean_view)
        .and(std_view)
        .for_each(|value, &m, &s| {
            if *value != MAGIC_NUMBER {
                *value = op(*value, m, s);
            }
        });
    Ok(array)
}

/// Computes statistics on first use and applies them read-only afterwards.
#[derive(Clone, Debug)]
pub struct Normalizer {
    mode: NormMode,
    stats: Option<NormalizationStatistics>,
}

impl Normalizer {
    pub fn new(mode: NormMode) -> Self {
        Self { mode, stats: None }
    }

    pub fn mode(&self) -> NormMode {
        self.mode
    }

    pub fn statistics(&self) -> Option<&NormalizationStatistics> {
        self.stats.as_ref()
    }

    pub fn is_frozen(&self) -> bool {
        self.stats.is_some()
    }

    /// Normalize `data`; with `calc` the statistics are computed first unless
    /// they are already frozen, without it they must already exist.
    pub fn normalize(&mut self, data: NamedArrays, calc: bool) -> Result<NamedArrays> {
        if calc {
            if self.stats.is_none() {
                self.stats = Some(compute_statistics(self.mode, &data));
            } else {
                log::debug!("normalization statistics already frozen, reusing");
            }
        }
        let stats = self.stats.as_ref().ok_or_else(|| {
            CvaeError::MissingStatistics(data.names().next().unwrap_or_default().to_string())
        })?;
        stats.normalize(data)
    }

    pub fn denormalize(&self, data: NamedArrays) -> Result<NamedArrays> {
        let stats = self.stats.as_ref().ok_or_else(|| {
            CvaeError::MissingStatistics(data.names().next().unwrap_or_default().to_string())
        })?;
        stats.denormalize(data)
    }
}

fn compute_statistics(mode: NormMode, data: &NamedArrays) -> NormalizationStatistics {
    let mut stats = NormalizationStatistics::default();
    for (name, array) in data.iter() {
        let (mean, std) = match mode {
            NormMode::Identity => (arr0(0.0).into_dyn(), arr0(1.0).into_dyn()),
            NormMode::Image => (arr0(0.0).into_dyn(), arr0(255.0).into_dyn()),
            NormMode::Featurewise => featurewise_mean_std(array),
            NormMode::FeaturewiseCenter => (featurewise_mean_std(array).0, arr0(1.0).into_dyn()),
            NormMode::Datasetwise => datasetwise_mean_std(array),
            NormMode::DatasetwiseCenter => (datasetwise_mean_std(array).0, arr0(1.0).into_dyn()),
        };
        stats.mean.insert(name.to_string(), mean);
        stats.std.insert(name.to_string(), std);
    }
    stats
}

/// Mean/std per feature over the sample axis, ignoring sentinel entries.
fn featurewise_mean_std(array: &ArrayD<f32>) -> (ArrayD<f32>, ArrayD<f32>) {
    let sample_dim = IxDyn(&array.shape()[1..]);
    let mut sum = ArrayD::<f64>::zeros(sample_dim.clone());
    let mut count = ArrayD::<f64>::zeros(sample_dim.clone());
    for sample in array.axis_iter(Axis(0)) {
        Zip::from(&mut sum)
            .and(&mut count)
            .and(&sample)
            .for_each(|s, c, &v| {
                if v != MAGIC_NUMBER {
                    *s += v as f64;
                    *c += 1.0;
                }
            });
    }
    let mean = Zip::from(&sum)
        .and(&count)
        .map_collect(|&s, &c| if c > 0.0 { s / c } else { 0.0 });

    let mut sq = ArrayD::<f64>::zeros(sample_dim);
    for sample in array.axis_iter(Axis(0)) {
        Zip::from(&mut sq)
            .and(&mean)
            .and(&sample)
            .for_each(|acc, &m, &v| {
                if v != MAGIC_NUMBER {
                    *acc += (v as f64 - m).powi(2);
                }
            });
    }
    let std = Zip::from(&sq)
        .and(&count)
        .map_collect(|&q, &c| guard_std(if c > 0.0 { (q / c).sqrt() } else { 0.0 }));

    (mean.mapv(|m| m as f32), std)
}

/// One mean/std over every non-sentinel entry.
fn datasetwise_mean_std(array: &ArrayD<f32>) -> (ArrayD<f32>, ArrayD<f32>) {
    let valid: Vec<f64> = array
        .iter()
        .filter(|&&v| v != MAGIC_NUMBER)
        .map(|&v| v as f64)
        .collect();
    if valid.is_empty() {
        return (arr0(0.0).into_dyn(), arr0(1.0).into_dyn());
    }
    let n = valid.len() as f64;
    let mean = valid.iter().sum::<f64>() / n;
    let var = valid.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    (
        arr0(mean as f32).into_dyn(),
        arr0(guard_std(var.sqrt())).into_dyn(),
    )
}

// Constant features would otherwise divide by zero.
fn guard_std(std: f64) -> f32 {
    if std > 0.0 {
        std as f32
    } else {
        1.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array;

    fn bundle(values: Vec<f32>, shape: &[usize]) -> NamedArrays {
        NamedArrays::single("input", Array::from_shape_vec(IxDyn(shape), values).unwrap())
    }

    #[test]
    fn featurewise_round_trip_is_exact_within_tolerance() {
        let data = bundle(vec![1.0, 10.0, 3.0, 20.0, 5.0, 60.0], &[3, 2, 1]);
        let mut normalizer = Normalizer::new(NormMode::Featurewise);

        let normed = normalizer.normalize(data.clone(), true).unwrap();
        let stats = normalizer.statistics().unwrap();
        assert_eq!(stats.mean["input"].shape(), &[2, 1]);
        assert!((stats.mean["input"][[0, 0]] - 3.0).abs() < 1e-6);

        let restored = normalizer.denormalize(normed).unwrap();
        for (a, b) in restored.get("input").unwrap().iter().zip(data.get("input").unwrap()) {
            assert!((a - b).abs() < 1e-4, "{a} != {b}");
        }
    }

    #[test]
    fn sentinel_entries_are_excluded_and_preserved() {
        let data = bundle(vec![2.0, MAGIC_NUMBER, 4.0], &[3, 1, 1]);
        let mut normalizer = Normalizer::new(NormMode::Featurewise);
        let normed = normalizer.normalize(data, true).unwrap();

        let stats = normalizer.statistics().unwrap();
        assert!((stats.mean["input"][[0, 0]] - 3.0).abs() < 1e-6);
        assert_eq!(normed.get("input").unwrap()[[1, 0, 0]], MAGIC_NUMBER);
    }

    #[test]
    fn statistics_freeze_after_first_call() {
        let mut normalizer = Normalizer::new(NormMode::Datasetwise);
        normalizer
            .normalize(bundle(vec![0.0, 2.0], &[2, 1, 1]), true)
            .unwrap();
        let frozen = normalizer.statistics().cloned().unwrap();

        normalizer
            .normalize(bundle(vec![100.0, 300.0], &[2, 1, 1]), true)
            .unwrap();
        assert_eq!(normalizer.statistics().unwrap(), &frozen);
    }

    #[test]
    fn apply_only_without_statistics_fails() {
        let mut normalizer = Normalizer::new(NormMode::Image);
        let err = normalizer
            .normalize(bundle(vec![1.0], &[1, 1, 1]), false)
            .unwrap_err();
        assert!(matches!(err, CvaeError::MissingStatistics(_)));
    }

    #[test]
    fn image_mode_scales_by_255() {
        let mut normalizer = Normalizer::new(NormMode::Image);
        let normed = normalizer
            .normalize(bundle(vec![255.0, 51.0], &[2, 1, 1]), true)
            .unwrap();
        let values: Vec<f32> = normed.get("input").unwrap().iter().copied().collect();
        assert_eq!(values, vec![1.0, 0.2]);
    }

    #[test]
    fn constant_feature_keeps_unit_std() {
        let mut normalizer = Normalizer::new(NormMode::Featurewise);
        normalizer
            .normalize(bundle(vec![7.0, 7.0, 7.0], &[3, 1, 1]), true)
            .unwrap();
        assert_eq!(normalizer.statistics().unwrap().std["input"][[0, 0]], 1.0);
    }

    #[test]
    fn mode_serializes_as_integer() {
        assert_eq!(serde_json::to_string(&NormMode::Image).unwrap(), "255");
        let mode: NormMode = serde_json::from_str("1").unwrap();
        assert_eq!(mode, NormMode::Featurewise);
        assert!(serde_json::from_str::<NormMode>("7").is_err());
    }
}
