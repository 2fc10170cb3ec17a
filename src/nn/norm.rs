//! Batch and instance normalization

use std::{
    fmt::{self, Display},
    str::FromStr,
};

use clap::ValueEnum;

use crate::{
    context::{Init, Scope},
    nn::NNError,
    tensor::{Tensor, TensorError},
    values::Value,
};

/// Added to the variance before taking its inverse square root
pub const NORM_EPSILON: f32 = 1e-5;

/// Weight of the previous value in the batch norm moving averages
pub const BATCH_NORM_DECAY: f32 = 0.9;

/// Selects the normalization of a residual block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum Norm {
    #[default]
    Instance,
    Batch,
    /// Reserved, currently applies no normalization
    Weight,
    /// Reserved, currently applies no normalization
    Spectral,
    #[value(name = "none")]
    Identity,
}

impl Display for Norm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Norm::Instance => write!(f, "instance"),
            Norm::Batch => write!(f, "batch"),
            Norm::Weight => write!(f, "weight"),
            Norm::Spectral => write!(f, "spectral"),
            Norm::Identity => write!(f, "none"),
        }
    }
}

impl FromStr for Norm {
    type Err = NNError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        <Self as ValueEnum>::from_str(s, false).map_err(|_| NNError::UnknownNorm(s.to_string()))
    }
}

/// Mean and inverse standard deviation of one normalization group
struct GroupStats {
    mean: Value,
    inv_std: Value,
}

impl GroupStats {
    fn new(mean: Value, variance: &Value) -> Self {
        let inv_std = (variance + &Value::new(NORM_EPSILON)).pow(&Value::new(-0.5));
        Self { mean, inv_std }
    }

    fn normalize(&self, v: &Value, gamma: &Value, beta: &Value) -> Value {
        let centered = v - &self.mean;
        let scaled = &(&centered * &self.inv_std) * gamma;
        &scaled + beta
    }
}

/// Mean and biased variance of `values[i]` for every `i` in `indices`
fn moments(values: &[Value], indices: &[usize]) -> (Value, Value) {
    let count = Value::new(indices.len() as f32);
    let sum = Value::sum_of(indices.iter().map(|&i| values[i].clone()).collect());
    let mean = &sum / &count;
    let squares = Value::sum_of(
        indices
            .iter()
            .map(|&i| (&values[i] - &mean).square())
            .collect(),
    );
    let variance = &squares / &count;
    (mean, variance)
}

/// Normalizes every channel (last axis) over all other axes, then scales by `gamma` and shifts
/// by `beta`.
///
/// In training mode the batch statistics are used and the moving averages in
/// `scope/{moving_mean, moving_variance}` are updated right away; otherwise the moving
/// averages are used.
pub fn batch_norm(scope: &Scope, x: &Tensor, is_training: bool) -> Result<Tensor, NNError> {
    let channels = *x
        .shape()
        .last()
        .ok_or(TensorError::RankMismatch {
            expected: 1,
            got: 0,
        })?;
    let beta = scope.param("beta", &[channels], Init::Zeros)?;
    let gamma = scope.param("gamma", &[channels], Init::Ones)?;
    let moving_mean = scope.statistic("moving_mean", &[channels], Init::Zeros)?;
    let moving_variance = scope.statistic("moving_variance", &[channels], Init::Ones)?;

    let values = x.values();
    let stats: Vec<GroupStats> = (0..channels)
        .map(|ch| {
            if !is_training {
                let mean = Value::new(moving_mean.values()[ch].data());
                let variance = Value::new(moving_variance.values()[ch].data());
                return GroupStats::new(mean, &variance);
            }
            let indices: Vec<usize> = (ch..values.len()).step_by(channels).collect();
            let (mean, variance) = moments(values, &indices);
            update_moving_average(&moving_mean.values()[ch], mean.data());
            update_moving_average(
                &moving_variance.values()[ch],
                unbiased(variance.data(), indices.len()),
            );
            GroupStats::new(mean, &variance)
        })
        .collect();
    if is_training {
        log::trace!(
            "{}: moving mean {:?}, moving variance {:?}",
            scope.name(),
            moving_mean.to_vec(),
            moving_variance.to_vec()
        );
    }

    let data = values
        .iter()
        .enumerate()
        .map(|(i, v)| {
            let ch = i % channels;
            stats[ch].normalize(v, &gamma.values()[ch], &beta.values()[ch])
        })
        .collect();
    Ok(Tensor::from_values(x.shape(), data)?)
}

/// Bessel corrected variance of `count` samples, the biased one for a single sample
fn unbiased(variance: f32, count: usize) -> f32 {
    if count > 1 {
        variance * count as f32 / (count - 1) as f32
    } else {
        variance
    }
}

fn update_moving_average(average: &Value, observed: f32) {
    let mut average = average.clone();
    let updated = average.data() * BATCH_NORM_DECAY + observed * (1.0 - BATCH_NORM_DECAY);
    average.set_data(updated);
}

/// Normalizes every (sample, channel) pair of an NHWC tensor over its spatial positions, then
/// scales by `gamma` and shifts by `beta`.
pub fn instance_norm(scope: &Scope, x: &Tensor) -> Result<Tensor, NNError> {
    let [n, h, w, c] = x.dims4()?;
    let beta = scope.param("beta", &[c], Init::Zeros)?;
    let gamma = scope.param("gamma", &[c], Init::Ones)?;

    let values = x.values();
    let stats: Vec<GroupStats> = (0..n * c)
        .map(|group| {
            let (b, ch) = (group / c, group % c);
            let indices: Vec<usize> = (0..h * w).map(|p| (b * h * w + p) * c + ch).collect();
            let (mean, variance) = moments(values, &indices);
            GroupStats::new(mean, &variance)
        })
        .collect();

    let data = values
        .iter()
        .enumerate()
        .map(|(i, v)| {
            let (b, ch) = (i / (h * w * c), i % c);
            stats[b * c + ch].normalize(v, &gamma.values()[ch], &beta.values()[ch])
        })
        .collect();
    Ok(Tensor::from_values(x.shape(), data)?)
}

#[cfg(test)]
mod tests {
    use crate::{assert_eq_float, context::Context};

    use super::*;

    fn channel(data: &[f32], channels: usize, ch: usize) -> Vec<f32> {
        data.iter().skip(ch).step_by(channels).copied().collect()
    }

    fn mean_var(data: &[f32]) -> (f32, f32) {
        let n = data.len() as f32;
        let mean = data.iter().sum::<f32>() / n;
        let var = data.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / n;
        (mean, var)
    }

    #[test]
    fn test_instance_norm_statistics() {
        let ctx = Context::default();
        // two samples, 2x2 spatial, two channels with different scales
        let data: Vec<f32> = (0..16)
            .map(|i| if i % 2 == 0 { i as f32 } else { 10.0 * i as f32 + 3.0 })
            .collect();
        let x = Tensor::from_vec(&[2, 2, 2, 2], data).unwrap();
        let y = instance_norm(&(ctx.root() / "instance"), &x).unwrap();
        assert_eq!(y.shape(), x.shape());

        let out = y.to_vec();
        for sample in out.chunks(8) {
            for ch in 0..2 {
                let (mean, var) = mean_var(&channel(sample, 2, ch));
                assert_eq_float!(mean, 0.0, 1e-5);
                assert_eq_float!(var, 1.0, 1e-3);
            }
        }
        assert!(ctx.contains("instance/gamma"));
        assert!(ctx.contains("instance/beta"));
    }

    #[test]
    fn test_instance_norm_requires_nhwc() {
        let ctx = Context::default();
        let err = instance_norm(&ctx.root(), &Tensor::zeros(&[2, 3])).unwrap_err();
        assert!(matches!(
            err,
            NNError::Tensor(TensorError::RankMismatch {
                expected: 4,
                got: 2
            })
        ));
    }

    #[test]
    fn test_instance_norm_constant_input() {
        // zero variance: epsilon keeps the output finite
        let ctx = Context::default();
        let y = instance_norm(&ctx.root(), &Tensor::full(&[1, 2, 2, 1], 3.0)).unwrap();
        assert!(y.to_vec().iter().all(|v| *v == 0.0));
    }

    #[test]
    fn test_batch_norm_training_updates_moving_stats() {
        let ctx = Context::default();
        let scope = ctx.root() / "bn";
        // channel 0: [1, 3], channel 1: [2, 6]
        let x = Tensor::from_vec(&[2, 1, 1, 2], vec![1.0, 2.0, 3.0, 6.0]).unwrap();
        let y = batch_norm(&scope, &x, true).unwrap();

        let out = y.to_vec();
        let inv0 = 1.0 / (1.0f32 + NORM_EPSILON).sqrt();
        let inv1 = 1.0 / (4.0f32 + NORM_EPSILON).sqrt();
        assert_eq_float!(out[0], -inv0, 1e-5);
        assert_eq_float!(out[2], inv0, 1e-5);
        assert_eq_float!(out[1], -2.0 * inv1, 1e-5);
        assert_eq_float!(out[3], 2.0 * inv1, 1e-5);

        // m = 0.9 * m + 0.1 * batch
        let moving_mean = ctx.get("bn/moving_mean").unwrap().to_vec();
        assert_eq_float!(moving_mean[0], 0.2);
        assert_eq_float!(moving_mean[1], 0.4);
        // normalized with the biased variance, averaged with the unbiased one
        let moving_variance = ctx.get("bn/moving_variance").unwrap().to_vec();
        assert_eq_float!(moving_variance[0], 0.9 + 0.1 * 2.0, 1e-5);
        assert_eq_float!(moving_variance[1], 0.9 + 0.1 * 8.0, 1e-5);

        let trainable: Vec<String> = ctx.trainable_params().into_iter().map(|(n, _)| n).collect();
        assert_eq!(trainable, vec!["bn/beta".to_string(), "bn/gamma".to_string()]);
    }

    #[test]
    fn test_batch_norm_single_sample_variance() {
        let ctx = Context::default();
        let scope = ctx.root() / "bn";
        let x = Tensor::from_vec(&[1, 1, 1, 1], vec![5.0]).unwrap();
        batch_norm(&scope, &x, true).unwrap();
        // one sample has zero variance, no correction applied
        let moving_variance = ctx.get("bn/moving_variance").unwrap().to_vec();
        assert_eq_float!(moving_variance[0], 0.9);
        assert!(moving_variance[0].is_finite());
    }

    #[test]
    fn test_batch_norm_inference_uses_moving_stats() {
        let ctx = Context::default();
        let scope = ctx.root() / "bn";
        let x = Tensor::from_vec(&[1, 1, 1, 2], vec![1.0, -2.0]).unwrap();

        // fresh statistics are mean 0, variance 1
        let y = batch_norm(&scope, &x, false).unwrap().to_vec();
        let inv = 1.0 / (1.0f32 + NORM_EPSILON).sqrt();
        assert_eq_float!(y[0], inv, 1e-5);
        assert_eq_float!(y[1], -2.0 * inv, 1e-5);
        assert_eq!(ctx.get("bn/moving_mean").unwrap().to_vec(), vec![0.0, 0.0]);
    }

    #[test]
    fn test_batch_norm_gradient_flows_to_affine_params() {
        let ctx = Context::default();
        let scope = ctx.root();
        let x = Tensor::from_vec(&[2, 1, 1, 1], vec![1.0, 3.0]).unwrap();
        let y = batch_norm(&scope, &x, true).unwrap();
        y.sum().backward();
        // d sum / d beta = number of elements in the channel
        assert_eq_float!(ctx.get("beta").unwrap().values()[0].grad(), 2.0);
        // normalized values sum to zero
        assert_eq_float!(ctx.get("gamma").unwrap().values()[0].grad(), 0.0, 1e-5);
    }

    #[test]
    fn test_parse_names() {
        assert_eq!("instance".parse::<Norm>().unwrap(), Norm::Instance);
        assert_eq!("batch".parse::<Norm>().unwrap(), Norm::Batch);
        assert_eq!("spectral".parse::<Norm>().unwrap(), Norm::Spectral);
        assert_eq!("none".parse::<Norm>().unwrap(), Norm::Identity);
        assert_eq!(Norm::Weight.to_string(), "weight");
        assert_eq!(Norm::default(), Norm::Instance);
        assert!(matches!(
            "invalid".parse::<Norm>().unwrap_err(),
            NNError::UnknownNorm(ref name) if name == "invalid"
        ));
    }
}
