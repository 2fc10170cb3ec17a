//! Random perturbations: additive noise and dropout

use rand::Rng;
use rand_distr::StandardNormal;

use crate::{context::Context, nn::NNError, tensor::Tensor, values::Value};

/// Adds independent standard normal noise to every element of `x`
pub fn gaussian_noise_layer(ctx: &Context, x: &Tensor) -> Tensor {
    ctx.with_rng(|rng| {
        x.map(|v| {
            let noise: f32 = rng.sample(StandardNormal);
            v + &Value::new(noise)
        })
    })
}

/// Inverted dropout: zeroes each element with probability `rate` and scales the rest by
/// `1 / (1 - rate)`. Outside training, or with a zero rate, `x` is returned as is.
pub fn dropout(ctx: &Context, x: &Tensor, rate: f32, is_training: bool) -> Result<Tensor, NNError> {
    if !(0.0..1.0).contains(&rate) {
        return Err(NNError::InvalidDropout(rate));
    }
    if !is_training || rate == 0.0 {
        return Ok(x.clone());
    }
    let keep_scale = 1.0 / (1.0 - rate);
    let out = ctx.with_rng(|rng| {
        x.map(|v| {
            let scale = if rng.random::<f32>() < rate {
                0.0
            } else {
                keep_scale
            };
            v * &Value::new(scale)
        })
    });
    Ok(out)
}

#[cfg(test)]
mod tests {
    use crate::assert_eq_float;

    use super::*;

    #[test]
    fn test_gaussian_noise_statistics() {
        let ctx = Context::new(11);
        let x = Tensor::full(&[4000], 2.0);
        let y = gaussian_noise_layer(&ctx, &x).to_vec();
        assert_eq!(y.len(), 4000);
        let mean = y.iter().sum::<f32>() / y.len() as f32;
        let var = y.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / y.len() as f32;
        assert!((mean - 2.0).abs() < 0.1, "mean {}", mean);
        assert!((var - 1.0).abs() < 0.1, "variance {}", var);
    }

    #[test]
    fn test_gaussian_noise_keeps_gradient() {
        let ctx = Context::new(1);
        let x = Tensor::zeros(&[3]);
        let y = gaussian_noise_layer(&ctx, &x);
        y.sum().backward();
        for v in x.values() {
            assert_eq_float!(v.grad(), 1.0);
        }
    }

    #[test]
    fn test_dropout_inference_is_identity() {
        let ctx = Context::default();
        let x = Tensor::from_vec(&[3], vec![1.0, 2.0, 3.0]).unwrap();
        assert_eq!(dropout(&ctx, &x, 0.5, false).unwrap().to_vec(), x.to_vec());
        assert_eq!(dropout(&ctx, &x, 0.0, true).unwrap().to_vec(), x.to_vec());
    }

    #[test]
    fn test_dropout_training_scales_kept_elements() {
        let ctx = Context::new(2);
        let x = Tensor::ones(&[2000]);
        let y = dropout(&ctx, &x, 0.25, true).unwrap().to_vec();
        let kept = y.iter().filter(|v| **v != 0.0).count();
        assert!(y.iter().all(|v| *v == 0.0 || (v - 1.0 / 0.75).abs() < 1e-6));
        let kept_ratio = kept as f32 / y.len() as f32;
        assert!((kept_ratio - 0.75).abs() < 0.05, "kept {}", kept_ratio);
    }

    #[test]
    fn test_dropout_invalid_rate() {
        let ctx = Context::default();
        let x = Tensor::ones(&[2]);
        assert!(matches!(
            dropout(&ctx, &x, 1.0, true).unwrap_err(),
            NNError::InvalidDropout(_)
        ));
        assert!(dropout(&ctx, &x, -0.1, false).is_err());
    }
}
