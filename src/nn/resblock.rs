//! Residual block: two padded convolutions with a skip connection

use crate::{
    context::{Init, Scope},
    nn::{
        NNError,
        activation::relu,
        conv::padded_conv2d,
        noise::dropout,
        norm::{Norm, batch_norm, instance_norm},
    },
    tensor::Tensor,
};

/// Configuration of [`resblock`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResBlockConfig {
    pub channels: usize,
    pub kernel: usize,
    pub stride: usize,
    pub pad: usize,
    /// Disabled when 0
    pub dropout_ratio: f32,
    pub is_training: bool,
    pub norm: Norm,
}

impl ResBlockConfig {
    /// 3x3 kernel, stride 1, padding 1, no dropout, training mode, instance norm
    pub fn new(channels: usize) -> Self {
        Self {
            channels,
            kernel: 3,
            stride: 1,
            pad: 1,
            dropout_ratio: 0.0,
            is_training: true,
            norm: Norm::Instance,
        }
    }
}

/// `x + res2(relu(res1(x)))`, each stage a padded convolution followed by the selected
/// normalization.
///
/// The input and the stage 2 output must have the same shape (stride 1 with `channels`
/// equal to the input channels), otherwise the addition fails with a shape mismatch.
pub fn resblock(scope: &Scope, x: &Tensor, config: &ResBlockConfig) -> Result<Tensor, NNError> {
    let res1 = scope / "res1";
    let out = stage(&res1, x, config, Init::HeNormal)?;
    let out = normalize(&res1, &out, config, "res1")?;
    let out = relu(&out);

    let res2 = scope / "res2";
    let out = stage(&res2, &out, config, Init::GlorotUniform)?;
    let mut out = normalize(&res2, &out, config, "res2")?;

    if config.dropout_ratio > 0.0 {
        out = dropout(
            scope.context(),
            &out,
            config.dropout_ratio,
            config.is_training,
        )?;
    }

    let out = out.add(x)?;
    log::trace!(
        "{}: {} NaN outputs",
        scope.name(),
        out.values().iter().filter(|v| v.data().is_nan()).count()
    );
    Ok(out)
}

fn stage(scope: &Scope, x: &Tensor, config: &ResBlockConfig, init: Init) -> Result<Tensor, NNError> {
    padded_conv2d(
        scope,
        x,
        config.channels,
        config.kernel,
        config.stride,
        config.pad,
        init,
        None,
    )
}

fn normalize(
    scope: &Scope,
    x: &Tensor,
    config: &ResBlockConfig,
    prefix: &str,
) -> Result<Tensor, NNError> {
    match config.norm {
        Norm::Instance => instance_norm(&scope.sub(&format!("{prefix}_instance")), x),
        Norm::Batch => batch_norm(
            &scope.sub(&format!("{prefix}_batch")),
            x,
            config.is_training,
        ),
        Norm::Weight | Norm::Spectral | Norm::Identity => Ok(x.clone()),
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand_pcg::Pcg64Mcg;

    use crate::{context::Context, tensor::TensorError};

    use super::*;

    #[test]
    fn test_resblock_keeps_shape() {
        let _ = env_logger::builder().is_test(true).try_init();
        let ctx = Context::new(4);
        let x = Tensor::randn(&[2, 4, 4, 3], &mut Pcg64Mcg::seed_from_u64(9));
        for norm in [Norm::Instance, Norm::Batch, Norm::Identity] {
            let config = ResBlockConfig {
                norm,
                ..ResBlockConfig::new(3)
            };
            let scope = ctx.root().sub(&format!("resblock_{norm}"));
            let y = resblock(&scope, &x, &config).unwrap();
            assert_eq!(y.shape(), x.shape());
            assert!(y.to_vec().iter().all(|v| v.is_finite()));
        }
    }

    #[test]
    fn test_resblock_param_names() {
        let ctx = Context::default();
        let x = Tensor::ones(&[1, 3, 3, 2]);
        let scope = ctx.root() / "resblock_0";
        resblock(&scope, &x, &ResBlockConfig::new(2)).unwrap();
        let names: Vec<String> = ctx.params().into_iter().map(|(n, _)| n).collect();
        assert_eq!(
            names,
            vec![
                "resblock_0/res1/conv2d/bias",
                "resblock_0/res1/conv2d/kernel",
                "resblock_0/res1/res1_instance/beta",
                "resblock_0/res1/res1_instance/gamma",
                "resblock_0/res2/conv2d/bias",
                "resblock_0/res2/conv2d/kernel",
                "resblock_0/res2/res2_instance/beta",
                "resblock_0/res2/res2_instance/gamma",
            ]
        );
        // resblock kernels are not weight decayed
        assert_eq!(ctx.regularization_loss().data(), 0.0);

        let bn = ctx.root() / "resblock_1";
        let config = ResBlockConfig {
            norm: Norm::Batch,
            ..ResBlockConfig::new(2)
        };
        resblock(&bn, &x, &config).unwrap();
        assert!(ctx.contains("resblock_1/res2/res2_batch/moving_variance"));

        let unnormalized = ctx.root() / "resblock_2";
        let config = ResBlockConfig {
            norm: Norm::Spectral,
            ..ResBlockConfig::new(2)
        };
        let before = ctx.len();
        resblock(&unnormalized, &x, &config).unwrap();
        // two convolutions with kernel and bias each
        assert_eq!(ctx.len(), before + 4);
    }

    #[test]
    fn test_resblock_zero_weights_is_identity() {
        let ctx = Context::default();
        let scope = ctx.root();
        // pre-create zero kernels so both stages output zeros
        for stage in ["res1", "res2"] {
            scope
                .sub(stage)
                .sub("conv2d")
                .param("kernel", &[3, 3, 2, 2], Init::Zeros)
                .unwrap();
        }
        let x = Tensor::from_vec(&[1, 2, 2, 2], (0..8).map(|v| v as f32).collect()).unwrap();
        let config = ResBlockConfig {
            norm: Norm::Identity,
            ..ResBlockConfig::new(2)
        };
        let y = resblock(&scope, &x, &config).unwrap();
        assert_eq!(y.to_vec(), x.to_vec());
    }

    #[test]
    fn test_resblock_dropout_only_in_training() {
        let ctx = Context::new(8);
        let x = Tensor::ones(&[1, 3, 3, 2]);
        let scope = ctx.root() / "resblock_0";
        let config = ResBlockConfig {
            dropout_ratio: 0.5,
            is_training: false,
            norm: Norm::Identity,
            ..ResBlockConfig::new(2)
        };
        let a = resblock(&scope, &x, &config).unwrap().to_vec();
        let b = resblock(&scope, &x, &config).unwrap().to_vec();
        assert_eq!(a, b);
    }

    #[test]
    fn test_resblock_channel_mismatch() {
        let ctx = Context::default();
        let x = Tensor::ones(&[1, 3, 3, 2]);
        // 4 output channels cannot be added to a 2 channel input
        let err = resblock(&ctx.root(), &x, &ResBlockConfig::new(4)).unwrap_err();
        assert!(matches!(
            err,
            NNError::Tensor(TensorError::ShapeMismatch { .. })
        ));
    }
}
