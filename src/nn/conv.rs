//! Convolution and transposed convolution layers

use crate::{
    context::{Init, Scope},
    nn::{
        NNError,
        activation::{Activation, activation},
    },
    tensor::Tensor,
};

/// Coefficient of the L2 penalty on every `conv` / `deconv` kernel
pub const WEIGHT_DECAY: f32 = 1e-4;

/// Configuration of [`conv`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConvConfig {
    /// Output channels
    pub channels: usize,
    pub kernel: usize,
    pub stride: usize,
    /// Zero padding added to each side of both spatial dimensions
    pub pad: usize,
    pub activation: Activation,
}

impl ConvConfig {
    /// 3x3 kernel, stride 2, no padding, leaky ReLU
    pub fn new(channels: usize) -> Self {
        Self {
            channels,
            kernel: 3,
            stride: 2,
            pad: 0,
            activation: Activation::Leaky,
        }
    }
}

/// Configuration of [`deconv`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeconvConfig {
    pub channels: usize,
    pub kernel: usize,
    pub stride: usize,
    pub activation: Activation,
}

impl DeconvConfig {
    /// 3x3 kernel, stride 2, leaky ReLU
    pub fn new(channels: usize) -> Self {
        Self {
            channels,
            kernel: 3,
            stride: 2,
            activation: Activation::Leaky,
        }
    }
}

/// He initialization for ReLU layers, Glorot otherwise
fn kernel_init(activation: Activation) -> Init {
    if activation == Activation::Relu {
        Init::HeNormal
    } else {
        Init::GlorotUniform
    }
}

/// Pads `x` then convolves it, without activation.
///
/// Parameters live in `scope/conv2d/{kernel, bias}`.
#[allow(clippy::too_many_arguments)]
pub(crate) fn padded_conv2d(
    scope: &Scope,
    x: &Tensor,
    channels: usize,
    kernel: usize,
    stride: usize,
    pad: usize,
    init: Init,
    l2_scale: Option<f32>,
) -> Result<Tensor, NNError> {
    let [_, _, _, in_channels] = x.dims4()?;
    let x = x.pad2d(pad)?;
    let layer = scope / "conv2d";
    let kernel_shape = [kernel, kernel, in_channels, channels];
    let weights = match l2_scale {
        Some(scale) => layer.regularized_param("kernel", &kernel_shape, init, scale)?,
        None => layer.param("kernel", &kernel_shape, init)?,
    };
    let bias = layer.param("bias", &[channels], Init::Zeros)?;
    Ok(x.conv2d(&weights, &bias, stride)?)
}

/// Zero-pads, convolves and activates `x` (NHWC).
pub fn conv(scope: &Scope, x: &Tensor, config: &ConvConfig) -> Result<Tensor, NNError> {
    let out = padded_conv2d(
        scope,
        x,
        config.channels,
        config.kernel,
        config.stride,
        config.pad,
        kernel_init(config.activation),
        Some(WEIGHT_DECAY),
    )?;
    log::debug!(
        "{}: conv {:?} -> {:?}",
        scope.name(),
        x.shape(),
        out.shape()
    );
    Ok(activation(&out, config.activation))
}

/// Upsamples `x` by `stride` with a "same" padded transposed convolution, then activates.
///
/// Parameters live in `scope/conv2d_transpose/{kernel, bias}`, the kernel shaped
/// `[k, k, out_channels, in_channels]`.
pub fn deconv(scope: &Scope, x: &Tensor, config: &DeconvConfig) -> Result<Tensor, NNError> {
    let [_, _, _, in_channels] = x.dims4()?;
    let layer = scope / "conv2d_transpose";
    let weights = layer.regularized_param(
        "kernel",
        &[config.kernel, config.kernel, config.channels, in_channels],
        kernel_init(config.activation),
        WEIGHT_DECAY,
    )?;
    let bias = layer.param("bias", &[config.channels], Init::Zeros)?;
    let out = x.conv2d_transpose_same(&weights, &bias, config.stride)?;
    log::debug!(
        "{}: deconv {:?} -> {:?}",
        scope.name(),
        x.shape(),
        out.shape()
    );
    Ok(activation(&out, config.activation))
}
