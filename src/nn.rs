//! Components to build convolutional GAN generators and discriminators
//!
//! Every layer is a function of an input [`Tensor`](crate::tensor::Tensor), a config value and
//! a [`Scope`](crate::context::Scope) naming its parameters.

use thiserror::Error;

use crate::tensor::TensorError;

pub mod activation;
pub mod conv;
pub mod noise;
pub mod norm;
pub mod resblock;

pub use activation::{Activation, activation};
pub use conv::{ConvConfig, DeconvConfig, conv, deconv};
pub use noise::{dropout, gaussian_noise_layer};
pub use norm::{Norm, batch_norm, instance_norm};
pub use resblock::{ResBlockConfig, resblock};

/// Errors for the neural network
#[derive(Debug, Error)]
pub enum NNError {
    #[error(transparent)]
    Tensor(#[from] TensorError),
    #[error("Unknown activation `{0}`, expected one of relu, leaky, tanh, sigmoid, swish, none")]
    UnknownActivation(String),
    #[error("Unknown normalization `{0}`, expected one of instance, batch, weight, spectral, none")]
    UnknownNorm(String),
    #[error("Parameter {name} has shape {expected:?}, requested {got:?}")]
    ParamShapeMismatch {
        name: String,
        expected: Vec<usize>,
        got: Vec<usize>,
    },
    #[error("Dropout rate must be in [0, 1), got {0}")]
    InvalidDropout(f32),
}
