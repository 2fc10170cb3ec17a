//! Pointwise nonlinearities

use std::{
    fmt::{self, Display},
    str::FromStr,
};

use clap::ValueEnum;

use crate::{nn::NNError, tensor::Tensor};

/// Negative slope of [`lrelu`], PyTorch's default rather than TensorFlow's 0.2
pub const LEAKY_SLOPE: f32 = 0.01;

/// Selects the nonlinearity applied after a layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum Activation {
    Relu,
    #[default]
    Leaky,
    Tanh,
    Sigmoid,
    Swish,
    /// Pass-through
    #[value(name = "none")]
    Identity,
}

impl Display for Activation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Activation::Relu => write!(f, "relu"),
            Activation::Leaky => write!(f, "leaky"),
            Activation::Tanh => write!(f, "tanh"),
            Activation::Sigmoid => write!(f, "sigmoid"),
            Activation::Swish => write!(f, "swish"),
            Activation::Identity => write!(f, "none"),
        }
    }
}

impl FromStr for Activation {
    type Err = NNError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        <Self as ValueEnum>::from_str(s, false)
            .map_err(|_| NNError::UnknownActivation(s.to_string()))
    }
}

/// Applies the selected nonlinearity element-wise
pub fn activation(x: &Tensor, activation: Activation) -> Tensor {
    match activation {
        Activation::Leaky => lrelu(x),
        Activation::Relu => relu(x),
        Activation::Sigmoid => sigmoid(x),
        Activation::Tanh => tanh(x),
        Activation::Swish => swish(x),
        Activation::Identity => x.clone(),
    }
}

pub fn lrelu(x: &Tensor) -> Tensor {
    x.leaky_relu(LEAKY_SLOPE)
}

pub fn relu(x: &Tensor) -> Tensor {
    x.relu()
}

pub fn sigmoid(x: &Tensor) -> Tensor {
    x.sigmoid()
}

pub fn tanh(x: &Tensor) -> Tensor {
    x.tanh()
}

/// `x * sigmoid(x)`
pub fn swish(x: &Tensor) -> Tensor {
    x.map(|v| v * &v.sigmoid())
}
