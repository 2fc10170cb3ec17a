//! N-dimensional tensors of autograd scalars
//!
//! A [`Tensor`] is a shape plus a row-major buffer of [`Value`]s, so every operation on it
//! builds the same computation graph as operating on the scalars directly. Images use the
//! channel-last layout `[batch, height, width, channels]`.

use std::fmt;

use rand::Rng;
use rand_distr::StandardNormal;
use thiserror::Error;

use crate::values::Value;

/// Errors for tensor operations
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TensorError {
    #[error("Shape mismatch: {lhs:?} vs {rhs:?}")]
    ShapeMismatch { lhs: Vec<usize>, rhs: Vec<usize> },
    #[error("Expected a tensor of rank {expected}, got rank {got}")]
    RankMismatch { expected: usize, got: usize },
    #[error("Expected {expected} input channels, got {got}")]
    ChannelMismatch { expected: usize, got: usize },
    #[error("Kernel {kernel:?} is larger than the (padded) input {input:?}")]
    KernelTooLarge { input: [usize; 2], kernel: [usize; 2] },
    #[error("Shape {shape:?} holds {expected} elements, got {got}")]
    DataLengthMismatch {
        shape: Vec<usize>,
        expected: usize,
        got: usize,
    },
    #[error("Stride must be at least 1")]
    InvalidStride,
}

/// An n-dimensional array of [`Value`]s
#[derive(Clone)]
pub struct Tensor {
    shape: Vec<usize>,
    data: Vec<Value>,
}

impl Tensor {
    /// Creates a tensor of leaf values from raw data
    pub fn from_vec(shape: &[usize], data: Vec<f32>) -> Result<Self, TensorError> {
        Self::from_values(shape, data.into_iter().map(Value::new).collect())
    }

    /// Creates a tensor from existing graph nodes
    pub fn from_values(shape: &[usize], data: Vec<Value>) -> Result<Self, TensorError> {
        let expected = shape.iter().product();
        if data.len() != expected {
            return Err(TensorError::DataLengthMismatch {
                shape: shape.to_vec(),
                expected,
                got: data.len(),
            });
        }
        Ok(Self {
            shape: shape.to_vec(),
            data,
        })
    }

    pub fn full(shape: &[usize], value: f32) -> Self {
        let n = shape.iter().product();
        Self {
            shape: shape.to_vec(),
            data: (0..n).map(|_| Value::new(value)).collect(),
        }
    }

    pub fn zeros(shape: &[usize]) -> Self {
        Self::full(shape, 0.0)
    }

    pub fn ones(shape: &[usize]) -> Self {
        Self::full(shape, 1.0)
    }

    /// Samples every element independently from a standard normal distribution
    pub fn randn<R: Rng>(shape: &[usize], rng: &mut R) -> Self {
        let n = shape.iter().product();
        Self {
            shape: shape.to_vec(),
            data: (0..n)
                .map(|_| Value::new(rng.sample(StandardNormal)))
                .collect(),
        }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    pub fn numel(&self) -> usize {
        self.data.len()
    }

    pub fn values(&self) -> &[Value] {
        &self.data
    }

    /// Current data of every element, in row-major order
    pub fn to_vec(&self) -> Vec<f32> {
        self.data.iter().map(|v| v.data()).collect()
    }

    /// Applies `f` to every element
    pub fn map(&self, f: impl FnMut(&Value) -> Value) -> Tensor {
        Tensor {
            shape: self.shape.clone(),
            data: self.data.iter().map(f).collect(),
        }
    }

    /// Combines two tensors of identical shape element by element
    pub fn zip_with(
        &self,
        other: &Tensor,
        mut f: impl FnMut(&Value, &Value) -> Value,
    ) -> Result<Tensor, TensorError> {
        if self.shape != other.shape {
            return Err(TensorError::ShapeMismatch {
                lhs: self.shape.clone(),
                rhs: other.shape.clone(),
            });
        }
        Ok(Tensor {
            shape: self.shape.clone(),
            data: self
                .data
                .iter()
                .zip(other.data.iter())
                .map(|(a, b)| f(a, b))
                .collect(),
        })
    }

    pub fn add(&self, other: &Tensor) -> Result<Tensor, TensorError> {
        self.zip_with(other, |a, b| a + b)
    }

    pub fn sub(&self, other: &Tensor) -> Result<Tensor, TensorError> {
        self.zip_with(other, |a, b| a - b)
    }

    pub fn mul(&self, other: &Tensor) -> Result<Tensor, TensorError> {
        self.zip_with(other, |a, b| a * b)
    }

    pub fn add_scalar(&self, scalar: f32) -> Tensor {
        let scalar = Value::new(scalar);
        self.map(|v| v + &scalar)
    }

    pub fn mul_scalar(&self, scalar: f32) -> Tensor {
        let scalar = Value::new(scalar);
        self.map(|v| v * &scalar)
    }

    pub fn abs(&self) -> Tensor {
        self.map(|v| v.abs())
    }

    pub fn square(&self) -> Tensor {
        self.map(|v| v.square())
    }

    pub fn relu(&self) -> Tensor {
        self.map(|v| v.relu())
    }

    pub fn leaky_relu(&self, slope: f32) -> Tensor {
        self.map(|v| v.leaky_relu(slope))
    }

    pub fn sigmoid(&self) -> Tensor {
        self.map(|v| v.sigmoid())
    }

    pub fn tanh(&self) -> Tensor {
        self.map(|v| v.tanh())
    }

    /// Sum of all elements as a single graph node
    pub fn sum(&self) -> Value {
        Value::sum_of(self.data.clone())
    }

    /// Mean of all elements, NaN for an empty tensor
    pub fn mean(&self) -> Value {
        &self.sum() / &Value::new(self.numel() as f32)
    }

    /// Zero-pads the two spatial dimensions of an NHWC tensor by `pad` on each side
    pub fn pad2d(&self, pad: usize) -> Result<Tensor, TensorError> {
        let [n, h, w, c] = self.dims4()?;
        if pad == 0 {
            return Ok(self.clone());
        }
        let (ph, pw) = (h + 2 * pad, w + 2 * pad);
        let mut data = Vec::with_capacity(n * ph * pw * c);
        for b in 0..n {
            for y in 0..ph {
                for x in 0..pw {
                    let inside = (pad..pad + h).contains(&y) && (pad..pad + w).contains(&x);
                    for ch in 0..c {
                        if inside {
                            let idx = ((b * h + (y - pad)) * w + (x - pad)) * c + ch;
                            data.push(self.data[idx].clone());
                        } else {
                            data.push(Value::new(0.0));
                        }
                    }
                }
            }
        }
        Ok(Tensor {
            shape: vec![n, ph, pw, c],
            data,
        })
    }

    /// 2D convolution of an NHWC input without implicit padding.
    ///
    /// `kernel` has shape `[kh, kw, in_channels, out_channels]` and `bias` `[out_channels]`.
    pub fn conv2d(
        &self,
        kernel: &Tensor,
        bias: &Tensor,
        stride: usize,
    ) -> Result<Tensor, TensorError> {
        let [n, h, w, c] = self.dims4()?;
        let [kh, kw, kc, oc] = kernel.dims4()?;
        check_kernel(c, kc, oc, bias, stride)?;
        if h < kh || w < kw {
            return Err(TensorError::KernelTooLarge {
                input: [h, w],
                kernel: [kh, kw],
            });
        }
        let oh = (h - kh) / stride + 1;
        let ow = (w - kw) / stride + 1;

        let mut data = Vec::with_capacity(n * oh * ow * oc);
        for b in 0..n {
            for oy in 0..oh {
                for ox in 0..ow {
                    for o in 0..oc {
                        let mut terms = Vec::with_capacity(kh * kw * c + 1);
                        for ky in 0..kh {
                            for kx in 0..kw {
                                let (iy, ix) = (oy * stride + ky, ox * stride + kx);
                                for i in 0..c {
                                    let input = &self.data[((b * h + iy) * w + ix) * c + i];
                                    let weight = &kernel.data[((ky * kw + kx) * c + i) * oc + o];
                                    terms.push(input * weight);
                                }
                            }
                        }
                        terms.push(bias.data[o].clone());
                        data.push(Value::sum_of(terms));
                    }
                }
            }
        }
        Ok(Tensor {
            shape: vec![n, oh, ow, oc],
            data,
        })
    }

    /// 2D transposed convolution with "same" padding: each spatial dimension grows by
    /// exactly `stride`.
    ///
    /// `kernel` has shape `[kh, kw, out_channels, in_channels]` and `bias` `[out_channels]`.
    pub fn conv2d_transpose_same(
        &self,
        kernel: &Tensor,
        bias: &Tensor,
        stride: usize,
    ) -> Result<Tensor, TensorError> {
        let [n, h, w, c] = self.dims4()?;
        let [kh, kw, oc, kc] = kernel.dims4()?;
        check_kernel(c, kc, oc, bias, stride)?;
        let (oh, ow) = (h * stride, w * stride);
        let pad_top = same_padding(h, oh, kh, stride);
        let pad_left = same_padding(w, ow, kw, stride);

        let mut terms: Vec<Vec<Value>> = vec![Vec::new(); n * oh * ow * oc];
        for b in 0..n {
            for iy in 0..h {
                for ix in 0..w {
                    for ky in 0..kh {
                        let Some(oy) = (iy * stride + ky).checked_sub(pad_top) else {
                            continue;
                        };
                        if oy >= oh {
                            continue;
                        }
                        for kx in 0..kw {
                            let Some(ox) = (ix * stride + kx).checked_sub(pad_left) else {
                                continue;
                            };
                            if ox >= ow {
                                continue;
                            }
                            for i in 0..c {
                                let input = &self.data[((b * h + iy) * w + ix) * c + i];
                                for o in 0..oc {
                                    let weight = &kernel.data[((ky * kw + kx) * oc + o) * c + i];
                                    terms[((b * oh + oy) * ow + ox) * oc + o].push(input * weight);
                                }
                            }
                        }
                    }
                }
            }
        }
        let data = terms
            .into_iter()
            .enumerate()
            .map(|(idx, mut t)| {
                t.push(bias.data[idx % oc].clone());
                Value::sum_of(t)
            })
            .collect();
        Ok(Tensor {
            shape: vec![n, oh, ow, oc],
            data,
        })
    }

    /// Dimensions of a rank 4 tensor
    pub fn dims4(&self) -> Result<[usize; 4], TensorError> {
        match self.shape.as_slice() {
            &[n, h, w, c] => Ok([n, h, w, c]),
            _ => Err(TensorError::RankMismatch {
                expected: 4,
                got: self.rank(),
            }),
        }
    }
}

fn check_kernel(
    in_channels: usize,
    kernel_channels: usize,
    out_channels: usize,
    bias: &Tensor,
    stride: usize,
) -> Result<(), TensorError> {
    if stride == 0 {
        return Err(TensorError::InvalidStride);
    }
    if in_channels != kernel_channels {
        return Err(TensorError::ChannelMismatch {
            expected: kernel_channels,
            got: in_channels,
        });
    }
    if bias.shape() != [out_channels] {
        return Err(TensorError::ShapeMismatch {
            lhs: bias.shape().to_vec(),
            rhs: vec![out_channels],
        });
    }
    Ok(())
}

/// Leading padding of the convolution whose transpose maps `input` to `output`
fn same_padding(input: usize, output: usize, kernel: usize, stride: usize) -> usize {
    (input.saturating_sub(1) * stride + kernel).saturating_sub(output) / 2
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tensor")
            .field("shape", &self.shape)
            .field("data", &self.to_vec())
            .finish()
    }
}
