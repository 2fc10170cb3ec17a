//! Loss functions for adversarial training

use crate::{
    tensor::{Tensor, TensorError},
    values::Value,
};

/// Soft target for real samples when label smoothing is on
pub const SMOOTHED_REAL_LABEL: f32 = 0.9;

/// Selects the formulation of [`discriminator_loss`] and [`generator_loss`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GanLossConfig {
    /// One-sided label smoothing: real targets are 0.9 instead of 1
    pub smoothing: bool,
    /// Least squares (LSGAN) instead of sigmoid cross entropy
    pub least_squares: bool,
}

impl GanLossConfig {
    fn real_label(&self) -> f32 {
        if self.smoothing {
            SMOOTHED_REAL_LABEL
        } else {
            1.0
        }
    }
}

/// Element-wise `max(x, 0) - x * label + ln(1 + exp(-|x|))`, the numerically stable form of
/// the cross entropy between `sigmoid(x)` and `label`.
///
/// The branch is picked with `x >= 0`, so the gradient at a zero logit is
/// `sigmoid(0) - label`.
pub fn sigmoid_cross_entropy_with_logits(logits: &Tensor, label: f32) -> Tensor {
    let label = Value::new(label);
    let one = Value::new(1.0);
    logits.map(|x| {
        let (positive, neg_abs) = if x.data() >= 0.0 {
            (x.clone(), -x)
        } else {
            (Value::new(0.0), x.clone())
        };
        let softplus = (&one + &neg_abs.exp()).ln();
        &(&positive - &(x * &label)) + &softplus
    })
}

/// Mean of `(x - target)^2`
fn mean_squared_difference(x: &Tensor, target: f32) -> Value {
    x.add_scalar(-target).square().mean()
}

/// Loss of a discriminator scoring `real` and `fake` samples (logits in cross entropy mode)
pub fn discriminator_loss(real: &Tensor, fake: &Tensor, config: GanLossConfig) -> Value {
    let target = config.real_label();
    let (real_loss, fake_loss) = if config.least_squares {
        (
            mean_squared_difference(real, target),
            fake.square().mean(),
        )
    } else {
        (
            sigmoid_cross_entropy_with_logits(real, target).mean(),
            sigmoid_cross_entropy_with_logits(fake, 0.0).mean(),
        )
    };
    log::debug!(
        "discriminator real loss {}, fake loss {}",
        real_loss.data(),
        fake_loss.data()
    );
    &(&real_loss + &fake_loss) * &Value::new(0.5)
}

/// Loss of a generator whose samples the discriminator scored as `fake`
pub fn generator_loss(fake: &Tensor, config: GanLossConfig) -> Value {
    let target = config.real_label();
    if config.least_squares {
        mean_squared_difference(fake, target)
    } else {
        sigmoid_cross_entropy_with_logits(fake, target).mean()
    }
}

/// `mean(mu^2)`, the KL divergence between `N(mu, 1)` and `N(0, 1)` up to a constant factor
pub fn kl_divergence(mu: &Tensor) -> Value {
    mu.square().mean()
}

/// Mean absolute difference of two tensors of equal shape
pub fn l1_loss(x: &Tensor, y: &Tensor) -> Result<Value, TensorError> {
    Ok(x.sub(y)?.abs().mean())
}
