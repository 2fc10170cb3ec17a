//! Convolutional building blocks and adversarial losses for GANs, built on a minimal
//! scalar autograd engine.
//!
//! Layers look up their weights by name in a [`context::Context`], so a model is assembled by
//! calling functions such as [`nn::conv`] and [`nn::resblock`] with nested
//! [`context::Scope`]s, then trained against [`loss::discriminator_loss`] and
//! [`loss::generator_loss`].

pub mod backprop_fns;
pub mod context;
pub mod loss;
pub mod nn;
pub mod tensor;
pub mod values;
