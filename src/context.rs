//! Registry of named parameters for one model-construction session
//!
//! Layers never own their weights. They look them up in a [`Context`] under a hierarchical
//! name built from [`Scope`]s, creating them on first use, so calling a layer twice with the
//! same scope shares its parameters. Similar to the torch `VarStore` / `Path` pair.

use std::{
    cell::RefCell,
    collections::BTreeMap,
    fmt,
    ops::Div,
    rc::Rc,
};

use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use rand_pcg::Pcg64Mcg;

use crate::{nn::NNError, tensor::Tensor, values::Value};

/// Initial values of a newly created parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Init {
    Zeros,
    Ones,
    /// Uniform in `[-l, l]` with `l = sqrt(6 / (fan_in + fan_out))`, the default for
    /// convolution kernels
    GlorotUniform,
    /// Normal with standard deviation `sqrt(2 / fan_in)`, suited to ReLU layers
    HeNormal,
}

impl Init {
    fn sample(self, shape: &[usize], rng: &mut Pcg64Mcg) -> Vec<f32> {
        let n: usize = shape.iter().product();
        let (fan_in, fan_out) = fans(shape);
        match self {
            Init::Zeros => vec![0.0; n],
            Init::Ones => vec![1.0; n],
            Init::GlorotUniform => {
                let limit = (6.0 / (fan_in + fan_out)).sqrt();
                (0..n).map(|_| rng.random_range(-limit..=limit)).collect()
            }
            Init::HeNormal => {
                let std = (2.0 / fan_in).sqrt();
                (0..n)
                    .map(|_| {
                        let z: f32 = rng.sample(StandardNormal);
                        z * std
                    })
                    .collect()
            }
        }
    }
}

/// Fan in and fan out of a kernel shaped `[..receptive field, in, out]`
fn fans(shape: &[usize]) -> (f32, f32) {
    match shape {
        [] => (1.0, 1.0),
        [n] => (*n as f32, *n as f32),
        [receptive @ .., fan_in, fan_out] => {
            let receptive: usize = receptive.iter().product();
            ((receptive * fan_in) as f32, (receptive * fan_out) as f32)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum ParamKind {
    /// Updated by an optimizer, optionally penalized by `l2_scale * sum(w^2) / 2`
    Trainable { l2_scale: Option<f32> },
    /// Running statistics maintained by the layers themselves
    Statistic,
}

struct Param {
    tensor: Tensor,
    init: Init,
    kind: ParamKind,
}

struct ContextInner {
    params: BTreeMap<String, Param>,
    rng: Pcg64Mcg,
}

/// Shared handle to the parameters and random state of a model
#[derive(Clone)]
pub struct Context(Rc<RefCell<ContextInner>>);

impl Context {
    /// Creates an empty registry whose initializers, noise and dropout draw from a
    /// generator seeded with `seed`
    pub fn new(seed: u64) -> Self {
        Self(Rc::new(RefCell::new(ContextInner {
            params: BTreeMap::new(),
            rng: Pcg64Mcg::seed_from_u64(seed),
        })))
    }

    /// The unnamed top level scope
    pub fn root(&self) -> Scope {
        Scope {
            ctx: self.clone(),
            path: String::new(),
        }
    }

    /// Number of registered parameters, statistics included
    pub fn len(&self) -> usize {
        self.0.borrow().params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.borrow().params.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.borrow().params.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<Tensor> {
        self.0.borrow().params.get(name).map(|p| p.tensor.clone())
    }

    /// Parameters an optimizer should update, sorted by name
    pub fn trainable_params(&self) -> Vec<(String, Tensor)> {
        self.0
            .borrow()
            .params
            .iter()
            .filter(|(_, p)| matches!(p.kind, ParamKind::Trainable { .. }))
            .map(|(name, p)| (name.clone(), p.tensor.clone()))
            .collect()
    }

    /// Every registered tensor, sorted by name
    pub fn params(&self) -> Vec<(String, Tensor)> {
        self.0
            .borrow()
            .params
            .iter()
            .map(|(name, p)| (name.clone(), p.tensor.clone()))
            .collect()
    }

    /// Sum of the L2 penalties of every regularized parameter
    pub fn regularization_loss(&self) -> Value {
        let inner = self.0.borrow();
        let penalties = inner
            .params
            .values()
            .filter_map(|p| match p.kind {
                ParamKind::Trainable {
                    l2_scale: Some(scale),
                } => Some(&Value::new(scale / 2.0) * &p.tensor.square().sum()),
                _ => None,
            })
            .collect();
        Value::sum_of(penalties)
    }

    pub(crate) fn with_rng<T>(&self, f: impl FnOnce(&mut Pcg64Mcg) -> T) -> T {
        f(&mut self.0.borrow_mut().rng)
    }

    fn get_or_create(
        &self,
        name: String,
        shape: &[usize],
        init: Init,
        kind: ParamKind,
    ) -> Result<Tensor, NNError> {
        let mut inner = self.0.borrow_mut();
        if let Some(param) = inner.params.get(&name) {
            if param.tensor.shape() != shape {
                return Err(NNError::ParamShapeMismatch {
                    name,
                    expected: param.tensor.shape().to_vec(),
                    got: shape.to_vec(),
                });
            }
            if param.init != init || param.kind != kind {
                log::warn!(
                    "parameter {} reused with {:?}/{:?}, created with {:?}/{:?}",
                    name,
                    init,
                    kind,
                    param.init,
                    param.kind
                );
            }
            log::trace!("reusing parameter {}", name);
            return Ok(param.tensor.clone());
        }

        let ContextInner { params, rng } = &mut *inner;
        let tensor = Tensor::from_vec(shape, init.sample(shape, rng))?;
        log::debug!("creating parameter {} {:?} ({:?})", name, shape, init);
        params.insert(
            name,
            Param {
                tensor: tensor.clone(),
                init,
                kind,
            },
        );
        Ok(tensor)
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new(0)
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.0.borrow();
        f.debug_map()
            .entries(inner.params.iter().map(|(name, p)| (name, p.tensor.shape())))
            .finish()
    }
}

/// A position in the parameter name hierarchy, e.g. `resblock_0/res1`
#[derive(Debug, Clone)]
pub struct Scope {
    ctx: Context,
    path: String,
}

impl Scope {
    /// Full `/` separated name of this scope
    pub fn name(&self) -> &str {
        &self.path
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    /// Nested scope `self/name`
    pub fn sub(&self, name: &str) -> Scope {
        Scope {
            ctx: self.ctx.clone(),
            path: self.qualify(name),
        }
    }

    /// Gets or creates a trainable parameter named `name` in this scope
    pub fn param(&self, name: &str, shape: &[usize], init: Init) -> Result<Tensor, NNError> {
        self.ctx.get_or_create(
            self.qualify(name),
            shape,
            init,
            ParamKind::Trainable { l2_scale: None },
        )
    }

    /// Like [`Scope::param`], also contributing `l2_scale * sum(w^2) / 2` to
    /// [`Context::regularization_loss`]
    pub fn regularized_param(
        &self,
        name: &str,
        shape: &[usize],
        init: Init,
        l2_scale: f32,
    ) -> Result<Tensor, NNError> {
        self.ctx.get_or_create(
            self.qualify(name),
            shape,
            init,
            ParamKind::Trainable {
                l2_scale: Some(l2_scale),
            },
        )
    }

    /// Gets or creates a non-trainable tensor, such as a moving average
    pub fn statistic(&self, name: &str, shape: &[usize], init: Init) -> Result<Tensor, NNError> {
        self.ctx
            .get_or_create(self.qualify(name), shape, init, ParamKind::Statistic)
    }

    fn qualify(&self, name: &str) -> String {
        if self.path.is_empty() {
            name.to_string()
        } else {
            format!("{}/{}", self.path, name)
        }
    }
}

impl Div<&str> for &Scope {
    type Output = Scope;

    fn div(self, rhs: &str) -> Scope {
        self.sub(rhs)
    }
}

impl Div<&str> for Scope {
    type Output = Scope;

    fn div(self, rhs: &str) -> Scope {
        self.sub(rhs)
    }
}
