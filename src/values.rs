//! Scalar values which form a computation graph
use std::{
    cell::RefCell,
    collections::HashSet,
    iter::Sum,
    ops::{Add, Div, Mul, Neg, Sub},
    rc::Rc,
};

use rand::Rng;

use crate::backprop_fns::{
    BackpropFunc, update_gradients_many_operands, update_gradients_one_operand,
    update_gradients_two_operands,
};

type SharedValue = Rc<RefCell<InnerValue>>;

/// Newtype representing a shared value in a computation graph
#[derive(Debug, Clone)]
pub struct Value(pub(crate) SharedValue);

impl Value {
    /// Create a new value, not derived from any other values
    pub fn new(data: f32) -> Self {
        Self(Rc::new(RefCell::new(InnerValue::new(data, None))))
    }

    /// Create a new value derived from an operation between two values (i.e. not a leaf node)
    fn new_derived(data: f32, backprop_fn: BackpropFunc) -> Self {
        Self(Rc::new(RefCell::new(InnerValue::new(
            data,
            Some(backprop_fn),
        ))))
    }

    fn add_child(&self, child: Value) {
        self.0.borrow_mut().children.push(child.0);
    }

    pub fn data(&self) -> f32 {
        self.0.borrow().data
    }

    pub fn grad(&self) -> f32 {
        self.0.borrow().grad
    }

    // Strictly, &mut isn't needed since the value is behind a shared mutable type,
    // but it indicates that the value should be excusively mutable
    pub fn set_data(&mut self, data: f32) {
        self.0.borrow_mut().data = data;
    }

    /// Unlike PyTorch which only zeros out the gradients of the leaf nodes, this zeros out
    /// all gradients in the computation graph which are children of this node
    pub fn zero_grad(&mut self) {
        for value in self.topological_order() {
            value.0.borrow_mut().grad = 0.0;
        }
    }

    pub fn backward(&self) {
        // d out / d out = 1
        self.0.borrow_mut().grad = 1.0;

        // apply backprop, reversed to start from root first
        for value in self.topological_order().into_iter().rev() {
            let children: Vec<Value> = value
                .0
                .borrow()
                .children
                .iter()
                .map(|c| Value(c.clone()))
                .collect();
            if let Some(n_operands) = value.0.borrow().backprop_fn.and_then(|f| f.n_operands()) {
                debug_assert!(n_operands == children.len());
            }
            match children.as_slice() {
                [] => {}
                [in1] => update_gradients_one_operand(in1, &value),
                [in1, in2] => update_gradients_two_operands(in1, in2, &value),
                inputs => update_gradients_many_operands(inputs, &value),
            }
        }
    }

    /// Nodes of the graph rooted at this value in post order (children before parents).
    ///
    /// Iterative so that the deep graphs built by convolutions and reductions cannot
    /// overflow the stack.
    fn topological_order(&self) -> Vec<Value> {
        let mut order = vec![];
        let mut visited: HashSet<u64> = HashSet::new();
        let mut stack = vec![(self.clone(), false)];
        while let Some((value, expanded)) = stack.pop() {
            if expanded {
                order.push(value);
                continue;
            }
            if !visited.insert(value.id()) {
                continue;
            }
            stack.push((value.clone(), true));
            for c in value.0.borrow().children.iter() {
                if !visited.contains(&c.borrow().id) {
                    stack.push((Value(c.clone()), false));
                }
            }
        }
        order
    }

    fn id(&self) -> u64 {
        self.0.borrow().id
    }

    /// Sum of any number of values as a single node in the graph
    pub fn sum_of(values: Vec<Value>) -> Value {
        let data = values.iter().map(|v| v.data()).sum();
        let result = Value::new_derived(data, BackpropFunc::Sum);
        for v in values {
            result.add_child(v);
        }

        result
    }
}

// Various operations on values
impl Value {
    pub fn pow(&self, other: &Value) -> Value {
        let result = Value::new_derived(self.data().powf(other.data()), BackpropFunc::Pow);
        result.add_child(self.clone());
        result.add_child(other.clone());

        result
    }

    pub fn relu(&self) -> Value {
        self.unary(self.data().max(0.0), BackpropFunc::ReLU)
    }

    /// `x` for positive inputs, `slope * x` otherwise
    pub fn leaky_relu(&self, slope: f32) -> Value {
        let data = self.data();
        let data = if data > 0.0 { data } else { slope * data };
        let result = Value::new_derived(data, BackpropFunc::LeakyReLU);
        result.add_child(self.clone());
        result.add_child(Value::new(slope));

        result
    }

    pub fn exp(&self) -> Value {
        self.unary(self.data().exp(), BackpropFunc::Exp)
    }

    pub fn ln(&self) -> Value {
        self.unary(self.data().ln(), BackpropFunc::Ln)
    }

    pub fn abs(&self) -> Value {
        self.unary(self.data().abs(), BackpropFunc::Abs)
    }

    pub fn square(&self) -> Value {
        let data = self.data();
        self.unary(data * data, BackpropFunc::Square)
    }

    pub fn sigmoid(&self) -> Value {
        self.unary(1.0 / (1.0 + (-self.data()).exp()), BackpropFunc::Sigmoid)
    }

    pub fn tanh(&self) -> Value {
        self.unary(self.data().tanh(), BackpropFunc::Tanh)
    }

    fn unary(&self, data: f32, backprop_fn: BackpropFunc) -> Value {
        let result = Value::new_derived(data, backprop_fn);
        result.add_child(self.clone());

        result
    }
}

impl Add for &Value {
    type Output = Value;

    fn add(self, other: &Value) -> Value {
        let data = self.0.borrow().data + other.0.borrow().data;

        let result = Value::new_derived(data, BackpropFunc::Add);
        result.add_child(self.clone());
        result.add_child(other.clone());

        result
    }
}

impl Sub for &Value {
    type Output = Value;

    fn sub(self, other: &Value) -> Value {
        let result = Value::new_derived(
            self.0.borrow().data - other.0.borrow().data,
            BackpropFunc::Sub,
        );
        result.add_child(self.clone());
        result.add_child(other.clone());

        result
    }
}

impl Mul for &Value {
    type Output = Value;

    fn mul(self, other: &Value) -> Value {
        let result = Value::new_derived(
            self.0.borrow().data * other.0.borrow().data,
            BackpropFunc::Mul,
        );
        result.add_child(self.clone());
        result.add_child(other.clone());

        result
    }
}

impl Div for &Value {
    type Output = Value;

    fn div(self, other: &Value) -> Value {
        let result = Value::new_derived(
            self.0.borrow().data / other.0.borrow().data,
            BackpropFunc::Div,
        );
        result.add_child(self.clone());
        result.add_child(other.clone());

        result
    }
}

impl Neg for &Value {
    type Output = Value;

    fn neg(self) -> Value {
        let result = Value::new_derived(-self.0.borrow().data, BackpropFunc::Neg);
        result.add_child(self.clone());

        result
    }
}

impl Sum for Value {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        Value::sum_of(iter.collect())
    }
}

/// Convenience macro to implement operations on `[Value]` when ownership can be transferred
macro_rules! impl_arithmetic(
    ($trait:ident, $trait_method:ident, $operator:tt, $struct:ident) => {
        impl $trait for $struct {
            type Output = Self;

            fn $trait_method(self, other: Self) -> Self {
                &self $operator &other
            }
        }
    }
);
impl_arithmetic!(Add, add, +, Value);
impl_arithmetic!(Sub, sub, -, Value);
impl_arithmetic!(Mul, mul, *, Value);
impl_arithmetic!(Div, div, /, Value);

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.0.borrow().data == other.0.borrow().data
    }
}

impl Eq for Value {}

#[derive(Debug)]
pub(crate) struct InnerValue {
    // the network uses 32 bit precision floats (roughly 7 decimal digits of precision)
    pub(crate) data: f32,
    /// gradient of the value with respect to the output
    pub(crate) grad: f32,
    /// List of the node inputs in the forward pass
    /// These nodes are "children" in the backwards pass
    children: Vec<SharedValue>,
    /// Unique identifier for the node
    id: u64,
    /// The function which created this value from its children
    /// `None` when the value is a leaf node
    pub(crate) backprop_fn: Option<BackpropFunc>,
}

impl InnerValue {
    pub fn new(data: f32, backprop_fn: Option<BackpropFunc>) -> Self {
        Self {
            data,
            grad: 0.0,
            children: vec![],
            id: generate_random_id(),
            backprop_fn,
        }
    }
}

fn generate_random_id() -> u64 {
    let mut rng = rand::rng();
    rng.random() // generates a random u64
}
