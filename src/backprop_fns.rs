//! Incremental gradient update functions for backprop
//!
//! Applied depending on the operation which created outputs from inputs. Corresponds to
//! a node in the computation graph.

use crate::values::Value;

/// Represents the function in the computation graph
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackpropFunc {
    Add,
    Sub,
    Mul,
    Div,
    Neg,
    Pow,
    ReLU,
    /// Second operand holds the (constant) negative slope
    LeakyReLU,
    Exp,
    Ln,
    Abs,
    Square,
    Sigmoid,
    Tanh,
    /// Sum of an arbitrary number of operands
    Sum,
}

impl BackpropFunc {
    /// Number of operands, `None` for variadic functions
    pub fn n_operands(&self) -> Option<usize> {
        match self {
            BackpropFunc::Add => Some(2),
            BackpropFunc::Sub => Some(2),
            BackpropFunc::Mul => Some(2),
            BackpropFunc::Div => Some(2),
            BackpropFunc::Neg => Some(1),
            BackpropFunc::Pow => Some(2),
            BackpropFunc::ReLU => Some(1),
            BackpropFunc::LeakyReLU => Some(2),
            BackpropFunc::Exp => Some(1),
            BackpropFunc::Ln => Some(1),
            BackpropFunc::Abs => Some(1),
            BackpropFunc::Square => Some(1),
            BackpropFunc::Sigmoid => Some(1),
            BackpropFunc::Tanh => Some(1),
            BackpropFunc::Sum => None,
        }
    }
}

// The same value may appear as both operands (e.g. `x * x`), so every update reads the
// data it needs before mutably borrowing an input.

/// Takes two values and updates their gradients
/// Represents backprop for the operation `in1 + in2 = out`
pub fn add(in1: &Value, in2: &Value, out: &Value) {
    let grad = out.grad();
    in1.0.borrow_mut().grad += grad;
    in2.0.borrow_mut().grad += grad;
}

/// Represents backprop for the operation `in1 - in2 = out`
pub fn sub(in1: &Value, in2: &Value, out: &Value) {
    let grad = out.grad();
    in1.0.borrow_mut().grad += grad;
    in2.0.borrow_mut().grad += -grad;
}

/// Represents backprop for the operation `in1 * in2 = out`
pub fn mul(in1: &Value, in2: &Value, out: &Value) {
    let grad = out.grad();
    let in1_data = in1.data();
    let in2_data = in2.data();
    in1.0.borrow_mut().grad += in2_data * grad;
    in2.0.borrow_mut().grad += in1_data * grad;
}

/// Represents backprop for the operation `in1 / in2 = out`
pub fn div(in1: &Value, in2: &Value, out: &Value) {
    let grad = out.grad();
    let in1_data = in1.data();
    let in2_data = in2.data();
    in1.0.borrow_mut().grad += grad / in2_data;
    in2.0.borrow_mut().grad += -in1_data * grad / (in2_data.powf(2.0));
}

/// Represents backprop for the operation `-in = out`
pub fn neg(in1: &Value, out: &Value) {
    in1.0.borrow_mut().grad += -out.grad();
}

/// Represents backprop for the operation `in1^in2 = out`
/// da^b/db is only defined for positive a, otherwise no gradient reaches the exponent
pub fn pow(in1: &Value, in2: &Value, out: &Value) {
    let grad = out.grad();
    let in1_data = in1.data();
    let in2_data = in2.data();
    let out_data = out.data();
    in1.0.borrow_mut().grad += in2_data * in1_data.powf(in2_data - 1.0) * grad;
    if in1_data > 0.0 {
        in2.0.borrow_mut().grad += out_data * in1_data.ln() * grad;
    }
}

/// Represents backprop for the operation `relu(in) = out`
pub fn relu(in1: &Value, out: &Value) {
    let in1_data = in1.data();
    let grad = out.grad();
    in1.0.borrow_mut().grad += if in1_data > 0.0 { grad } else { 0.0 };
}

/// Represents backprop for the operation `leaky_relu(in1, slope = in2) = out`,
/// the slope is a constant and receives no gradient
pub fn leaky_relu(in1: &Value, in2: &Value, out: &Value) {
    let in1_data = in1.data();
    let slope = in2.data();
    let grad = out.grad();
    in1.0.borrow_mut().grad += if in1_data > 0.0 { grad } else { slope * grad };
}

/// Represents backprop for the operation `exp(in) = out`
pub fn exp(in1: &Value, out: &Value) {
    let grad = out.grad(); // accumulated gradient
    let out_data = out.data(); // exp(in)
    in1.0.borrow_mut().grad += out_data * grad;
}

/// Represents backprop for the operation `ln(in) = out`
pub fn ln(in1: &Value, out: &Value) {
    let grad = out.grad();
    let in1_data = in1.data();
    in1.0.borrow_mut().grad += grad / in1_data;
}

/// Represents backprop for the operation `|in| = out`, using a zero subgradient at 0
pub fn abs(in1: &Value, out: &Value) {
    let grad = out.grad();
    let in1_data = in1.data();
    let sign = if in1_data > 0.0 {
        1.0
    } else if in1_data < 0.0 {
        -1.0
    } else {
        0.0
    };
    in1.0.borrow_mut().grad += sign * grad;
}

/// Represents backprop for the operation `in^2 = out`
pub fn square(in1: &Value, out: &Value) {
    let grad = out.grad();
    let in1_data = in1.data();
    in1.0.borrow_mut().grad += 2.0 * in1_data * grad;
}

/// Represents backprop for the operation `sigmoid(in) = out`
pub fn sigmoid(in1: &Value, out: &Value) {
    let grad = out.grad();
    let s = out.data();
    in1.0.borrow_mut().grad += s * (1.0 - s) * grad;
}

/// Represents backprop for the operation `tanh(in) = out`
pub fn tanh(in1: &Value, out: &Value) {
    let grad = out.grad();
    let t = out.data();
    in1.0.borrow_mut().grad += (1.0 - t * t) * grad;
}

/// Represents backprop for the operation `in1 + in2 + ... + inN = out`
pub fn sum(inputs: &[Value], out: &Value) {
    let grad = out.grad();
    for input in inputs {
        input.0.borrow_mut().grad += grad;
    }
}

/// Applies a backprop function for operators with two operands
pub fn update_gradients_two_operands(in1: &Value, in2: &Value, out: &Value) {
    let backprop_fn = { out.0.borrow().backprop_fn };
    match backprop_fn {
        Some(BackpropFunc::Add) => add(in1, in2, out),
        Some(BackpropFunc::Sub) => sub(in1, in2, out),
        Some(BackpropFunc::Mul) => mul(in1, in2, out),
        Some(BackpropFunc::Div) => div(in1, in2, out),
        Some(BackpropFunc::Pow) => pow(in1, in2, out),
        Some(BackpropFunc::LeakyReLU) => leaky_relu(in1, in2, out),
        Some(BackpropFunc::Sum) => sum(&[in1.clone(), in2.clone()], out),
        None => {}
        _ => panic!("Invalid backprop function: {:?}", backprop_fn),
    }
}

/// Applies a backprop function for operators with one operand
pub fn update_gradients_one_operand(in1: &Value, out: &Value) {
    let backprop_fn = { out.0.borrow().backprop_fn };
    match backprop_fn {
        Some(BackpropFunc::Neg) => neg(in1, out),
        Some(BackpropFunc::ReLU) => relu(in1, out),
        Some(BackpropFunc::Exp) => exp(in1, out),
        Some(BackpropFunc::Ln) => ln(in1, out),
        Some(BackpropFunc::Abs) => abs(in1, out),
        Some(BackpropFunc::Square) => square(in1, out),
        Some(BackpropFunc::Sigmoid) => sigmoid(in1, out),
        Some(BackpropFunc::Tanh) => tanh(in1, out),
        Some(BackpropFunc::Sum) => sum(std::slice::from_ref(in1), out),
        None => {}
        _ => panic!("Invalid backprop function: {:?}", backprop_fn),
    }
}

/// Applies a backprop function for variadic operators
pub fn update_gradients_many_operands(inputs: &[Value], out: &Value) {
    let backprop_fn = { out.0.borrow().backprop_fn };
    match backprop_fn {
        Some(BackpropFunc::Sum) => sum(inputs, out),
        None => {}
        _ => panic!(
            "Invalid backprop function for {} operands: {:?}",
            inputs.len(),
            backprop_fn
        ),
    }
}
