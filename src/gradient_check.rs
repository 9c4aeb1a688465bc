//! Finite-difference gradient oracle.
//!
//! These helpers estimate gradients by centered differences, one coordinate at a
//! time. They are slow and only meant to validate hand-written backward passes:
//!
//! - [`eval_numerical_gradient`] for scalar-valued functions (losses),
//! - [`eval_numerical_gradient_array`] for tensor-valued functions, contracted with an
//!   upstream gradient `dout`,
//! - [`eval_numerical_gradient_param`] for a parameter living inside a [`Classifier`].
//!
//! Compare the results with [`rel_error`].

use crate::net::Classifier;
use crate::tensor::{Scalar, cast};
use crate::{Error, Result, Tensor};

/// Default perturbation size.
pub const DEFAULT_STEP: f64 = 1e-5;

/// Numerical gradient of a scalar function `f` at `x`.
///
/// `df/dx[i] ≈ (f(x + h e_i) - f(x - h e_i)) / 2h`
pub fn eval_numerical_gradient<T, F>(mut f: F, x: &Tensor<T>, h: f64) -> Result<Tensor<T>>
where
    T: Scalar,
    F: FnMut(&Tensor<T>) -> Result<T>,
{
    let h_t: T = cast(h);
    let two_h = h_t + h_t;
    let mut xv = x.clone();
    let mut grad = x.zeros_like();

    for i in 0..xv.len() {
        let orig = xv.data()[i];

        xv.data_mut()[i] = orig + h_t;
        let f_plus = f(&xv)?;
        xv.data_mut()[i] = orig - h_t;
        let f_minus = f(&xv)?;
        xv.data_mut()[i] = orig;

        grad.data_mut()[i] = (f_plus - f_minus) / two_h;
    }
    Ok(grad)
}

/// Numerical gradient of `sum(f(x) * dout)` at `x`, for a tensor-valued `f`.
pub fn eval_numerical_gradient_array<T, F>(
    mut f: F,
    x: &Tensor<T>,
    dout: &Tensor<T>,
    h: f64,
) -> Result<Tensor<T>>
where
    T: Scalar,
    F: FnMut(&Tensor<T>) -> Result<Tensor<T>>,
{
    let h_t: T = cast(h);
    let two_h = h_t + h_t;
    let mut xv = x.clone();
    let mut grad = x.zeros_like();

    for i in 0..xv.len() {
        let orig = xv.data()[i];

        xv.data_mut()[i] = orig + h_t;
        let pos = f(&xv)?;
        xv.data_mut()[i] = orig - h_t;
        let neg = f(&xv)?;
        xv.data_mut()[i] = orig;

        let weighted = pos.sub(&neg)?.mul(dout)?.sum();
        grad.data_mut()[i] = weighted / two_h;
    }
    Ok(grad)
}

/// Numerical gradient of `loss(model)` with respect to the parameter `name`.
///
/// The parameter is perturbed in place and restored after each evaluation.
pub fn eval_numerical_gradient_param<T, M, F>(
    model: &mut M,
    name: &str,
    mut loss: F,
    h: f64,
) -> Result<Tensor<T>>
where
    T: Scalar,
    M: Classifier<T>,
    F: FnMut(&mut M) -> Result<T>,
{
    let h_t: T = cast(h);
    let two_h = h_t + h_t;
    let len = model
        .params()
        .get(name)
        .ok_or_else(|| Error::UnknownParameter(name.to_owned()))?
        .len();
    let mut grad = Vec::with_capacity(len);

    for i in 0..len {
        let orig = param_slot(model, name, i, None)?;

        param_slot(model, name, i, Some(orig + h_t))?;
        let f_plus = loss(model);
        param_slot(model, name, i, Some(orig - h_t))?;
        let f_minus = loss(model);
        param_slot(model, name, i, Some(orig))?;

        grad.push((f_plus? - f_minus?) / two_h);
    }

    let shape = model
        .params()
        .get(name)
        .map(|p| p.shape().to_vec())
        .unwrap_or_default();
    Tensor::from_vec(&shape, grad)
}

/// Read element `i` of parameter `name`, optionally overwriting it first.
fn param_slot<T: Scalar, M: Classifier<T>>(
    model: &mut M,
    name: &str,
    i: usize,
    value: Option<T>,
) -> Result<T> {
    let p = model
        .params_mut()
        .get_mut(name)
        .ok_or_else(|| Error::UnknownParameter(name.to_owned()))?;
    let slot = &mut p.data_mut()[i];
    if let Some(v) = value {
        *slot = v;
    }
    Ok(*slot)
}

/// Maximum elementwise relative error `|x - y| / max(1e-8, |x| + |y|)`.
pub fn rel_error<T: Scalar>(x: &Tensor<T>, y: &Tensor<T>) -> Result<f64> {
    if x.shape() != y.shape() {
        return Err(Error::shape("rel_error", x.shape(), y.shape()));
    }
    let floor = 1e-8_f64;
    Ok(x.data()
        .iter()
        .zip(y.data())
        .map(|(&a, &b)| {
            let (a, b) = (crate::tensor::to_f64(a), crate::tensor::to_f64(b));
            (a - b).abs() / floor.max(a.abs() + b.abs())
        })
        .fold(0.0, f64::max))
}
