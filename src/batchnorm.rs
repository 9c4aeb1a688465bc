//! Batch normalization over the feature axis of an `(N, D)` batch.
//!
//! In [`Mode::Train`] each feature is normalized with the statistics of the current
//! batch, and an exponential moving average of those statistics is folded into the
//! layer's [`BatchNormParam`]:
//!
//! ```text
//! running_mean = momentum * running_mean + (1 - momentum) * batch_mean
//! running_var  = momentum * running_var  + (1 - momentum) * batch_var
//! ```
//!
//! In [`Mode::Test`] the running statistics are used as-is and never written.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::tensor::{Scalar, Tensor, cast};
use crate::{Error, Result};

pub const DEFAULT_EPS: f64 = 1e-5;
pub const DEFAULT_MOMENTUM: f64 = 0.9;

#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    #[default]
    Train,
    Test,
}

/// Per-layer batch-norm configuration and running statistics.
///
/// Running statistics start out as zeros, sized on the first call.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchNormParam<T> {
    pub mode: Mode,
    pub eps: T,
    pub momentum: T,
    running_mean: Option<Tensor<T>>,
    running_var: Option<Tensor<T>>,
}

impl<T: Scalar> Default for BatchNormParam<T> {
    fn default() -> Self {
        Self::new(Mode::Train)
    }
}

impl<T: Scalar> BatchNormParam<T> {
    pub fn new(mode: Mode) -> Self {
        Self {
            mode,
            eps: cast(DEFAULT_EPS),
            momentum: cast(DEFAULT_MOMENTUM),
            running_mean: None,
            running_var: None,
        }
    }

    pub fn with_eps(mut self, eps: T) -> Self {
        self.eps = eps;
        self
    }

    pub fn with_momentum(mut self, momentum: T) -> Self {
        self.momentum = momentum;
        self
    }

    pub fn running_mean(&self) -> Option<&Tensor<T>> {
        self.running_mean.as_ref()
    }

    pub fn running_var(&self) -> Option<&Tensor<T>> {
        self.running_var.as_ref()
    }

    /// Overwrite both running statistics. They must be 1-D and the same length.
    pub fn set_running_stats(&mut self, mean: Tensor<T>, var: Tensor<T>) -> Result<()> {
        if mean.ndim() != 1 || mean.shape() != var.shape() {
            return Err(Error::shape("set_running_stats", mean.shape(), var.shape()));
        }
        self.running_mean = Some(mean);
        self.running_var = Some(var);
        Ok(())
    }
}

/// Values saved by a forward pass for [`batchnorm_backward`].
#[derive(Debug, Clone)]
pub struct BatchNormCache<T> {
    mode: Mode,
    x_hat: Tensor<T>,
    gamma: Tensor<T>,
    mean: Vec<T>,
    var: Vec<T>,
    inv_std: Vec<T>,
}

impl<T: Scalar> BatchNormCache<T> {
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Statistics used for normalization (batch or running, depending on mode).
    pub fn stats(&self) -> (&[T], &[T]) {
        (&self.mean, &self.var)
    }
}

#[derive(Debug, Clone)]
pub struct BatchNormGrads<T> {
    pub dx: Tensor<T>,
    pub dgamma: Tensor<T>,
    pub dbeta: Tensor<T>,
}

/// Forward pass; `bn.mode` selects batch or running statistics.
pub fn batchnorm_forward<T: Scalar>(
    x: &Tensor<T>,
    gamma: &Tensor<T>,
    beta: &Tensor<T>,
    bn: &mut BatchNormParam<T>,
) -> Result<(Tensor<T>, BatchNormCache<T>)> {
    match bn.mode {
        Mode::Train => batchnorm_forward_train(x, gamma, beta, bn),
        Mode::Test => batchnorm_forward_eval(x, gamma, beta, bn),
    }
}

/// Test-mode forward pass. Reads the running statistics regardless of `bn.mode`.
pub fn batchnorm_forward_eval<T: Scalar>(
    x: &Tensor<T>,
    gamma: &Tensor<T>,
    beta: &Tensor<T>,
    bn: &BatchNormParam<T>,
) -> Result<(Tensor<T>, BatchNormCache<T>)> {
    let (_, d) = check_dims(x, gamma, beta)?;
    let mean = stat_or_zeros(bn.running_mean.as_ref(), d)?;
    let var = stat_or_zeros(bn.running_var.as_ref(), d)?;
    normalize(x, gamma, beta, Mode::Test, mean, var, bn.eps)
}

/// Training-mode forward pass. Uses batch statistics and folds them into the
/// running averages regardless of `bn.mode`.
pub fn batchnorm_forward_train<T: Scalar>(
    x: &Tensor<T>,
    gamma: &Tensor<T>,
    beta: &Tensor<T>,
    bn: &mut BatchNormParam<T>,
) -> Result<(Tensor<T>, BatchNormCache<T>)> {
    let (n, d) = check_dims(x, gamma, beta)?;
    if n == 0 {
        return Err(Error::InvalidData(
            "batch norm needs at least one sample in training mode".to_owned(),
        ));
    }
    let inv_n: T = cast(1.0 / n as f64);
    let xs = x.data();

    let mut mean = vec![T::zero(); d];
    for row in xs.chunks_exact(d) {
        for (m, &v) in mean.iter_mut().zip(row) {
            *m = *m + v;
        }
    }
    mean.iter_mut().for_each(|m| *m = *m * inv_n);

    let mut var = vec![T::zero(); d];
    for row in xs.chunks_exact(d) {
        for ((s, &v), &m) in var.iter_mut().zip(row).zip(&mean) {
            let c = v - m;
            *s = *s + c * c;
        }
    }
    var.iter_mut().for_each(|s| *s = *s * inv_n);

    let momentum = bn.momentum;
    let keep = T::one() - momentum;
    let running_mean = bn
        .running_mean
        .get_or_insert_with(|| Tensor::zeros(&[d]));
    if running_mean.shape() != [d] {
        return Err(Error::shape("batchnorm running_mean", &[d], running_mean.shape()));
    }
    for (r, &m) in running_mean.data_mut().iter_mut().zip(&mean) {
        *r = momentum * *r + keep * m;
    }
    let running_var = bn.running_var.get_or_insert_with(|| Tensor::zeros(&[d]));
    if running_var.shape() != [d] {
        return Err(Error::shape("batchnorm running_var", &[d], running_var.shape()));
    }
    for (r, &v) in running_var.data_mut().iter_mut().zip(&var) {
        *r = momentum * *r + keep * v;
    }

    normalize(x, gamma, beta, Mode::Train, mean, var, bn.eps)
}

fn normalize<T: Scalar>(
    x: &Tensor<T>,
    gamma: &Tensor<T>,
    beta: &Tensor<T>,
    mode: Mode,
    mean: Vec<T>,
    var: Vec<T>,
    eps: T,
) -> Result<(Tensor<T>, BatchNormCache<T>)> {
    let d = mean.len();
    let inv_std: Vec<T> = var.iter().map(|&v| T::one() / (v + eps).sqrt()).collect();

    let mut x_hat = Vec::with_capacity(x.len());
    let mut out = Vec::with_capacity(x.len());
    for row in x.data().chunks_exact(d) {
        for j in 0..d {
            let xh = (row[j] - mean[j]) * inv_std[j];
            x_hat.push(xh);
            out.push(gamma.data()[j] * xh + beta.data()[j]);
        }
    }

    let out = Tensor::from_vec(x.shape(), out)?;
    let cache = BatchNormCache {
        mode,
        x_hat: Tensor::from_vec(x.shape(), x_hat)?,
        gamma: gamma.clone(),
        mean,
        var,
        inv_std,
    };
    Ok((out, cache))
}

/// Backward pass.
///
/// For a training-mode cache the gradient flows through the batch mean and
/// variance as well:
///
/// ```text
/// dx = inv_std / N * (N * dx_hat - sum(dx_hat) - x_hat * sum(dx_hat * x_hat))
/// ```
///
/// For a test-mode cache the statistics are constants and `dx = dx_hat * inv_std`.
pub fn batchnorm_backward<T: Scalar>(
    dout: &Tensor<T>,
    cache: BatchNormCache<T>,
) -> Result<BatchNormGrads<T>> {
    if dout.shape() != cache.x_hat.shape() {
        return Err(Error::shape("batchnorm_backward", cache.x_hat.shape(), dout.shape()));
    }
    let (n, d) = dout.rows_cols()?;
    let g = cache.gamma.data();
    let xh = cache.x_hat.data();
    let dy = dout.data();

    let mut dgamma = vec![T::zero(); d];
    let mut dbeta = vec![T::zero(); d];
    // sum over the batch of dx_hat and dx_hat * x_hat
    let mut sum_dxh = vec![T::zero(); d];
    let mut sum_dxh_xh = vec![T::zero(); d];
    for i in 0..n {
        for j in 0..d {
            let k = i * d + j;
            dbeta[j] = dbeta[j] + dy[k];
            dgamma[j] = dgamma[j] + dy[k] * xh[k];
            let dxh = dy[k] * g[j];
            sum_dxh[j] = sum_dxh[j] + dxh;
            sum_dxh_xh[j] = sum_dxh_xh[j] + dxh * xh[k];
        }
    }

    let mut dx = Vec::with_capacity(n * d);
    match cache.mode {
        Mode::Train => {
            let n_t: T = cast(n as f64);
            let inv_n = T::one() / n_t;
            for i in 0..n {
                for j in 0..d {
                    let k = i * d + j;
                    let dxh = dy[k] * g[j];
                    let v = n_t * dxh - sum_dxh[j] - xh[k] * sum_dxh_xh[j];
                    dx.push(cache.inv_std[j] * inv_n * v);
                }
            }
        }
        Mode::Test => {
            for i in 0..n {
                for j in 0..d {
                    let k = i * d + j;
                    dx.push(dy[k] * g[j] * cache.inv_std[j]);
                }
            }
        }
    }

    Ok(BatchNormGrads {
        dx: Tensor::from_vec(dout.shape(), dx)?,
        dgamma: Tensor::from_vec(&[d], dgamma)?,
        dbeta: Tensor::from_vec(&[d], dbeta)?,
    })
}

fn check_dims<T: Scalar>(
    x: &Tensor<T>,
    gamma: &Tensor<T>,
    beta: &Tensor<T>,
) -> Result<(usize, usize)> {
    if x.ndim() != 2 {
        return Err(Error::InvalidShape(format!(
            "batch norm expects an (N, D) input, got shape {:?}",
            x.shape()
        )));
    }
    let (n, d) = (x.shape()[0], x.shape()[1]);
    if gamma.shape() != [d] {
        return Err(Error::shape("batchnorm gamma", &[d], gamma.shape()));
    }
    if beta.shape() != [d] {
        return Err(Error::shape("batchnorm beta", &[d], beta.shape()));
    }
    Ok((n, d))
}

fn stat_or_zeros<T: Scalar>(stat: Option<&Tensor<T>>, d: usize) -> Result<Vec<T>> {
    match stat {
        Some(s) if s.shape() == [d] => Ok(s.data().to_vec()),
        Some(s) => Err(Error::shape("batchnorm running stats", &[d], s.shape())),
        None => Ok(vec![T::zero(); d]),
    }
}
