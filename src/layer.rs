//! Affine layer and the "sandwich" units the fully-connected net stacks.
//!
//! Every forward function returns its output together with an owned cache. The
//! matching backward function consumes that cache, so a cache can never be replayed
//! against a different forward call.

use crate::activation::{ReluCache, relu_backward, relu_forward};
use crate::batchnorm::{BatchNormCache, BatchNormParam, batchnorm_backward, batchnorm_forward};
use crate::matmul::gemm;
use crate::tensor::{Scalar, Tensor};
use crate::{Error, Result};

/// Inputs recorded by [`affine_forward`].
#[derive(Debug, Clone)]
pub struct AffineCache<T> {
    x: Tensor<T>,
    w: Tensor<T>,
    b: Tensor<T>,
}

#[derive(Debug, Clone)]
pub struct AffineGrads<T> {
    /// Same shape as the original input (not the flattened view).
    pub dx: Tensor<T>,
    pub dw: Tensor<T>,
    pub db: Tensor<T>,
}

/// `out = X·W + b`, where `X` is `x` flattened to `(N, D)`.
///
/// Shape contract:
/// - `x`: `(N, d_1, ..., d_k)` with `d_1 * ... * d_k == D`
/// - `w`: `(D, M)`
/// - `b`: `(M,)`
/// - output: `(N, M)`
pub fn affine_forward<T: Scalar>(
    x: &Tensor<T>,
    w: &Tensor<T>,
    b: &Tensor<T>,
) -> Result<(Tensor<T>, AffineCache<T>)> {
    let (n, d) = x.rows_cols()?;
    if w.ndim() != 2 || w.shape()[0] != d {
        return Err(Error::shape("affine_forward", &[d, b.len()], w.shape()));
    }
    let m = w.shape()[1];
    if b.shape() != [m] {
        return Err(Error::shape("affine_forward bias", &[m], b.shape()));
    }

    let mut out = Tensor::zeros(&[n, m]);
    gemm(
        n,
        m,
        d,
        T::one(),
        x.data(),
        d,
        1,
        w.data(),
        m,
        1,
        T::zero(),
        out.data_mut(),
        m,
        1,
    );
    for row in out.data_mut().chunks_exact_mut(m) {
        for (o, &bias) in row.iter_mut().zip(b.data()) {
            *o = *o + bias;
        }
    }

    let cache = AffineCache {
        x: x.clone(),
        w: w.clone(),
        b: b.clone(),
    };
    Ok((out, cache))
}

/// Gradients of the affine layer given `dout: (N, M)`.
pub fn affine_backward<T: Scalar>(
    dout: &Tensor<T>,
    cache: AffineCache<T>,
) -> Result<AffineGrads<T>> {
    let AffineCache { x, w, b } = cache;
    let (n, d) = x.rows_cols()?;
    let m = b.len();
    if dout.shape() != [n, m] {
        return Err(Error::shape("affine_backward", &[n, m], dout.shape()));
    }

    // dx = dout · Wᵀ
    let mut dx = Tensor::zeros(&[n, d]);
    gemm(
        n,
        d,
        m,
        T::one(),
        dout.data(),
        m,
        1,
        w.data(),
        1,
        m,
        T::zero(),
        dx.data_mut(),
        d,
        1,
    );

    // dW = Xᵀ · dout
    let mut dw = Tensor::zeros(&[d, m]);
    gemm(
        d,
        m,
        n,
        T::one(),
        x.data(),
        1,
        d,
        dout.data(),
        m,
        1,
        T::zero(),
        dw.data_mut(),
        m,
        1,
    );

    Ok(AffineGrads {
        dx: dx.reshape(x.shape())?,
        dw,
        db: dout.sum_rows()?,
    })
}

#[derive(Debug, Clone)]
pub struct AffineReluCache<T> {
    affine: AffineCache<T>,
    relu: ReluCache<T>,
}

/// Affine transform followed by ReLU.
pub fn affine_relu_forward<T: Scalar>(
    x: &Tensor<T>,
    w: &Tensor<T>,
    b: &Tensor<T>,
) -> Result<(Tensor<T>, AffineReluCache<T>)> {
    let (a, affine) = affine_forward(x, w, b)?;
    let (out, relu) = relu_forward(&a);
    Ok((out, AffineReluCache { affine, relu }))
}

pub fn affine_relu_backward<T: Scalar>(
    dout: &Tensor<T>,
    cache: AffineReluCache<T>,
) -> Result<AffineGrads<T>> {
    let da = relu_backward(dout, cache.relu)?;
    affine_backward(&da, cache.affine)
}

#[derive(Debug, Clone)]
pub struct AffineBnReluCache<T> {
    affine: AffineCache<T>,
    bn: BatchNormCache<T>,
    relu: ReluCache<T>,
}

#[derive(Debug, Clone)]
pub struct AffineBnReluGrads<T> {
    pub affine: AffineGrads<T>,
    pub dgamma: Tensor<T>,
    pub dbeta: Tensor<T>,
}

/// Affine transform, batch normalization, then ReLU.
pub fn affine_bn_relu_forward<T: Scalar>(
    x: &Tensor<T>,
    w: &Tensor<T>,
    b: &Tensor<T>,
    gamma: &Tensor<T>,
    beta: &Tensor<T>,
    bn_param: &mut BatchNormParam<T>,
) -> Result<(Tensor<T>, AffineBnReluCache<T>)> {
    let (a, affine) = affine_forward(x, w, b)?;
    let (normed, bn) = batchnorm_forward(&a, gamma, beta, bn_param)?;
    let (out, relu) = relu_forward(&normed);
    Ok((out, AffineBnReluCache { affine, bn, relu }))
}

pub fn affine_bn_relu_backward<T: Scalar>(
    dout: &Tensor<T>,
    cache: AffineBnReluCache<T>,
) -> Result<AffineBnReluGrads<T>> {
    let dnormed = relu_backward(dout, cache.relu)?;
    let bn = batchnorm_backward(&dnormed, cache.bn)?;
    let affine = affine_backward(&bn.dx, cache.affine)?;
    Ok(AffineBnReluGrads {
        affine,
        dgamma: bn.dgamma,
        dbeta: bn.dbeta,
    })
}
