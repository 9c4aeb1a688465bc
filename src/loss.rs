//! Softmax cross-entropy over a batch of class scores.
//!
//! Forward and backward are computed together: the model needs the gradient with
//! respect to the scores in the same step it needs the loss.

use crate::tensor::{Scalar, Tensor, cast};
use crate::{Error, Result};

/// Mean softmax cross-entropy of `scores: (N, C)` against integer `labels`.
///
/// Returns `(loss, dscores)` with `dscores = (softmax(scores) - one_hot(labels)) / N`.
///
/// Each row is shifted by its max before exponentiating, so large scores do not
/// overflow.
pub fn softmax_loss<T: Scalar>(scores: &Tensor<T>, labels: &[usize]) -> Result<(T, Tensor<T>)> {
    if scores.ndim() != 2 {
        return Err(Error::InvalidShape(format!(
            "softmax_loss expects (N, C) scores, got shape {:?}",
            scores.shape()
        )));
    }
    let (n, c) = (scores.shape()[0], scores.shape()[1]);
    if labels.len() != n {
        return Err(Error::shape("softmax_loss labels", &[n], &[labels.len()]));
    }
    if n == 0 || c == 0 {
        return Err(Error::InvalidData(
            "softmax_loss requires at least one sample and one class".to_owned(),
        ));
    }
    if let Some(&bad) = labels.iter().find(|&&y| y >= c) {
        return Err(Error::InvalidData(format!(
            "label {bad} out of range for {c} classes"
        )));
    }

    let inv_n: T = cast(1.0 / n as f64);
    let mut loss = T::zero();
    let mut dscores = Vec::with_capacity(n * c);

    for (row, &y) in scores.data().chunks_exact(c).zip(labels) {
        let (log_sum_exp, max_score) = log_sum_exp_and_max(row);
        loss = loss - (row[y] - log_sum_exp);

        let sum_exp = (log_sum_exp - max_score).exp();
        for (j, &s) in row.iter().enumerate() {
            let p = (s - max_score).exp() / sum_exp;
            let target = if j == y { T::one() } else { T::zero() };
            dscores.push((p - target) * inv_n);
        }
    }

    Ok((loss * inv_n, Tensor::from_vec(&[n, c], dscores)?))
}

#[inline]
fn log_sum_exp_and_max<T: Scalar>(xs: &[T]) -> (T, T) {
    let max_x = xs.iter().skip(1).fold(xs[0], |m, &x| if x > m { x } else { m });
    let sum_exp = xs.iter().fold(T::zero(), |acc, &x| acc + (x - max_x).exp());
    (max_x + sum_exp.ln(), max_x)
}
