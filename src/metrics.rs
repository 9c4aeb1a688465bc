//! Evaluation metrics. These never participate in backprop.

use crate::{Error, Result};

/// Fraction of `predicted` entries equal to `labels`.
///
/// An empty batch has accuracy `0.0`.
pub fn accuracy(predicted: &[usize], labels: &[usize]) -> Result<f64> {
    if predicted.len() != labels.len() {
        return Err(Error::shape("accuracy", &[labels.len()], &[predicted.len()]));
    }
    if labels.is_empty() {
        return Ok(0.0);
    }
    let correct = predicted.iter().zip(labels).filter(|(p, y)| p == y).count();
    Ok(correct as f64 / labels.len() as f64)
}
