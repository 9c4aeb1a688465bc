//! Rectified linear activation.
//!
//! The cache is the layer input. The derivative at exactly `x == 0` is taken to be
//! zero, so a unit sitting on the kink passes no gradient.

use crate::tensor::{Scalar, Tensor};
use crate::{Error, Result};

/// Input recorded by [`relu_forward`].
#[derive(Debug, Clone)]
pub struct ReluCache<T> {
    x: Tensor<T>,
}

/// `out = max(0, x)` elementwise.
pub fn relu_forward<T: Scalar>(x: &Tensor<T>) -> (Tensor<T>, ReluCache<T>) {
    let out = x.map(|v| if v > T::zero() { v } else { T::zero() });
    (out, ReluCache { x: x.clone() })
}

/// `dx = dout` where `x > 0`, zero elsewhere.
pub fn relu_backward<T: Scalar>(dout: &Tensor<T>, cache: ReluCache<T>) -> Result<Tensor<T>> {
    if dout.shape() != cache.x.shape() {
        return Err(Error::shape("relu_backward", cache.x.shape(), dout.shape()));
    }
    dout.zip_map(&cache.x, "relu_backward", |g, x| {
        if x > T::zero() { g } else { T::zero() }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gradient_check::{eval_numerical_gradient_array, rel_error};

    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn forward_matches_reference_values() {
        let x = Tensor::<f64>::linspace(-0.5, 0.5, 12)
            .reshape(&[3, 4])
            .unwrap();
        let (out, _) = relu_forward(&x);
        let expected = Tensor::from_vec(
            &[3, 4],
            vec![
                0.0, 0.0, 0.0, 0.0, //
                0.0, 0.0, 0.04545455, 0.13636364, //
                0.22727273, 0.31818182, 0.40909091, 0.5,
            ],
        )
        .unwrap();
        assert!(rel_error(&out, &expected).unwrap() < 1e-7);
    }

    #[test]
    fn backward_matches_numeric_gradient() {
        let mut rng = StdRng::seed_from_u64(231);
        let x = Tensor::<f64>::randn(&[10, 10], 1.0, &mut rng);
        let dout = Tensor::<f64>::randn(&[10, 10], 1.0, &mut rng);

        let dx_num =
            eval_numerical_gradient_array(|x| Ok(relu_forward(x).0), &x, &dout, 1e-5).unwrap();

        let (_, cache) = relu_forward(&x);
        let dx = relu_backward(&dout, cache).unwrap();

        assert!(rel_error(&dx_num, &dx).unwrap() < 1e-9);
    }

    #[test]
    fn zero_input_passes_no_gradient() {
        let x = Tensor::<f64>::from_f64(&[-1.0, 0.0, 2.0]);
        let (_, cache) = relu_forward(&x);
        let dx = relu_backward(&Tensor::ones(&[3]), cache).unwrap();
        assert_eq!(dx.data(), &[0.0, 0.0, 1.0]);
    }

    #[test]
    fn backward_rejects_wrong_upstream_shape() {
        let (_, cache) = relu_forward(&Tensor::<f64>::zeros(&[2, 3]));
        assert!(relu_backward(&Tensor::zeros(&[3, 2]), cache).is_err());
    }
}
