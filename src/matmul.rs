//! Small strided GEMM used by the affine layer and `Tensor::matmul`.
//!
//! Strides let callers multiply by a transposed operand without materializing it:
//! for a row-major `(r, c)` matrix, the plain view is `(rs, cs) = (c, 1)` and the
//! transposed view is `(rs, cs) = (1, c)`.
//!
//! - default: a simple, safe triple-loop implementation
//! - optional: `sgemm`/`dgemm` from the `matrixmultiply` feature, picked per
//!   element type through [`Gemm`]

use num_traits::Float;

use crate::tensor::Scalar;

/// Per-precision GEMM kernel. Implemented for `f32` and `f64` only; it is a
/// supertrait of [`Scalar`] and cannot be named outside the crate.
pub trait Gemm: Sized {
    #[allow(clippy::too_many_arguments)]
    fn gemm(
        m: usize,
        n: usize,
        k: usize,
        alpha: Self,
        a: &[Self],
        rsa: usize,
        csa: usize,
        b: &[Self],
        rsb: usize,
        csb: usize,
        beta: Self,
        c: &mut [Self],
        rsc: usize,
        csc: usize,
    );
}

/// `C = alpha * A·B + beta * C` with `A: (m, k)`, `B: (k, n)`, `C: (m, n)`.
#[allow(clippy::too_many_arguments)]
#[inline]
pub(crate) fn gemm<T: Scalar>(
    m: usize,
    n: usize,
    k: usize,
    alpha: T,
    a: &[T],
    rsa: usize,
    csa: usize,
    b: &[T],
    rsb: usize,
    csb: usize,
    beta: T,
    c: &mut [T],
    rsc: usize,
    csc: usize,
) {
    debug_assert!(rsa > 0 || m <= 1);
    debug_assert!(csa > 0 || k <= 1);
    debug_assert!(rsb > 0 || k <= 1);
    debug_assert!(csb > 0 || n <= 1);
    debug_assert!(rsc > 0 || m <= 1);
    debug_assert!(csc > 0 || n <= 1);

    T::gemm(m, n, k, alpha, a, rsa, csa, b, rsb, csb, beta, c, rsc, csc);
}

#[allow(clippy::too_many_arguments)]
fn gemm_loop<T: Float>(
    m: usize,
    n: usize,
    k: usize,
    alpha: T,
    a: &[T],
    rsa: usize,
    csa: usize,
    b: &[T],
    rsb: usize,
    csb: usize,
    beta: T,
    c: &mut [T],
    rsc: usize,
    csc: usize,
) {
    // Bounds are validated by callers.
    for i in 0..m {
        let a0 = i * rsa;
        for j in 0..n {
            let b0 = j * csb;
            let mut acc = T::zero();
            for p in 0..k {
                acc = acc + a[a0 + p * csa] * b[p * rsb + b0];
            }

            let idx = i * rsc + j * csc;
            c[idx] = if beta == T::zero() {
                alpha * acc
            } else {
                alpha * acc + beta * c[idx]
            };
        }
    }
}

impl Gemm for f32 {
    #[inline]
    #[allow(clippy::too_many_arguments)]
    fn gemm(
        m: usize,
        n: usize,
        k: usize,
        alpha: f32,
        a: &[f32],
        rsa: usize,
        csa: usize,
        b: &[f32],
        rsb: usize,
        csb: usize,
        beta: f32,
        c: &mut [f32],
        rsc: usize,
        csc: usize,
    ) {
        #[cfg(feature = "matrixmultiply")]
        if m > 0 && n > 0 && k > 0 {
            // SAFETY: callers check that every strided index of A, B and C is in
            // bounds of the slices, and C does not alias A or B.
            unsafe {
                matrixmultiply::sgemm(
                    m,
                    k,
                    n,
                    alpha,
                    a.as_ptr(),
                    rsa as isize,
                    csa as isize,
                    b.as_ptr(),
                    rsb as isize,
                    csb as isize,
                    beta,
                    c.as_mut_ptr(),
                    rsc as isize,
                    csc as isize,
                );
            }
            return;
        }

        gemm_loop(m, n, k, alpha, a, rsa, csa, b, rsb, csb, beta, c, rsc, csc);
    }
}

impl Gemm for f64 {
    #[inline]
    #[allow(clippy::too_many_arguments)]
    fn gemm(
        m: usize,
        n: usize,
        k: usize,
        alpha: f64,
        a: &[f64],
        rsa: usize,
        csa: usize,
        b: &[f64],
        rsb: usize,
        csb: usize,
        beta: f64,
        c: &mut [f64],
        rsc: usize,
        csc: usize,
    ) {
        #[cfg(feature = "matrixmultiply")]
        if m > 0 && n > 0 && k > 0 {
            // SAFETY: same contract as the f32 kernel above.
            unsafe {
                matrixmultiply::dgemm(
                    m,
                    k,
                    n,
                    alpha,
                    a.as_ptr(),
                    rsa as isize,
                    csa as isize,
                    b.as_ptr(),
                    rsb as isize,
                    csb as isize,
                    beta,
                    c.as_mut_ptr(),
                    rsc as isize,
                    csc as isize,
                );
            }
            return;
        }

        gemm_loop(m, n, k, alpha, a, rsa, csa, b, rsb, csb, beta, c, rsc, csc);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transposed_strides_match_explicit_transpose() {
        // a: (2, 3), b: (2, 3) -> a · bᵀ : (2, 2)
        let a = [1.0_f64, 2.0, 3.0, 4.0, 5.0, 6.0];
        let b = [1.0_f64, 0.0, -1.0, 2.0, 1.0, 0.0];
        let mut c = [0.0_f64; 4];
        gemm(2, 2, 3, 1.0, &a, 3, 1, &b, 1, 3, 0.0, &mut c, 2, 1);
        assert_eq!(c, [-2.0, 4.0, -2.0, 13.0]);
    }

    fn check_kernel<T: Scalar>() {
        // aᵀ · b with a: (3, 2) stored row-major, b: (3, 2); C accumulates (beta = 2).
        let v = |xs: &[f64]| -> Vec<T> { xs.iter().map(|&x| crate::tensor::cast(x)).collect() };
        let a = v(&[1.0, -1.0, 0.5, 2.0, 3.0, 0.0]);
        let b = v(&[2.0, 1.0, -1.0, 4.0, 0.0, 3.0]);
        let mut c = v(&[1.0, 1.0, 1.0, 1.0]);
        let mut expected = c.clone();

        let (alpha, beta) = (crate::tensor::cast::<T>(0.5), crate::tensor::cast::<T>(2.0));
        gemm(2, 2, 3, alpha, &a, 1, 2, &b, 2, 1, beta, &mut c, 2, 1);
        gemm_loop(2, 2, 3, alpha, &a, 1, 2, &b, 2, 1, beta, &mut expected, 2, 1);

        // aᵀ·b = [[1.5, 12.0], [-4.0, 7.0]]
        let reference = v(&[2.75, 8.0, 0.0, 5.5]);
        assert_eq!(c, expected);
        assert_eq!(c, reference);
    }

    #[test]
    fn both_precisions_agree_with_the_reference_loop() {
        check_kernel::<f32>();
        check_kernel::<f64>();
    }
}
