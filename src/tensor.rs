//! Dense row-major tensors.
//!
//! `Tensor<T>` is a flat buffer plus a shape. The element type is generic over
//! [`Scalar`] so the same layers run in single (`f32`) or double (`f64`) precision.
//! Operations that combine tensors check shapes and return
//! [`Error::ShapeMismatch`] instead of broadcasting.

use std::fmt::{Debug, Display};

use num_traits::{Float, NumCast};
use rand::Rng;
use rand_distr::{Distribution, StandardNormal};

use crate::matmul::{Gemm, gemm};
use crate::{Error, Result};

/// Floating point element type of a [`Tensor`]: `f32` or `f64`.
///
/// Sealed; each precision carries its own GEMM kernel.
pub trait Scalar: Float + Debug + Display + Default + Send + Sync + 'static + Gemm {}

impl Scalar for f32 {}
impl Scalar for f64 {}

/// Convert an `f64` constant into `T`.
#[inline]
pub(crate) fn cast<T: Scalar>(x: f64) -> T {
    <T as NumCast>::from(x).unwrap_or_else(T::nan)
}

/// Convert `x` into `f64` (for reporting).
#[inline]
pub(crate) fn to_f64<T: Scalar>(x: T) -> f64 {
    x.to_f64().unwrap_or(f64::NAN)
}

#[derive(Debug, Clone, PartialEq)]
pub struct Tensor<T> {
    shape: Vec<usize>,
    data: Vec<T>,
}

impl<T: Scalar> Tensor<T> {
    pub fn zeros(shape: &[usize]) -> Self {
        Self::full(shape, T::zero())
    }

    pub fn ones(shape: &[usize]) -> Self {
        Self::full(shape, T::one())
    }

    pub fn full(shape: &[usize], value: T) -> Self {
        let len = shape.iter().product();
        Self {
            shape: shape.to_vec(),
            data: vec![value; len],
        }
    }

    pub fn zeros_like(&self) -> Self {
        Self::zeros(&self.shape)
    }

    /// Build a tensor from a flat row-major buffer.
    pub fn from_vec(shape: &[usize], data: Vec<T>) -> Result<Self> {
        let expected: usize = shape.iter().product();
        if data.len() != expected {
            return Err(Error::InvalidShape(format!(
                "buffer of {} elements cannot have shape {:?} ({} elements)",
                data.len(),
                shape,
                expected
            )));
        }
        Ok(Self {
            shape: shape.to_vec(),
            data,
        })
    }

    /// 1-D tensor from a slice of `f64` values.
    pub fn from_f64(values: &[f64]) -> Self {
        Self {
            shape: vec![values.len()],
            data: values.iter().map(|&v| cast(v)).collect(),
        }
    }

    /// `num` evenly spaced values over `[start, stop]` (both ends included).
    pub fn linspace(start: f64, stop: f64, num: usize) -> Self {
        let data = match num {
            0 => Vec::new(),
            1 => vec![cast(start)],
            _ => {
                let step = (stop - start) / (num - 1) as f64;
                (0..num)
                    .map(|i| {
                        if i == num - 1 {
                            cast(stop)
                        } else {
                            cast(start + i as f64 * step)
                        }
                    })
                    .collect()
            }
        };
        Self {
            shape: vec![num],
            data,
        }
    }

    /// Samples from a standard normal distribution scaled by `std`.
    pub fn randn<R: Rng + ?Sized>(shape: &[usize], std: f64, rng: &mut R) -> Self {
        let len = shape.iter().product();
        let data = (0..len)
            .map(|_| {
                let z: f64 = StandardNormal.sample(rng);
                cast(z * std)
            })
            .collect();
        Self {
            shape: shape.to_vec(),
            data,
        }
    }

    #[inline]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    #[inline]
    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[inline]
    pub fn data(&self) -> &[T] {
        &self.data
    }

    #[inline]
    pub fn data_mut(&mut self) -> &mut [T] {
        &mut self.data
    }

    pub fn into_vec(self) -> Vec<T> {
        self.data
    }

    /// Same buffer, new shape. The element count must not change.
    pub fn reshape(mut self, shape: &[usize]) -> Result<Self> {
        let expected: usize = shape.iter().product();
        if expected != self.data.len() {
            return Err(Error::shape("reshape", &self.shape, shape));
        }
        self.shape = shape.to_vec();
        Ok(self)
    }

    /// View as a matrix: `(shape[0], product(shape[1..]))`.
    pub fn rows_cols(&self) -> Result<(usize, usize)> {
        match self.shape.split_first() {
            Some((&n, rest)) => Ok((n, rest.iter().product())),
            None => Err(Error::InvalidShape(
                "scalar tensor has no leading batch dimension".to_owned(),
            )),
        }
    }

    pub fn map(&self, f: impl Fn(T) -> T) -> Self {
        Self {
            shape: self.shape.clone(),
            data: self.data.iter().map(|&x| f(x)).collect(),
        }
    }

    /// Elementwise combination of two tensors of identical shape.
    pub fn zip_map(&self, other: &Self, op: &'static str, f: impl Fn(T, T) -> T) -> Result<Self> {
        if self.shape != other.shape {
            return Err(Error::shape(op, &self.shape, &other.shape));
        }
        Ok(Self {
            shape: self.shape.clone(),
            data: self
                .data
                .iter()
                .zip(&other.data)
                .map(|(&a, &b)| f(a, b))
                .collect(),
        })
    }

    pub fn add(&self, other: &Self) -> Result<Self> {
        self.zip_map(other, "add", |a, b| a + b)
    }

    pub fn sub(&self, other: &Self) -> Result<Self> {
        self.zip_map(other, "sub", |a, b| a - b)
    }

    pub fn mul(&self, other: &Self) -> Result<Self> {
        self.zip_map(other, "mul", |a, b| a * b)
    }

    pub fn scale(&self, s: T) -> Self {
        self.map(|x| x * s)
    }

    pub fn sum(&self) -> T {
        self.data.iter().fold(T::zero(), |acc, &x| acc + x)
    }

    /// `sum(x * x)`.
    pub fn sum_sq(&self) -> T {
        self.data.iter().fold(T::zero(), |acc, &x| acc + x * x)
    }

    pub fn mean(&self) -> T {
        if self.data.is_empty() {
            return T::zero();
        }
        self.sum() / cast(self.data.len() as f64)
    }

    pub fn max_abs(&self) -> T {
        self.data.iter().fold(T::zero(), |acc, &x| acc.max(x.abs()))
    }

    pub fn all_finite(&self) -> bool {
        self.data.iter().all(|x| x.is_finite())
    }

    /// Matrix product of two 2-D tensors.
    pub fn matmul(&self, other: &Self) -> Result<Self> {
        if self.ndim() != 2 || other.ndim() != 2 || self.shape[1] != other.shape[0] {
            return Err(Error::shape("matmul", &self.shape, &other.shape));
        }
        let (m, k, n) = (self.shape[0], self.shape[1], other.shape[1]);
        let mut out = Self::zeros(&[m, n]);
        gemm(
            m,
            n,
            k,
            T::one(),
            &self.data,
            k,
            1,
            &other.data,
            n,
            1,
            T::zero(),
            &mut out.data,
            n,
            1,
        );
        Ok(out)
    }

    /// Transpose of a 2-D tensor.
    pub fn transpose(&self) -> Result<Self> {
        if self.ndim() != 2 {
            return Err(Error::InvalidShape(format!(
                "transpose needs a 2-D tensor, got shape {:?}",
                self.shape
            )));
        }
        let (r, c) = (self.shape[0], self.shape[1]);
        let mut out = Self::zeros(&[c, r]);
        for i in 0..r {
            for j in 0..c {
                out.data[j * r + i] = self.data[i * c + j];
            }
        }
        Ok(out)
    }

    /// Column sums of the matrix view: `(N, D) -> (D,)`.
    pub fn sum_rows(&self) -> Result<Self> {
        let (n, d) = self.rows_cols()?;
        let mut out = vec![T::zero(); d];
        for i in 0..n {
            for (o, &x) in out.iter_mut().zip(&self.data[i * d..(i + 1) * d]) {
                *o = *o + x;
            }
        }
        Ok(Self {
            shape: vec![d],
            data: out,
        })
    }

    /// Gather rows (first axis) by index; indices may repeat.
    pub fn select_rows(&self, indices: &[usize]) -> Result<Self> {
        let (n, d) = self.rows_cols()?;
        let mut data = Vec::with_capacity(indices.len() * d);
        for &i in indices {
            if i >= n {
                return Err(Error::InvalidData(format!(
                    "row index {i} out of range for {n} rows"
                )));
            }
            data.extend_from_slice(&self.data[i * d..(i + 1) * d]);
        }
        let mut shape = self.shape.clone();
        shape[0] = indices.len();
        Ok(Self { shape, data })
    }

    /// Index of the largest entry in each row of the matrix view.
    pub fn argmax_rows(&self) -> Result<Vec<usize>> {
        let (n, d) = self.rows_cols()?;
        if d == 0 {
            return Err(Error::InvalidShape("argmax over zero columns".to_owned()));
        }
        Ok((0..n)
            .map(|i| {
                let row = &self.data[i * d..(i + 1) * d];
                let mut best = 0;
                for (j, &v) in row.iter().enumerate().skip(1) {
                    if v > row[best] {
                        best = j;
                    }
                }
                best
            })
            .collect())
    }
}
