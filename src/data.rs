//! Labeled datasets.
//!
//! Loading and preprocessing happen elsewhere; these types only hold already
//! normalized inputs and integer class labels, and check that the two agree.

use crate::tensor::{Scalar, Tensor};
use crate::{Error, Result};

/// Inputs with a leading batch axis (e.g. `(N, C, H, W)`) and one label per sample.
#[derive(Debug, Clone, PartialEq)]
pub struct Dataset<T> {
    inputs: Tensor<T>,
    labels: Vec<usize>,
}

impl<T: Scalar> Dataset<T> {
    /// Pair inputs with labels. `inputs.shape()[0]` must equal `labels.len()`.
    pub fn new(inputs: Tensor<T>, labels: Vec<usize>) -> Result<Self> {
        let (n, d) = inputs.rows_cols()?;
        if n != labels.len() {
            return Err(Error::InvalidData(format!(
                "inputs have {n} samples but {} labels were given",
                labels.len()
            )));
        }
        if d == 0 {
            return Err(Error::InvalidData("samples must have > 0 features".to_owned()));
        }
        Ok(Self { inputs, labels })
    }

    /// Build from a flat row-major buffer of `labels.len()` samples with the given
    /// per-sample shape.
    pub fn from_flat(data: Vec<T>, sample_shape: &[usize], labels: Vec<usize>) -> Result<Self> {
        let mut shape = Vec::with_capacity(sample_shape.len() + 1);
        shape.push(labels.len());
        shape.extend_from_slice(sample_shape);
        Self::new(Tensor::from_vec(&shape, data)?, labels)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Flattened features per sample.
    pub fn feature_dim(&self) -> usize {
        self.inputs.shape()[1..].iter().product()
    }

    pub fn inputs(&self) -> &Tensor<T> {
        &self.inputs
    }

    pub fn labels(&self) -> &[usize] {
        &self.labels
    }

    /// Check that every label is below `num_classes`.
    pub fn validate_labels(&self, num_classes: usize) -> Result<()> {
        match self.labels.iter().position(|&y| y >= num_classes) {
            Some(i) => Err(Error::InvalidData(format!(
                "label {} at sample {i} out of range for {num_classes} classes",
                self.labels[i]
            ))),
            None => Ok(()),
        }
    }

    /// Gather samples by index; indices may repeat.
    pub fn select(&self, indices: &[usize]) -> Result<Self> {
        let inputs = self.inputs.select_rows(indices)?;
        let labels = indices.iter().map(|&i| self.labels[i]).collect();
        Ok(Self { inputs, labels })
    }

    /// The first `n` samples (all of them if `n >= len`).
    pub fn take(&self, n: usize) -> Result<Self> {
        let n = n.min(self.len());
        let indices: Vec<usize> = (0..n).collect();
        self.select(&indices)
    }
}

/// Train / validation / optional test splits handed to the solver.
#[derive(Debug, Clone)]
pub struct DataSplits<T> {
    pub train: Dataset<T>,
    pub val: Dataset<T>,
    pub test: Option<Dataset<T>>,
}

impl<T: Scalar> DataSplits<T> {
    pub fn new(train: Dataset<T>, val: Dataset<T>) -> Result<Self> {
        if train.is_empty() {
            return Err(Error::InvalidData("training split must not be empty".to_owned()));
        }
        if train.feature_dim() != val.feature_dim() {
            return Err(Error::InvalidData(format!(
                "train samples have {} features but validation samples have {}",
                train.feature_dim(),
                val.feature_dim()
            )));
        }
        Ok(Self {
            train,
            val,
            test: None,
        })
    }

    pub fn with_test(mut self, test: Dataset<T>) -> Result<Self> {
        if test.feature_dim() != self.train.feature_dim() {
            return Err(Error::InvalidData(format!(
                "train samples have {} features but test samples have {}",
                self.train.feature_dim(),
                test.feature_dim()
            )));
        }
        self.test = Some(test);
        Ok(self)
    }
}
