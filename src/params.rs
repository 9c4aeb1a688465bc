//! Named parameter tensors.
//!
//! A model's parameters live in a [`Params`] map keyed by `W<i>`, `b<i>`, `gamma<i>`
//! and `beta<i>` (1-based layer index). Gradients use the same type with the same
//! keys and shapes.

use std::collections::BTreeMap;

use crate::tensor::{Scalar, Tensor};
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Params<T> {
    tensors: BTreeMap<String, Tensor<T>>,
}

/// Gradient set: same keys and shapes as the [`Params`] it was computed for.
pub type Gradients<T> = Params<T>;

pub fn weight_name(layer: usize) -> String {
    format!("W{layer}")
}

pub fn bias_name(layer: usize) -> String {
    format!("b{layer}")
}

pub fn gamma_name(layer: usize) -> String {
    format!("gamma{layer}")
}

pub fn beta_name(layer: usize) -> String {
    format!("beta{layer}")
}

impl<T: Scalar> Params<T> {
    pub fn new() -> Self {
        Self {
            tensors: BTreeMap::new(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Tensor<T>> {
        self.tensors.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Tensor<T>> {
        self.tensors.get_mut(name)
    }

    /// Like [`Params::get`], but a missing name is an error.
    pub fn require(&self, name: &str) -> Result<&Tensor<T>> {
        self.get(name)
            .ok_or_else(|| Error::UnknownParameter(name.to_owned()))
    }

    /// Insert or replace a tensor, returning the previous value.
    pub fn insert(&mut self, name: impl Into<String>, tensor: Tensor<T>) -> Option<Tensor<T>> {
        self.tensors.insert(name.into(), tensor)
    }

    /// Replace an existing tensor with one of the same shape.
    pub fn set(&mut self, name: &str, tensor: Tensor<T>) -> Result<()> {
        let slot = self
            .tensors
            .get_mut(name)
            .ok_or_else(|| Error::UnknownParameter(name.to_owned()))?;
        if slot.shape() != tensor.shape() {
            return Err(Error::shape("Params::set", slot.shape(), tensor.shape()));
        }
        *slot = tensor;
        Ok(())
    }

    /// Overwrite every tensor from `other`. Both sets must have the same keys and shapes.
    pub fn assign(&mut self, other: &Params<T>) -> Result<()> {
        if self.len() != other.len() {
            return Err(Error::InvalidData(format!(
                "parameter count mismatch: expected {}, got {}",
                self.len(),
                other.len()
            )));
        }
        for (name, tensor) in other.iter() {
            self.set(name, tensor.clone())?;
        }
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tensors.contains_key(name)
    }

    /// Iterate in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Tensor<T>)> {
        self.tensors.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&str, &mut Tensor<T>)> {
        self.tensors.iter_mut().map(|(k, v)| (k.as_str(), v))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tensors.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// Total number of scalar parameters.
    pub fn num_parameters(&self) -> usize {
        self.tensors.values().map(Tensor::len).sum()
    }

    /// True when every tensor holds only finite values.
    pub fn all_finite(&self) -> bool {
        self.tensors.values().all(Tensor::all_finite)
    }
}

impl<T> IntoIterator for Params<T> {
    type Item = (String, Tensor<T>);
    type IntoIter = std::collections::btree_map::IntoIter<String, Tensor<T>>;

    fn into_iter(self) -> Self::IntoIter {
        self.tensors.into_iter()
    }
}

impl<T> FromIterator<(String, Tensor<T>)> for Params<T> {
    fn from_iter<I: IntoIterator<Item = (String, Tensor<T>)>>(iter: I) -> Self {
        Self {
            tensors: iter.into_iter().collect(),
        }
    }
}
