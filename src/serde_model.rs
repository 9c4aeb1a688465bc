//! Model serialization/deserialization (feature: `serde`).
//!
//! This module defines a versioned on-disk format for [`FullyConnectedNet`]:
//! the architecture ([`NetConfig`]), every named parameter tensor, and the
//! batch-norm running statistics.
//!
//! Design notes:
//! - Internal `FullyConnectedNet`/`Layer` structs are not serialized directly, so
//!   the file format stays stable if the internal representation changes.
//! - Values are stored as `f64` regardless of the in-memory precision.
//! - Deserialization validates the format version, tensor shapes against the
//!   architecture, and that all values are finite.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

#[cfg(feature = "serde")]
use std::path::Path;

use crate::builder::NetConfig;
use crate::params::Params;
use crate::tensor::{Scalar, Tensor, cast, to_f64};
use crate::{Error, FullyConnectedNet, Result};

pub const MODEL_FORMAT_VERSION: u32 = 1;

#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, PartialEq)]
pub struct SerializedNet {
    pub format_version: u32,
    pub config: NetConfig,
    pub params: Vec<SerializedTensor>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub batchnorm: Vec<SerializedBatchNorm>,
}

#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, PartialEq)]
pub struct SerializedTensor {
    pub name: String,
    pub shape: Vec<usize>,
    /// Row-major values.
    pub data: Vec<f64>,
}

/// Running statistics of one hidden layer. Absent statistics mean the layer has
/// never seen a training batch.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, PartialEq)]
pub struct SerializedBatchNorm {
    pub layer: usize,
    pub running_mean: Option<Vec<f64>>,
    pub running_var: Option<Vec<f64>>,
}

impl SerializedNet {
    pub fn validate(&self) -> Result<()> {
        if self.format_version != MODEL_FORMAT_VERSION {
            return Err(Error::InvalidData(format!(
                "unsupported model format_version {}; expected {}",
                self.format_version, MODEL_FORMAT_VERSION
            )));
        }
        self.config
            .validate()
            .map_err(|e| Error::InvalidData(format!("invalid config: {e}")))?;

        for t in &self.params {
            t.validate()?;
        }
        for bn in &self.batchnorm {
            for (what, stat) in [("running_mean", &bn.running_mean), ("running_var", &bn.running_var)] {
                if let Some(values) = stat {
                    if values.iter().any(|v| !v.is_finite()) {
                        return Err(Error::InvalidData(format!(
                            "layer {} {what} must contain only finite values",
                            bn.layer
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

impl SerializedTensor {
    fn validate(&self) -> Result<()> {
        let expected = self
            .shape
            .iter()
            .try_fold(1usize, |acc, &d| acc.checked_mul(d))
            .ok_or_else(|| Error::InvalidData(format!("tensor {} shape overflow", self.name)))?;
        if self.data.len() != expected {
            return Err(Error::InvalidData(format!(
                "tensor {} has {} values but shape {:?}",
                self.name,
                self.data.len(),
                self.shape
            )));
        }
        if self.data.iter().any(|v| !v.is_finite()) {
            return Err(Error::InvalidData(format!(
                "tensor {} must contain only finite values",
                self.name
            )));
        }
        Ok(())
    }

    fn from_tensor<T: Scalar>(name: &str, t: &Tensor<T>) -> Self {
        Self {
            name: name.to_owned(),
            shape: t.shape().to_vec(),
            data: t.data().iter().map(|&v| to_f64(v)).collect(),
        }
    }

    fn into_tensor<T: Scalar>(self) -> Result<(String, Tensor<T>)> {
        let t = narrow(&self.name, &self.shape, self.data)?;
        Ok((self.name, t))
    }
}

/// Convert stored `f64` values to `T`. Values outside `T`'s range would become
/// infinite, so they are rejected here.
fn narrow<T: Scalar>(what: &str, shape: &[usize], data: Vec<f64>) -> Result<Tensor<T>> {
    let t = Tensor::from_vec(shape, data.into_iter().map(cast).collect())?;
    if !t.all_finite() {
        return Err(Error::InvalidData(format!(
            "{what} has values outside the range of the target precision"
        )));
    }
    Ok(t)
}

impl<T: Scalar> From<&FullyConnectedNet<T>> for SerializedNet {
    fn from(net: &FullyConnectedNet<T>) -> Self {
        use crate::net::{Classifier, Layer};

        let params = net
            .params()
            .iter()
            .map(|(name, t)| SerializedTensor::from_tensor(name, t))
            .collect();
        let to_vec = |t: &Tensor<T>| -> Vec<f64> { t.data().iter().map(|&v| to_f64(v)).collect() };
        let batchnorm = net
            .layers()
            .iter()
            .filter_map(|l| match l {
                Layer::BatchNorm { index, param } => Some(SerializedBatchNorm {
                    layer: *index,
                    running_mean: param.running_mean().map(to_vec),
                    running_var: param.running_var().map(to_vec),
                }),
                _ => None,
            })
            .collect();

        Self {
            format_version: MODEL_FORMAT_VERSION,
            config: net.config().clone(),
            params,
            batchnorm,
        }
    }
}

impl<T: Scalar> TryFrom<SerializedNet> for FullyConnectedNet<T> {
    type Error = Error;

    fn try_from(value: SerializedNet) -> std::result::Result<Self, Self::Error> {
        value.validate()?;

        let params = value
            .params
            .into_iter()
            .map(SerializedTensor::into_tensor)
            .collect::<Result<Params<T>>>()?;
        let mut net = FullyConnectedNet::from_parts(&value.config, params)?;

        for bn in value.batchnorm {
            let param = net.bn_param_mut(bn.layer).ok_or_else(|| {
                Error::InvalidData(format!("layer {} has no batch normalization", bn.layer))
            })?;
            match (bn.running_mean, bn.running_var) {
                (Some(mean), Some(var)) => {
                    let what = format!("layer {} running statistics", bn.layer);
                    let mean = narrow(&what, &[mean.len()], mean)?;
                    let var = narrow(&what, &[var.len()], var)?;
                    param
                        .set_running_stats(mean, var)
                        .map_err(|e| Error::InvalidData(format!("layer {} invalid: {e}", bn.layer)))?;
                }
                (None, None) => {}
                _ => {
                    return Err(Error::InvalidData(format!(
                        "layer {} must store both running statistics or neither",
                        bn.layer
                    )));
                }
            }
        }
        Ok(net)
    }
}

#[cfg(feature = "serde")]
impl<T: Scalar> FullyConnectedNet<T> {
    /// Serialize the model to a pretty-printed JSON string.
    pub fn to_json_string_pretty(&self) -> Result<String> {
        let ser = SerializedNet::from(self);
        serde_json::to_string_pretty(&ser)
            .map_err(|e| Error::InvalidData(format!("failed to serialize model: {e}")))
    }

    /// Serialize the model to a compact JSON string.
    pub fn to_json_string(&self) -> Result<String> {
        let ser = SerializedNet::from(self);
        serde_json::to_string(&ser)
            .map_err(|e| Error::InvalidData(format!("failed to serialize model: {e}")))
    }

    /// Parse a model from a JSON string.
    pub fn from_json_str(s: &str) -> Result<Self> {
        let ser: SerializedNet = serde_json::from_str(s)
            .map_err(|e| Error::InvalidData(format!("failed to parse model json: {e}")))?;
        ser.try_into()
    }

    /// Save the model to a JSON file (pretty-printed).
    pub fn save_json<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let s = self.to_json_string_pretty()?;
        let p = path.as_ref();
        std::fs::write(p, s)
            .map_err(|e| Error::InvalidData(format!("failed to write {}: {e}", p.display())))?;
        Ok(())
    }

    /// Load a model from a JSON file.
    pub fn load_json<P: AsRef<Path>>(path: P) -> Result<Self> {
        let p = path.as_ref();
        let s = std::fs::read_to_string(p)
            .map_err(|e| Error::InvalidData(format!("failed to read {}: {e}", p.display())))?;
        Self::from_json_str(&s)
    }
}
