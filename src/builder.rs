//! Network configuration and builder.
//!
//! [`NetConfig`] is the model's configuration surface. [`NetBuilder`] turns it into
//! an initialized [`FullyConnectedNet`]:
//!
//! - weights: `N(0, weight_scale²)`
//! - biases and `beta`: zero
//! - `gamma`: one

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::batchnorm::{DEFAULT_EPS, DEFAULT_MOMENTUM};
use crate::params::{Params, beta_name, bias_name, gamma_name, weight_name};
use crate::tensor::{Scalar, Tensor};
use crate::{Error, FullyConnectedNet, Result};

#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
#[derive(Debug, Clone, PartialEq)]
pub struct NetConfig {
    /// Width of each hidden layer, input side first. May be empty (softmax regression).
    pub hidden_dims: Vec<usize>,
    /// Features per sample after flattening.
    pub input_dim: usize,
    pub num_classes: usize,
    /// L2 strength; the penalty is `0.5 * reg * sum(W²)` over weights only.
    pub reg: f64,
    /// Standard deviation of the initial weights.
    pub weight_scale: f64,
    /// Insert batch normalization between every hidden affine layer and its ReLU.
    pub use_batchnorm: bool,
    pub bn_eps: f64,
    pub bn_momentum: f64,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            hidden_dims: vec![100, 100],
            input_dim: 3 * 32 * 32,
            num_classes: 10,
            reg: 0.0,
            weight_scale: 1e-2,
            use_batchnorm: false,
            bn_eps: DEFAULT_EPS,
            bn_momentum: DEFAULT_MOMENTUM,
        }
    }
}

impl NetConfig {
    /// One hidden layer of 100 units with small initial weights.
    pub fn two_layer() -> Self {
        Self {
            hidden_dims: vec![100],
            weight_scale: 1e-3,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.input_dim == 0 {
            return Err(Error::InvalidConfig("input_dim must be > 0".to_owned()));
        }
        if self.num_classes == 0 {
            return Err(Error::InvalidConfig("num_classes must be > 0".to_owned()));
        }
        if self.hidden_dims.contains(&0) {
            return Err(Error::InvalidConfig(format!(
                "hidden layer widths must be > 0, got {:?}",
                self.hidden_dims
            )));
        }
        if !(self.reg.is_finite() && self.reg >= 0.0) {
            return Err(Error::InvalidConfig(format!(
                "reg must be finite and >= 0, got {}",
                self.reg
            )));
        }
        if !(self.weight_scale.is_finite() && self.weight_scale >= 0.0) {
            return Err(Error::InvalidConfig(format!(
                "weight_scale must be finite and >= 0, got {}",
                self.weight_scale
            )));
        }
        if !(self.bn_eps.is_finite() && self.bn_eps > 0.0) {
            return Err(Error::InvalidConfig(format!(
                "bn_eps must be finite and > 0, got {}",
                self.bn_eps
            )));
        }
        if !(self.bn_momentum.is_finite() && (0.0..1.0).contains(&self.bn_momentum)) {
            return Err(Error::InvalidConfig(format!(
                "bn_momentum must be finite and in [0,1), got {}",
                self.bn_momentum
            )));
        }
        Ok(())
    }
}

/// Builder for a [`FullyConnectedNet`].
///
/// Example:
///
/// ```rust
/// use fcnet::NetBuilder;
///
/// # fn main() -> fcnet::Result<()> {
/// let net = NetBuilder::with_dims(4, 3)?
///     .add_hidden_layer(16)?
///     .add_hidden_layer(8)?
///     .batchnorm(true)
///     .reg(1e-3)
///     .build_with_seed::<f64>(0)?;
/// assert_eq!(net.num_layers(), 3);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct NetBuilder {
    config: NetConfig,
}

impl NetBuilder {
    /// Start from a complete configuration.
    pub fn new(config: NetConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    /// Start from input and output sizes with no hidden layers.
    pub fn with_dims(input_dim: usize, num_classes: usize) -> Result<Self> {
        Self::new(NetConfig {
            hidden_dims: Vec::new(),
            input_dim,
            num_classes,
            ..NetConfig::default()
        })
    }

    /// Append a hidden layer of `width` units.
    pub fn add_hidden_layer(mut self, width: usize) -> Result<Self> {
        if width == 0 {
            return Err(Error::InvalidConfig(
                "hidden layer width must be > 0".to_owned(),
            ));
        }
        self.config.hidden_dims.push(width);
        Ok(self)
    }

    pub fn reg(mut self, reg: f64) -> Self {
        self.config.reg = reg;
        self
    }

    pub fn weight_scale(mut self, weight_scale: f64) -> Self {
        self.config.weight_scale = weight_scale;
        self
    }

    pub fn batchnorm(mut self, enabled: bool) -> Self {
        self.config.use_batchnorm = enabled;
        self
    }

    pub fn config(&self) -> &NetConfig {
        &self.config
    }

    /// Build using a deterministic seed.
    pub fn build_with_seed<T: Scalar>(&self, seed: u64) -> Result<FullyConnectedNet<T>> {
        let mut rng = StdRng::seed_from_u64(seed);
        self.build_with_rng(&mut rng)
    }

    /// Build using the provided RNG.
    pub fn build_with_rng<T: Scalar, R: Rng + ?Sized>(
        &self,
        rng: &mut R,
    ) -> Result<FullyConnectedNet<T>> {
        let config = &self.config;
        config.validate()?;

        let mut dims = Vec::with_capacity(config.hidden_dims.len() + 2);
        dims.push(config.input_dim);
        dims.extend_from_slice(&config.hidden_dims);
        dims.push(config.num_classes);
        let num_layers = dims.len() - 1;

        let mut params = Params::new();
        for (i, pair) in dims.windows(2).enumerate() {
            let index = i + 1;
            let (d_in, d_out) = (pair[0], pair[1]);
            params.insert(
                weight_name(index),
                Tensor::randn(&[d_in, d_out], config.weight_scale, rng),
            );
            params.insert(bias_name(index), Tensor::zeros(&[d_out]));
            if config.use_batchnorm && index < num_layers {
                params.insert(gamma_name(index), Tensor::ones(&[d_out]));
                params.insert(beta_name(index), Tensor::zeros(&[d_out]));
            }
        }

        FullyConnectedNet::from_parts(config, params)
    }
}
