//! Fully-connected classifier with an arbitrary number of hidden layers.
//!
//! Architecture:
//!
//! ```text
//! {affine - [batch norm] - relu} x (L - 1) - affine - softmax
//! ```
//!
//! The stack is a `Vec<Layer<T>>` of typed descriptors. Parameters are kept in a
//! [`Params`] map, so every layer refers to its weights by index (`W<i>`, `b<i>`,
//! `gamma<i>`, `beta<i>`), and batch-norm layers carry their own running statistics.
//!
//! Use [`crate::NetBuilder`] to construct one.

use crate::activation::{ReluCache, relu_backward, relu_forward};
use crate::batchnorm::{
    BatchNormCache, BatchNormParam, Mode, batchnorm_backward, batchnorm_forward_eval,
    batchnorm_forward_train,
};
use crate::builder::NetConfig;
use crate::layer::{AffineCache, affine_backward, affine_forward};
use crate::loss::softmax_loss;
use crate::params::{Gradients, Params, beta_name, bias_name, gamma_name, weight_name};
use crate::tensor::{Scalar, Tensor, cast};
use crate::{Error, Result};

/// A model the solver can train.
///
/// `scores` is the inference path and must not mutate the model; `loss` runs the
/// training-mode forward and backward passes and returns a gradient for every
/// parameter.
pub trait Classifier<T: Scalar> {
    fn params(&self) -> &Params<T>;

    fn params_mut(&mut self) -> &mut Params<T>;

    /// Class scores `(N, C)` for a batch.
    fn scores(&self, x: &Tensor<T>) -> Result<Tensor<T>>;

    /// Data loss plus regularization, and the gradient of that loss.
    fn loss(&mut self, x: &Tensor<T>, y: &[usize]) -> Result<(T, Gradients<T>)>;

    /// Arg-max class per sample.
    fn predict(&self, x: &Tensor<T>) -> Result<Vec<usize>> {
        self.scores(x)?.argmax_rows()
    }

    /// Copy of everything that determines [`Classifier::scores`].
    ///
    /// The default covers the parameters only; models with state outside
    /// [`Params`] must override this and [`Classifier::restore`].
    fn snapshot(&self) -> Snapshot<T> {
        Snapshot {
            params: self.params().clone(),
            batchnorm: Vec::new(),
        }
    }

    /// Put the model back to a state taken by [`Classifier::snapshot`].
    fn restore(&mut self, snapshot: &Snapshot<T>) -> Result<()> {
        self.params_mut().assign(&snapshot.params)
    }
}

/// Saved model state: parameters plus the batch-norm state of each normalized
/// hidden layer, keyed by layer index.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot<T> {
    pub params: Params<T>,
    pub batchnorm: Vec<(usize, BatchNormParam<T>)>,
}

/// One entry of the layer stack. `index` is the 1-based position of the affine
/// layer the entry belongs to.
#[derive(Debug, Clone, PartialEq)]
pub enum Layer<T> {
    Affine { index: usize },
    BatchNorm { index: usize, param: BatchNormParam<T> },
    Relu,
}

enum LayerCache<T> {
    Affine { index: usize, cache: AffineCache<T> },
    BatchNorm { index: usize, cache: BatchNormCache<T> },
    Relu(ReluCache<T>),
}

/// Result of [`FullyConnectedNet::loss_or_scores`].
#[derive(Debug, Clone)]
pub enum ModelOutput<T> {
    Scores(Tensor<T>),
    Loss { loss: T, grads: Gradients<T> },
}

#[derive(Debug, Clone)]
pub struct FullyConnectedNet<T> {
    config: NetConfig,
    layers: Vec<Layer<T>>,
    params: Params<T>,
}

impl<T: Scalar> FullyConnectedNet<T> {
    /// Assemble a net from a configuration and an existing parameter set.
    ///
    /// Every parameter the configuration implies must be present with the right
    /// shape, and no others.
    pub fn from_parts(config: &NetConfig, params: Params<T>) -> Result<Self> {
        config.validate()?;

        let mut dims = Vec::with_capacity(config.hidden_dims.len() + 2);
        dims.push(config.input_dim);
        dims.extend_from_slice(&config.hidden_dims);
        dims.push(config.num_classes);
        let num_layers = dims.len() - 1;

        let mut layers = Vec::new();
        let mut expected = 0;
        for index in 1..=num_layers {
            let (d_in, d_out) = (dims[index - 1], dims[index]);
            check_param(&params, &weight_name(index), &[d_in, d_out])?;
            check_param(&params, &bias_name(index), &[d_out])?;
            expected += 2;
            layers.push(Layer::Affine { index });

            if index == num_layers {
                break;
            }
            if config.use_batchnorm {
                check_param(&params, &gamma_name(index), &[d_out])?;
                check_param(&params, &beta_name(index), &[d_out])?;
                expected += 2;
                let param = BatchNormParam::new(Mode::Train)
                    .with_eps(cast(config.bn_eps))
                    .with_momentum(cast(config.bn_momentum));
                layers.push(Layer::BatchNorm { index, param });
            }
            layers.push(Layer::Relu);
        }

        if params.len() != expected {
            let extra: Vec<&str> = params
                .names()
                .filter(|n| !is_expected_name(n, num_layers, config.use_batchnorm))
                .collect();
            return Err(Error::InvalidData(format!(
                "unexpected parameters for this architecture: {extra:?}"
            )));
        }

        Ok(Self {
            config: config.clone(),
            layers,
            params,
        })
    }

    /// The configuration this net was built from.
    pub fn config(&self) -> &NetConfig {
        &self.config
    }

    #[inline]
    pub fn input_dim(&self) -> usize {
        self.config.input_dim
    }

    #[inline]
    pub fn num_classes(&self) -> usize {
        self.config.num_classes
    }

    pub fn hidden_dims(&self) -> &[usize] {
        &self.config.hidden_dims
    }

    /// Number of affine layers.
    pub fn num_layers(&self) -> usize {
        self.config.hidden_dims.len() + 1
    }

    pub fn use_batchnorm(&self) -> bool {
        self.config.use_batchnorm
    }

    pub fn reg(&self) -> f64 {
        self.config.reg
    }

    pub fn set_reg(&mut self, reg: f64) -> Result<()> {
        if !(reg.is_finite() && reg >= 0.0) {
            return Err(Error::InvalidConfig(format!(
                "reg must be finite and >= 0, got {reg}"
            )));
        }
        self.config.reg = reg;
        Ok(())
    }

    pub fn layers(&self) -> &[Layer<T>] {
        &self.layers
    }

    /// Batch-norm state of hidden layer `index`, if that layer normalizes.
    ///
    /// The net picks the mode per call (`loss` trains, `scores` evaluates), so
    /// the param's own `mode` is left as the caller set it.
    pub fn bn_param(&self, index: usize) -> Option<&BatchNormParam<T>> {
        self.layers.iter().find_map(|l| match l {
            Layer::BatchNorm { index: i, param } if *i == index => Some(param),
            _ => None,
        })
    }

    pub fn bn_param_mut(&mut self, index: usize) -> Option<&mut BatchNormParam<T>> {
        self.layers.iter_mut().find_map(|l| match l {
            Layer::BatchNorm { index: i, param } if *i == index => Some(param),
            _ => None,
        })
    }

    /// Single entry point: scores without labels, loss and gradients with them.
    pub fn loss_or_scores(&mut self, x: &Tensor<T>, y: Option<&[usize]>) -> Result<ModelOutput<T>> {
        match y {
            None => Ok(ModelOutput::Scores(self.forward_scores(x)?)),
            Some(y) => {
                let (loss, grads) = self.forward_backward(x, y)?;
                Ok(ModelOutput::Loss { loss, grads })
            }
        }
    }

    fn check_input(&self, x: &Tensor<T>) -> Result<()> {
        let (_, d) = x.rows_cols()?;
        if d != self.config.input_dim {
            let mut expected = x.shape().to_vec();
            expected.truncate(1);
            expected.push(self.config.input_dim);
            return Err(Error::shape("FullyConnectedNet input", &expected, x.shape()));
        }
        Ok(())
    }

    /// Label count and range are checked up front so that a rejected batch
    /// leaves the running statistics untouched.
    fn check_labels(&self, x: &Tensor<T>, y: &[usize]) -> Result<()> {
        let (n, _) = x.rows_cols()?;
        if y.len() != n {
            return Err(Error::shape("FullyConnectedNet labels", &[n], &[y.len()]));
        }
        let c = self.config.num_classes;
        if let Some(&bad) = y.iter().find(|&&label| label >= c) {
            return Err(Error::InvalidData(format!(
                "label {bad} out of range for {c} classes"
            )));
        }
        Ok(())
    }

    fn forward_scores(&self, x: &Tensor<T>) -> Result<Tensor<T>> {
        self.check_input(x)?;
        let mut h = x.clone();
        for layer in &self.layers {
            h = match layer {
                Layer::Affine { index } => {
                    let w = self.params.require(&weight_name(*index))?;
                    let b = self.params.require(&bias_name(*index))?;
                    affine_forward(&h, w, b)?.0
                }
                Layer::BatchNorm { index, param } => {
                    let gamma = self.params.require(&gamma_name(*index))?;
                    let beta = self.params.require(&beta_name(*index))?;
                    batchnorm_forward_eval(&h, gamma, beta, param)?.0
                }
                Layer::Relu => relu_forward(&h).0,
            };
        }
        Ok(h)
    }

    fn forward_backward(&mut self, x: &Tensor<T>, y: &[usize]) -> Result<(T, Gradients<T>)> {
        self.check_input(x)?;
        self.check_labels(x, y)?;
        let reg: T = cast(self.config.reg);
        let Self { layers, params, .. } = self;

        let mut caches = Vec::with_capacity(layers.len());
        let mut h = x.clone();
        for layer in layers.iter_mut() {
            h = match layer {
                Layer::Affine { index } => {
                    let w = params.require(&weight_name(*index))?;
                    let b = params.require(&bias_name(*index))?;
                    let (out, cache) = affine_forward(&h, w, b)?;
                    caches.push(LayerCache::Affine {
                        index: *index,
                        cache,
                    });
                    out
                }
                Layer::BatchNorm { index, param } => {
                    let gamma = params.require(&gamma_name(*index))?;
                    let beta = params.require(&beta_name(*index))?;
                    let (out, cache) = batchnorm_forward_train(&h, gamma, beta, param)?;
                    caches.push(LayerCache::BatchNorm {
                        index: *index,
                        cache,
                    });
                    out
                }
                Layer::Relu => {
                    let (out, cache) = relu_forward(&h);
                    caches.push(LayerCache::Relu(cache));
                    out
                }
            };
        }

        let (data_loss, dscores) = softmax_loss(&h, y)?;
        let half: T = cast(0.5);
        let mut reg_loss = T::zero();

        let mut grads = Gradients::new();
        let mut dout = dscores;
        for cache in caches.into_iter().rev() {
            match cache {
                LayerCache::Affine { index, cache } => {
                    let g = affine_backward(&dout, cache)?;
                    let name = weight_name(index);
                    let w = params.require(&name)?;
                    reg_loss = reg_loss + half * reg * w.sum_sq();
                    let dw = g.dw.zip_map(w, "weight decay", |dw, w| dw + reg * w)?;
                    grads.insert(name, dw);
                    grads.insert(bias_name(index), g.db);
                    dout = g.dx;
                }
                LayerCache::BatchNorm { index, cache } => {
                    let g = batchnorm_backward(&dout, cache)?;
                    grads.insert(gamma_name(index), g.dgamma);
                    grads.insert(beta_name(index), g.dbeta);
                    dout = g.dx;
                }
                LayerCache::Relu(cache) => {
                    dout = relu_backward(&dout, cache)?;
                }
            }
        }

        Ok((data_loss + reg_loss, grads))
    }
}

impl<T: Scalar> Classifier<T> for FullyConnectedNet<T> {
    fn params(&self) -> &Params<T> {
        &self.params
    }

    fn params_mut(&mut self) -> &mut Params<T> {
        &mut self.params
    }

    fn scores(&self, x: &Tensor<T>) -> Result<Tensor<T>> {
        self.forward_scores(x)
    }

    fn loss(&mut self, x: &Tensor<T>, y: &[usize]) -> Result<(T, Gradients<T>)> {
        self.forward_backward(x, y)
    }

    fn snapshot(&self) -> Snapshot<T> {
        let batchnorm = self
            .layers
            .iter()
            .filter_map(|l| match l {
                Layer::BatchNorm { index, param } => Some((*index, param.clone())),
                _ => None,
            })
            .collect();
        Snapshot {
            params: self.params.clone(),
            batchnorm,
        }
    }

    fn restore(&mut self, snapshot: &Snapshot<T>) -> Result<()> {
        if let Some((index, _)) = snapshot
            .batchnorm
            .iter()
            .find(|(index, _)| self.bn_param(*index).is_none())
        {
            return Err(Error::InvalidData(format!(
                "snapshot has batch norm state for layer {index}, which does not normalize"
            )));
        }
        self.params.assign(&snapshot.params)?;
        for (index, saved) in &snapshot.batchnorm {
            if let Some(param) = self.bn_param_mut(*index) {
                *param = saved.clone();
            }
        }
        Ok(())
    }
}

fn check_param<T: Scalar>(params: &Params<T>, name: &str, shape: &[usize]) -> Result<()> {
    let p = params
        .get(name)
        .ok_or_else(|| Error::UnknownParameter(name.to_owned()))?;
    if p.shape() != shape {
        return Err(Error::InvalidData(format!(
            "parameter {name} has shape {:?}, expected {shape:?}",
            p.shape()
        )));
    }
    Ok(())
}

fn is_expected_name(name: &str, num_layers: usize, use_batchnorm: bool) -> bool {
    (1..=num_layers).any(|i| {
        name == weight_name(i)
            || name == bias_name(i)
            || (use_batchnorm && i < num_layers && (name == gamma_name(i) || name == beta_name(i)))
    })
}
