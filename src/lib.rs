//! Fully-connected classifiers with hand-written backpropagation.
//!
//! `fcnet` is a small, from-scratch training library: every layer exposes an explicit
//! forward/backward pair, gradients are validated against finite differences, and a
//! mini-batch [`Solver`] trains any [`Classifier`] with one of four update rules.
//!
//! # Layout
//!
//! - Layer primitives: [`layer`] (affine and the affine-ReLU sandwiches),
//!   [`activation`] (ReLU), [`batchnorm`], [`loss`] (softmax cross-entropy).
//! - Model: [`FullyConnectedNet`], built with [`NetBuilder`] from a [`NetConfig`].
//! - Update rules: [`optim`] (`sgd`, `sgd_momentum`, `rmsprop`, `adam`).
//! - Training: [`Solver`] with [`SolverConfig`].
//! - Gradient checking: [`gradient_check`].
//!
//! # Data layout and shapes
//!
//! - Elements are generic over [`Scalar`] (`f32` or `f64`).
//! - [`Tensor`] is a flat row-major buffer plus a shape.
//! - Inputs have a leading batch axis; the affine layer flattens the rest, so an
//!   `(N, C, H, W)` image batch feeds a net with `input_dim = C * H * W`.
//! - Weights are `(in_dim, out_dim)`, so a layer computes `X·W + b`.
//! - Incompatible shapes return [`Error::ShapeMismatch`]; nothing broadcasts.
//!
//! # Features
//!
//! - `serde` (default): JSON save/load of trained nets.
//! - `matrixmultiply`: use its `sgemm`/`dgemm` kernels instead of the built-in loop.
//!
//! # Logging
//!
//! The solver reports progress through the [`log`] facade. Install any logger
//! (e.g. `env_logger`) to see it.
//!
//! # Quick start
//!
//! ```rust
//! use fcnet::{Dataset, DataSplits, NetBuilder, Solver, SolverConfig, Tensor, UpdateRule};
//!
//! # fn main() -> fcnet::Result<()> {
//! let x = Tensor::<f64>::from_vec(&[4, 2], vec![0.0, 0.0, 0.0, 1.0, 1.0, 0.0, 1.0, 1.0])?;
//! let y = vec![0, 1, 1, 0];
//! let train = Dataset::new(x, y)?;
//! let data = DataSplits::new(train.clone(), train)?;
//!
//! let net = NetBuilder::with_dims(2, 2)?
//!     .add_hidden_layer(16)?
//!     .weight_scale(0.5)
//!     .build_with_seed::<f64>(0)?;
//!
//! let mut solver = Solver::new(
//!     net,
//!     &data,
//!     SolverConfig {
//!         update_rule: UpdateRule::Adam,
//!         batch_size: 4,
//!         num_epochs: 5,
//!         verbose: false,
//!         ..SolverConfig::default()
//!     },
//! )?;
//! let report = solver.train()?;
//! assert_eq!(report.history.val_acc.len(), 5);
//! # Ok(())
//! # }
//! ```

pub mod activation;
pub mod batchnorm;
pub mod builder;
pub mod data;
pub mod error;
pub mod gradient_check;
pub mod layer;
pub mod loss;
pub(crate) mod matmul;
pub mod metrics;
pub mod net;
pub mod optim;
pub mod params;
pub mod solver;
pub mod tensor;

#[cfg(feature = "serde")]
pub mod serde_model;

pub use batchnorm::{BatchNormParam, Mode};
pub use builder::{NetBuilder, NetConfig};
pub use data::{DataSplits, Dataset};
pub use error::{Error, Result};
pub use net::{Classifier, FullyConnectedNet, Layer, ModelOutput, Snapshot};
pub use optim::{OptimConfig, OptimState, UpdateRule};
pub use params::{Gradients, Params};
pub use solver::{CheckpointPolicy, History, Solver, SolverConfig, TrainReport};
pub use tensor::{Scalar, Tensor};
