//! Mini-batch training loop.
//!
//! A [`Solver`] owns a model, borrows the data splits, and drives training:
//!
//! - sample `batch_size` training examples uniformly with replacement;
//! - compute loss and gradients with [`Classifier::loss`];
//! - update every parameter with the configured [`UpdateRule`], keeping one
//!   [`OptimState`] per parameter name;
//! - at each epoch end, decay the learning rate, record train/validation accuracy,
//!   and checkpoint the parameters.
//!
//! When training finishes the model holds the checkpointed state (parameters and
//! any layer state such as batch-norm running statistics, see
//! [`Classifier::snapshot`]). With [`CheckpointPolicy::Best`] that is the epoch
//! with the highest validation accuracy.

use std::collections::BTreeMap;

use log::{debug, info};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::data::{DataSplits, Dataset};
use crate::metrics::accuracy;
use crate::net::{Classifier, Snapshot};
use crate::optim::{OptimConfig, OptimState, UpdateRule};
use crate::tensor::{Scalar, to_f64};
use crate::{Error, Result};

/// Which parameters the model ends up with after [`Solver::train`].
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CheckpointPolicy {
    /// Parameters from the epoch with the highest validation accuracy.
    #[default]
    Best,
    /// Parameters after the final iteration.
    Last,
}

#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
#[derive(Debug, Clone, PartialEq)]
pub struct SolverConfig {
    pub update_rule: UpdateRule,
    /// Hyperparameters shared by every parameter. `learning_rate` is the initial rate.
    pub optim_config: OptimConfig,
    /// Learning-rate multiplier applied at the end of each epoch.
    pub lr_decay: f64,
    pub batch_size: usize,
    pub num_epochs: usize,
    /// Log the training loss every this many iterations (when `verbose`).
    pub print_every: usize,
    pub verbose: bool,
    /// Training samples used for the epoch-end accuracy check; `None` uses all.
    pub num_train_samples: Option<usize>,
    /// Validation samples used for the epoch-end accuracy check; `None` uses all.
    pub num_val_samples: Option<usize>,
    /// Batch size for accuracy checks.
    pub eval_batch_size: usize,
    pub checkpoint: CheckpointPolicy,
    /// Seed for mini-batch sampling when the solver creates its own RNG.
    pub seed: u64,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            update_rule: UpdateRule::Sgd,
            optim_config: OptimConfig::default(),
            lr_decay: 1.0,
            batch_size: 100,
            num_epochs: 10,
            print_every: 10,
            verbose: true,
            num_train_samples: Some(1000),
            num_val_samples: None,
            eval_batch_size: 100,
            checkpoint: CheckpointPolicy::Best,
            seed: 0,
        }
    }
}

impl SolverConfig {
    pub fn validate(&self) -> Result<()> {
        self.optim_config.validate()?;
        if !(self.lr_decay.is_finite() && self.lr_decay > 0.0) {
            return Err(Error::InvalidConfig(format!(
                "lr_decay must be finite and > 0, got {}",
                self.lr_decay
            )));
        }
        for (name, value) in [
            ("batch_size", self.batch_size),
            ("num_epochs", self.num_epochs),
            ("print_every", self.print_every),
            ("eval_batch_size", self.eval_batch_size),
        ] {
            if value == 0 {
                return Err(Error::InvalidConfig(format!("{name} must be > 0")));
            }
        }
        if self.num_train_samples == Some(0) || self.num_val_samples == Some(0) {
            return Err(Error::InvalidConfig(
                "accuracy subsample sizes must be > 0".to_owned(),
            ));
        }
        Ok(())
    }
}

/// Metrics recorded during training.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, PartialEq, Default)]
pub struct History {
    /// One entry per iteration.
    pub loss: Vec<f64>,
    /// One entry per epoch.
    pub train_acc: Vec<f64>,
    /// One entry per epoch.
    pub val_acc: Vec<f64>,
}

#[derive(Debug, Clone)]
pub struct TrainReport {
    pub iterations: usize,
    pub final_loss: f64,
    /// Highest validation accuracy over all epochs.
    pub best_val_acc: f64,
    /// 1-based epoch at which `best_val_acc` was first reached.
    pub best_epoch: usize,
    pub history: History,
}

pub struct Solver<'a, T, M, R = StdRng> {
    model: M,
    train: &'a Dataset<T>,
    val: &'a Dataset<T>,
    config: SolverConfig,
    rng: R,
    learning_rate: f64,
    optim_states: BTreeMap<String, OptimState<T>>,
    history: History,
    epoch: usize,
    best_val_acc: Option<f64>,
    best_epoch: usize,
    checkpoint: Option<Snapshot<T>>,
}

impl<'a, T: Scalar, M: Classifier<T>> Solver<'a, T, M, StdRng> {
    /// Solver sampling mini-batches from `StdRng::seed_from_u64(config.seed)`.
    pub fn new(model: M, data: &'a DataSplits<T>, config: SolverConfig) -> Result<Self> {
        let rng = StdRng::seed_from_u64(config.seed);
        Self::with_rng(model, data, config, rng)
    }
}

impl<'a, T: Scalar, M: Classifier<T>, R: Rng> Solver<'a, T, M, R> {
    /// Solver sampling mini-batches from the provided RNG.
    pub fn with_rng(model: M, data: &'a DataSplits<T>, config: SolverConfig, rng: R) -> Result<Self> {
        config.validate()?;
        if data.train.is_empty() {
            return Err(Error::InvalidData(
                "train dataset must not be empty".to_owned(),
            ));
        }
        Ok(Self {
            model,
            train: &data.train,
            val: &data.val,
            learning_rate: config.optim_config.learning_rate,
            config,
            rng,
            optim_states: BTreeMap::new(),
            history: History::default(),
            epoch: 0,
            best_val_acc: None,
            best_epoch: 0,
            checkpoint: None,
        })
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn model_mut(&mut self) -> &mut M {
        &mut self.model
    }

    pub fn into_model(self) -> M {
        self.model
    }

    pub fn config(&self) -> &SolverConfig {
        &self.config
    }

    pub fn history(&self) -> &History {
        &self.history
    }

    /// Current (decayed) learning rate.
    pub fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    /// Completed epochs.
    pub fn epoch(&self) -> usize {
        self.epoch
    }

    pub fn best_val_acc(&self) -> Option<f64> {
        self.best_val_acc
    }

    /// Model state saved by the checkpoint policy so far.
    pub fn checkpoint(&self) -> Option<&Snapshot<T>> {
        self.checkpoint.as_ref()
    }

    pub fn optim_state(&self, name: &str) -> Option<&OptimState<T>> {
        self.optim_states.get(name)
    }

    /// Iterations in one epoch: `ceil(num_train / batch_size)`.
    pub fn iterations_per_epoch(&self) -> usize {
        self.train.len().div_ceil(self.config.batch_size).max(1)
    }

    /// Run the full training loop.
    pub fn train(&mut self) -> Result<TrainReport> {
        let iterations_per_epoch = self.iterations_per_epoch();
        let num_iterations = self.config.num_epochs * iterations_per_epoch;
        let mut last_loss = f64::NAN;

        for t in 0..num_iterations {
            last_loss = self.step(t)?;

            if self.config.verbose && t % self.config.print_every == 0 {
                info!("(Iteration {} / {num_iterations}) loss: {last_loss:.6}", t + 1);
            }

            if (t + 1) % iterations_per_epoch == 0 {
                self.end_epoch()?;
            }
        }

        if let Some(best) = &self.checkpoint {
            self.model.restore(best)?;
        }

        Ok(TrainReport {
            iterations: num_iterations,
            final_loss: last_loss,
            best_val_acc: self.best_val_acc.unwrap_or(0.0),
            best_epoch: self.best_epoch,
            history: self.history.clone(),
        })
    }

    /// One gradient update on a sampled mini-batch. Returns the batch loss.
    fn step(&mut self, iteration: usize) -> Result<f64> {
        let num_train = self.train.len();
        let indices: Vec<usize> = (0..self.config.batch_size)
            .map(|_| self.rng.gen_range(0..num_train))
            .collect();
        let batch = self.train.select(&indices)?;

        let (loss, grads) = self.model.loss(batch.inputs(), batch.labels())?;
        let loss = to_f64(loss);
        if !loss.is_finite() {
            return Err(Error::NonFiniteLoss { iteration, loss });
        }

        let config = self.config.optim_config.with_learning_rate(self.learning_rate);
        let rule = self.config.update_rule;
        // Every update is computed before any is committed, so a failing
        // parameter leaves the model and optimizer state as they were.
        let mut updates = Vec::with_capacity(grads.len());
        for (name, dw) in grads.iter() {
            let w = self.model.params().require(name)?;
            let state = self.optim_states.get(name).cloned().unwrap_or_default();
            let (next_w, state) = rule.apply(w, dw, &config, state)?;
            if next_w.shape() != w.shape() {
                return Err(Error::shape("solver update", w.shape(), next_w.shape()));
            }
            updates.push((name.to_owned(), next_w, state));
        }
        for (name, next_w, state) in updates {
            self.model.params_mut().set(&name, next_w)?;
            self.optim_states.insert(name, state);
        }

        self.history.loss.push(loss);
        Ok(loss)
    }

    fn end_epoch(&mut self) -> Result<()> {
        self.epoch += 1;
        self.learning_rate *= self.config.lr_decay;

        let (train, val) = (self.train, self.val);
        let batch_size = self.config.eval_batch_size;
        let train_acc = self.check_accuracy(train, self.config.num_train_samples, batch_size)?;
        let val_acc = self.check_accuracy(val, self.config.num_val_samples, batch_size)?;
        self.history.train_acc.push(train_acc);
        self.history.val_acc.push(val_acc);

        if self.config.verbose {
            info!(
                "(Epoch {} / {}) train acc: {train_acc:.6}; val_acc: {val_acc:.6}",
                self.epoch, self.config.num_epochs
            );
        }

        let improved = self.best_val_acc.is_none_or(|best| val_acc > best);
        if improved {
            self.best_val_acc = Some(val_acc);
            self.best_epoch = self.epoch;
        }
        let save = match self.config.checkpoint {
            CheckpointPolicy::Best => improved,
            CheckpointPolicy::Last => true,
        };
        if save {
            debug!("checkpoint at epoch {} (val_acc {val_acc:.6})", self.epoch);
            self.checkpoint = Some(self.model.snapshot());
        }
        Ok(())
    }

    /// Classification accuracy of the current model on `data`.
    ///
    /// With `num_samples = Some(n)` and more than `n` samples, `n` samples are drawn
    /// with replacement first. Predictions run `batch_size` samples at a time.
    pub fn check_accuracy(
        &mut self,
        data: &Dataset<T>,
        num_samples: Option<usize>,
        batch_size: usize,
    ) -> Result<f64> {
        if batch_size == 0 {
            return Err(Error::InvalidConfig("batch_size must be > 0".to_owned()));
        }
        let n = data.len();
        let indices: Vec<usize> = match num_samples {
            Some(k) if n > k => (0..k).map(|_| self.rng.gen_range(0..n)).collect(),
            _ => (0..n).collect(),
        };

        let mut predicted = Vec::with_capacity(indices.len());
        let mut labels = Vec::with_capacity(indices.len());
        for chunk in indices.chunks(batch_size) {
            let batch = data.select(chunk)?;
            predicted.extend(self.model.predict(batch.inputs())?);
            labels.extend_from_slice(batch.labels());
        }
        accuracy(&predicted, &labels)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::{NetBuilder, NetConfig};
    use crate::params::Params;
    use crate::tensor::Tensor;

    /// Well separated Gaussian blobs, one per class. Class centers are fixed; `seed`
    /// only changes the noise.
    fn blobs(n: usize, classes: usize, dim: usize, seed: u64) -> Dataset<f64> {
        let centers = Tensor::<f64>::randn(&[classes, dim], 3.0, &mut StdRng::seed_from_u64(99));
        let noise = Tensor::<f64>::randn(&[n, dim], 0.5, &mut StdRng::seed_from_u64(seed));
        let labels: Vec<usize> = (0..n).map(|i| i % classes).collect();
        let mut data = noise.into_vec();
        for (i, &y) in labels.iter().enumerate() {
            for j in 0..dim {
                data[i * dim + j] += centers.data()[y * dim + j];
            }
        }
        Dataset::from_flat(data, &[dim], labels).unwrap()
    }

    fn splits() -> DataSplits<f64> {
        DataSplits::new(blobs(60, 3, 4, 1), blobs(30, 3, 4, 2)).unwrap()
    }

    fn small_net(seed: u64) -> crate::FullyConnectedNet<f64> {
        NetBuilder::new(NetConfig {
            hidden_dims: vec![16],
            input_dim: 4,
            num_classes: 3,
            weight_scale: 0.1,
            ..NetConfig::default()
        })
        .unwrap()
        .build_with_seed(seed)
        .unwrap()
    }

    fn config() -> SolverConfig {
        SolverConfig {
            update_rule: UpdateRule::Adam,
            optim_config: OptimConfig::default().with_learning_rate(1e-2),
            batch_size: 16,
            num_epochs: 8,
            verbose: false,
            ..SolverConfig::default()
        }
    }

    #[test]
    fn records_one_loss_per_iteration_and_one_accuracy_per_epoch() {
        let data = splits();
        let mut solver = Solver::new(small_net(0), &data, config()).unwrap();
        assert_eq!(solver.iterations_per_epoch(), 4);

        let report = solver.train().unwrap();
        assert_eq!(report.iterations, 32);
        assert_eq!(solver.history().loss.len(), 32);
        assert_eq!(solver.history().train_acc.len(), 8);
        assert_eq!(solver.history().val_acc.len(), 8);
        assert_eq!(solver.epoch(), 8);
    }

    #[test]
    fn learning_rate_decays_once_per_epoch() {
        let data = splits();
        let cfg = SolverConfig {
            lr_decay: 0.5,
            num_epochs: 3,
            ..config()
        };
        let mut solver = Solver::new(small_net(0), &data, cfg).unwrap();
        solver.train().unwrap();
        assert!((solver.learning_rate() - 1e-2 * 0.125).abs() < 1e-15);
    }

    #[test]
    fn optimizer_state_is_tracked_per_parameter() {
        let data = splits();
        let mut solver = Solver::new(small_net(0), &data, config()).unwrap();
        solver.train().unwrap();
        for name in ["W1", "b1", "W2", "b2"] {
            match solver.optim_state(name) {
                Some(OptimState::Adam(m)) => assert_eq!(m.t, 32),
                other => panic!("{name}: unexpected state {other:?}"),
            }
        }
    }

    #[test]
    fn final_model_has_best_validation_accuracy() {
        let data = splits();
        let cfg = SolverConfig {
            update_rule: UpdateRule::SgdMomentum,
            optim_config: OptimConfig::default().with_learning_rate(5e-2),
            ..config()
        };
        let mut solver = Solver::new(small_net(3), &data, cfg).unwrap();
        let report = solver.train().unwrap();

        let max = solver
            .history()
            .val_acc
            .iter()
            .cloned()
            .fold(f64::MIN, f64::max);
        assert_eq!(report.best_val_acc, max);
        assert_eq!(solver.history().val_acc[report.best_epoch - 1], max);

        let val = &data.val;
        let recomputed = solver.check_accuracy(val, None, 7).unwrap();
        assert_eq!(recomputed, max);
        assert_eq!(solver.checkpoint(), Some(&solver.model().snapshot()));
    }

    #[test]
    fn last_policy_keeps_final_iterate() {
        let data = splits();
        let cfg = SolverConfig {
            checkpoint: CheckpointPolicy::Last,
            ..config()
        };
        let mut solver = Solver::new(small_net(0), &data, cfg).unwrap();
        solver.train().unwrap();
        let val = &data.val;
        let final_acc = solver.check_accuracy(val, None, 100).unwrap();
        assert_eq!(Some(&final_acc), solver.history().val_acc.last());
    }

    #[test]
    fn same_seed_gives_same_trajectory() {
        let data = splits();
        let run = |seed| {
            let cfg = SolverConfig { seed, ..config() };
            let mut solver = Solver::new(small_net(0), &data, cfg).unwrap();
            solver.train().unwrap().history
        };
        assert_eq!(run(5), run(5));
        assert_ne!(run(5).loss, run(6).loss);
    }

    #[test]
    fn overfits_small_dataset() {
        let data = splits();
        let cfg = SolverConfig {
            num_epochs: 20,
            ..config()
        };
        let mut solver = Solver::new(small_net(0), &data, cfg).unwrap();
        let report = solver.train().unwrap();
        let first = report.history.loss[..4].iter().sum::<f64>() / 4.0;
        let last = report.history.loss[report.history.loss.len() - 4..]
            .iter()
            .sum::<f64>()
            / 4.0;
        assert!(last < first, "loss went from {first} to {last}");
        assert!(report.history.train_acc.last().copied().unwrap_or(0.0) > 0.9);
    }

    #[test]
    fn non_finite_loss_stops_training() {
        let mut train = blobs(20, 2, 3, 0).inputs().clone().into_vec();
        train[4] = f64::NAN;
        let train = Dataset::from_flat(train, &[3], (0..20).map(|i| i % 2).collect()).unwrap();
        let data = DataSplits::new(train.clone(), train).unwrap();
        let net = NetBuilder::with_dims(3, 2)
            .unwrap()
            .build_with_seed::<f64>(0)
            .unwrap();
        let cfg = SolverConfig {
            batch_size: 20,
            num_epochs: 50,
            verbose: false,
            ..SolverConfig::default()
        };
        let mut solver = Solver::new(net, &data, cfg).unwrap();
        let err = solver.train().unwrap_err();
        assert!(matches!(err, Error::NonFiniteLoss { .. }));
    }

    /// Two parameters; the gradient of `b` has the wrong shape.
    struct BrokenGradient {
        params: Params<f64>,
    }

    impl Classifier<f64> for BrokenGradient {
        fn params(&self) -> &Params<f64> {
            &self.params
        }

        fn params_mut(&mut self) -> &mut Params<f64> {
            &mut self.params
        }

        fn scores(&self, x: &Tensor<f64>) -> Result<Tensor<f64>> {
            Ok(Tensor::zeros(&[x.shape()[0], 3]))
        }

        fn loss(&mut self, _x: &Tensor<f64>, _y: &[usize]) -> Result<(f64, Params<f64>)> {
            let mut grads = Params::new();
            grads.insert("a", Tensor::ones(&[2]));
            grads.insert("b", Tensor::ones(&[5]));
            Ok((1.0, grads))
        }
    }

    #[test]
    fn failed_update_commits_nothing() {
        let data = splits();
        let mut params = Params::new();
        params.insert("a", Tensor::zeros(&[2]));
        params.insert("b", Tensor::zeros(&[3]));
        let model = BrokenGradient { params: params.clone() };
        let cfg = SolverConfig {
            update_rule: UpdateRule::SgdMomentum,
            ..config()
        };

        let mut solver = Solver::new(model, &data, cfg).unwrap();
        let err = solver.train().unwrap_err();
        assert!(matches!(err, Error::ShapeMismatch { .. }));
        assert_eq!(solver.model().params(), &params);
        assert!(solver.optim_state("a").is_none());
        assert!(solver.history().loss.is_empty());
    }

    #[test]
    fn rejects_invalid_config() {
        let data = splits();
        let cfg = SolverConfig {
            batch_size: 0,
            ..config()
        };
        assert!(Solver::new(small_net(0), &data, cfg).is_err());
        let cfg = SolverConfig {
            lr_decay: f64::NAN,
            ..config()
        };
        assert!(Solver::new(small_net(0), &data, cfg).is_err());
    }
}
