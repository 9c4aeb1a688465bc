//! First-order update rules.
//!
//! Each rule is a pure function of `(param, grad, config, state)` that returns the
//! updated parameter and the updated state. The gradient is never modified.
//!
//! Design notes:
//! - Optimizer *state* (velocity, squared-gradient cache, Adam moments) lives outside
//!   the model. The solver keeps one [`OptimState`] per parameter name.
//! - State is created lazily: pass [`OptimState::Empty`] on the first step and the
//!   rule allocates zeros of the right shape.

use std::fmt;
use std::str::FromStr;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::tensor::{Scalar, Tensor, cast};
use crate::{Error, Result};

/// Which update rule the solver applies to every parameter.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UpdateRule {
    /// `w -= lr * dw`
    #[default]
    Sgd,
    SgdMomentum,
    #[cfg_attr(feature = "serde", serde(rename = "rmsprop"))]
    RmsProp,
    Adam,
}

impl UpdateRule {
    pub fn as_str(self) -> &'static str {
        match self {
            UpdateRule::Sgd => "sgd",
            UpdateRule::SgdMomentum => "sgd_momentum",
            UpdateRule::RmsProp => "rmsprop",
            UpdateRule::Adam => "adam",
        }
    }

    /// Apply one step of this rule to a single parameter.
    ///
    /// `state` must be [`OptimState::Empty`] or the kind this rule produces.
    pub fn apply<T: Scalar>(
        self,
        w: &Tensor<T>,
        dw: &Tensor<T>,
        config: &OptimConfig,
        state: OptimState<T>,
    ) -> Result<(Tensor<T>, OptimState<T>)> {
        match (self, state) {
            (UpdateRule::Sgd, OptimState::Empty) => Ok((sgd(w, dw, config)?, OptimState::Empty)),
            (UpdateRule::SgdMomentum, OptimState::Empty) => {
                let (next, v) = sgd_momentum(w, dw, config, None)?;
                Ok((next, OptimState::Velocity(v)))
            }
            (UpdateRule::SgdMomentum, OptimState::Velocity(v)) => {
                let (next, v) = sgd_momentum(w, dw, config, Some(v))?;
                Ok((next, OptimState::Velocity(v)))
            }
            (UpdateRule::RmsProp, OptimState::Empty) => {
                let (next, c) = rmsprop(w, dw, config, None)?;
                Ok((next, OptimState::Cache(c)))
            }
            (UpdateRule::RmsProp, OptimState::Cache(c)) => {
                let (next, c) = rmsprop(w, dw, config, Some(c))?;
                Ok((next, OptimState::Cache(c)))
            }
            (UpdateRule::Adam, OptimState::Empty) => {
                let (next, m) = adam(w, dw, config, None)?;
                Ok((next, OptimState::Adam(m)))
            }
            (UpdateRule::Adam, OptimState::Adam(m)) => {
                let (next, m) = adam(w, dw, config, Some(m))?;
                Ok((next, OptimState::Adam(m)))
            }
            (rule, state) => Err(Error::InvalidConfig(format!(
                "update rule {rule} cannot continue from {} state",
                state.kind()
            ))),
        }
    }
}

impl fmt::Display for UpdateRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UpdateRule {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "sgd" => Ok(UpdateRule::Sgd),
            "sgd_momentum" => Ok(UpdateRule::SgdMomentum),
            "rmsprop" => Ok(UpdateRule::RmsProp),
            "adam" => Ok(UpdateRule::Adam),
            other => Err(Error::InvalidConfig(format!(
                "unknown update rule {other:?}; expected one of sgd, sgd_momentum, rmsprop, adam"
            ))),
        }
    }
}

/// Hyperparameters shared by every parameter's update.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OptimConfig {
    pub learning_rate: f64,
    /// Velocity decay for `sgd_momentum`.
    pub momentum: f64,
    /// Squared-gradient decay for `rmsprop`.
    pub decay_rate: f64,
    pub beta1: f64,
    pub beta2: f64,
    /// Added to the denominator of `rmsprop` and `adam`.
    pub epsilon: f64,
}

impl Default for OptimConfig {
    fn default() -> Self {
        Self {
            learning_rate: 1e-2,
            momentum: 0.9,
            decay_rate: 0.99,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
        }
    }
}

impl OptimConfig {
    pub fn with_learning_rate(mut self, learning_rate: f64) -> Self {
        self.learning_rate = learning_rate;
        self
    }

    /// Validate hyperparameters.
    pub fn validate(&self) -> Result<()> {
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(Error::InvalidConfig(format!(
                "learning_rate must be finite and > 0, got {}",
                self.learning_rate
            )));
        }
        for (name, value) in [
            ("momentum", self.momentum),
            ("decay_rate", self.decay_rate),
            ("adam beta1", self.beta1),
            ("adam beta2", self.beta2),
        ] {
            if !(value.is_finite() && (0.0..1.0).contains(&value)) {
                return Err(Error::InvalidConfig(format!(
                    "{name} must be finite and in [0,1), got {value}"
                )));
            }
        }
        if !(self.epsilon.is_finite() && self.epsilon > 0.0) {
            return Err(Error::InvalidConfig(format!(
                "epsilon must be finite and > 0, got {}",
                self.epsilon
            )));
        }
        Ok(())
    }
}

/// Per-parameter optimizer state.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum OptimState<T> {
    /// Nothing recorded yet (or a stateless rule).
    #[default]
    Empty,
    Velocity(Tensor<T>),
    /// Moving average of squared gradients.
    Cache(Tensor<T>),
    Adam(AdamMoments<T>),
}

impl<T> OptimState<T> {
    fn kind(&self) -> &'static str {
        match self {
            OptimState::Empty => "empty",
            OptimState::Velocity(_) => "velocity",
            OptimState::Cache(_) => "cache",
            OptimState::Adam(_) => "adam",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AdamMoments<T> {
    pub m: Tensor<T>,
    pub v: Tensor<T>,
    /// Number of steps taken so far.
    pub t: u64,
}

/// `w - lr * dw`
pub fn sgd<T: Scalar>(w: &Tensor<T>, dw: &Tensor<T>, config: &OptimConfig) -> Result<Tensor<T>> {
    let lr: T = cast(config.learning_rate);
    w.zip_map(dw, "sgd", |w, g| w - lr * g)
}

/// `v = mu * v - lr * dw; w + v`. Returns `(next_w, v)`.
pub fn sgd_momentum<T: Scalar>(
    w: &Tensor<T>,
    dw: &Tensor<T>,
    config: &OptimConfig,
    velocity: Option<Tensor<T>>,
) -> Result<(Tensor<T>, Tensor<T>)> {
    let lr: T = cast(config.learning_rate);
    let mu: T = cast(config.momentum);
    let v = state_or_zeros(velocity, w, "sgd_momentum velocity")?;

    let v = v.zip_map(dw, "sgd_momentum", |v, g| mu * v - lr * g)?;
    let next = w.add(&v)?;
    Ok((next, v))
}

/// `c = d * c + (1 - d) * dw²; w - lr * dw / (sqrt(c) + eps)`. Returns `(next_w, c)`.
pub fn rmsprop<T: Scalar>(
    w: &Tensor<T>,
    dw: &Tensor<T>,
    config: &OptimConfig,
    cache: Option<Tensor<T>>,
) -> Result<(Tensor<T>, Tensor<T>)> {
    let lr: T = cast(config.learning_rate);
    let decay: T = cast(config.decay_rate);
    let eps: T = cast(config.epsilon);
    let c = state_or_zeros(cache, w, "rmsprop cache")?;

    let c = c.zip_map(dw, "rmsprop", |c, g| decay * c + (T::one() - decay) * g * g)?;
    let step = dw.zip_map(&c, "rmsprop", |g, c| lr * g / (c.sqrt() + eps))?;
    let next = w.sub(&step)?;
    Ok((next, c))
}

/// Bias-corrected Adam step. Returns `(next_w, moments)` with `t` incremented.
pub fn adam<T: Scalar>(
    w: &Tensor<T>,
    dw: &Tensor<T>,
    config: &OptimConfig,
    moments: Option<AdamMoments<T>>,
) -> Result<(Tensor<T>, AdamMoments<T>)> {
    let lr: T = cast(config.learning_rate);
    let beta1: T = cast(config.beta1);
    let beta2: T = cast(config.beta2);
    let eps: T = cast(config.epsilon);

    let (m, v, t) = match moments {
        Some(AdamMoments { m, v, t }) => (m, v, t),
        None => (w.zeros_like(), w.zeros_like(), 0),
    };
    if m.shape() != w.shape() {
        return Err(Error::shape("adam m", w.shape(), m.shape()));
    }
    if v.shape() != w.shape() {
        return Err(Error::shape("adam v", w.shape(), v.shape()));
    }

    let t = t + 1;
    let exp = i32::try_from(t).unwrap_or(i32::MAX);
    let corr1 = T::one() - beta1.powi(exp);
    let corr2 = T::one() - beta2.powi(exp);

    let m = m.zip_map(dw, "adam", |m, g| beta1 * m + (T::one() - beta1) * g)?;
    let v = v.zip_map(dw, "adam", |v, g| beta2 * v + (T::one() - beta2) * g * g)?;
    let step = m.zip_map(&v, "adam", |m, v| {
        let m_hat = m / corr1;
        let v_hat = v / corr2;
        lr * m_hat / (v_hat.sqrt() + eps)
    })?;
    let next = w.sub(&step)?;
    Ok((next, AdamMoments { m, v, t }))
}

fn state_or_zeros<T: Scalar>(
    state: Option<Tensor<T>>,
    w: &Tensor<T>,
    op: &'static str,
) -> Result<Tensor<T>> {
    match state {
        Some(s) if s.shape() == w.shape() => Ok(s),
        Some(s) => Err(Error::shape(op, w.shape(), s.shape())),
        None => Ok(w.zeros_like()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gradient_check::rel_error;

    const N: usize = 4;
    const D: usize = 5;

    fn grid(start: f64, stop: f64) -> Tensor<f64> {
        Tensor::linspace(start, stop, N * D).reshape(&[N, D]).unwrap()
    }

    fn literal(rows: [[f64; D]; N]) -> Tensor<f64> {
        Tensor::from_vec(&[N, D], rows.concat()).unwrap()
    }

    #[test]
    fn sgd_momentum_matches_reference_update() {
        let w = grid(-0.4, 0.6);
        let dw = grid(-0.6, 0.4);
        let v = grid(0.6, 0.9);
        let config = OptimConfig::default().with_learning_rate(1e-3);

        let (next_w, v) = sgd_momentum(&w, &dw, &config, Some(v)).unwrap();

        let expected_next_w = literal([
            [0.1406, 0.20738947, 0.27417895, 0.34096842, 0.40775789],
            [0.47454737, 0.54133684, 0.60812632, 0.67491579, 0.74170526],
            [0.80849474, 0.87528421, 0.94207368, 1.00886316, 1.07565263],
            [1.14244211, 1.20923158, 1.27602105, 1.34281053, 1.4096],
        ]);
        let expected_velocity = literal([
            [0.5406, 0.55475789, 0.56891579, 0.58307368, 0.59723158],
            [0.61138947, 0.62554737, 0.63970526, 0.65386316, 0.66802105],
            [0.68217895, 0.69633684, 0.71049474, 0.72465263, 0.73881053],
            [0.75296842, 0.76712632, 0.78128421, 0.79544211, 0.8096],
        ]);
        assert!(rel_error(&next_w, &expected_next_w).unwrap() < 1e-6);
        assert!(rel_error(&v, &expected_velocity).unwrap() < 1e-6);
    }

    #[test]
    fn rmsprop_matches_reference_update() {
        let w = grid(-0.4, 0.6);
        let dw = grid(-0.6, 0.4);
        let cache = grid(0.6, 0.9);
        let config = OptimConfig::default().with_learning_rate(1e-2);

        let (next_w, cache) = rmsprop(&w, &dw, &config, Some(cache)).unwrap();

        let expected_next_w = literal([
            [-0.39223849, -0.34037513, -0.28849239, -0.23659121, -0.18467247],
            [-0.132737, -0.08078555, -0.02881884, 0.02316247, 0.07515774],
            [0.12716641, 0.17918792, 0.23122175, 0.28326742, 0.33532447],
            [0.38739248, 0.43947102, 0.49155973, 0.54365823, 0.59576619],
        ]);
        let expected_cache = literal([
            [0.5976, 0.6126277, 0.6277108, 0.64284931, 0.65804321],
            [0.67329252, 0.68859723, 0.70395734, 0.71937285, 0.73484377],
            [0.75037008, 0.7659518, 0.78158892, 0.79728144, 0.81302936],
            [0.82883269, 0.84469141, 0.86060554, 0.87657507, 0.8926],
        ]);
        assert!(rel_error(&next_w, &expected_next_w).unwrap() < 1e-6);
        assert!(rel_error(&cache, &expected_cache).unwrap() < 1e-6);
    }

    #[test]
    fn adam_matches_reference_update() {
        let w = grid(-0.4, 0.6);
        let dw = grid(-0.6, 0.4);
        let moments = AdamMoments {
            m: grid(0.6, 0.9),
            v: grid(0.7, 0.5),
            t: 5,
        };
        let config = OptimConfig::default().with_learning_rate(1e-2);

        let (next_w, moments) = adam(&w, &dw, &config, Some(moments)).unwrap();

        let expected_next_w = literal([
            [-0.40094747, -0.34836187, -0.29577703, -0.24319299, -0.19060977],
            [-0.1380274, -0.08544591, -0.03286534, 0.01971428, 0.0722929],
            [0.1248705, 0.17744702, 0.23002243, 0.28259667, 0.33516969],
            [0.38774145, 0.44031188, 0.49288093, 0.54544852, 0.59801459],
        ]);
        let expected_v = literal([
            [0.69966, 0.68908382, 0.67851319, 0.66794809, 0.65738853],
            [0.64683452, 0.63628604, 0.6257431, 0.61520571, 0.60467385],
            [0.59414753, 0.58362676, 0.57311152, 0.56260183, 0.55209767],
            [0.54159906, 0.53110598, 0.52061845, 0.51013645, 0.49966],
        ]);
        let expected_m = literal([
            [0.48, 0.49947368, 0.51894737, 0.53842105, 0.55789474],
            [0.57736842, 0.59684211, 0.61631579, 0.63578947, 0.65526316],
            [0.67473684, 0.69421053, 0.71368421, 0.73315789, 0.75263158],
            [0.77210526, 0.79157895, 0.81105263, 0.83052632, 0.85],
        ]);
        assert!(rel_error(&next_w, &expected_next_w).unwrap() < 1e-6);
        assert!(rel_error(&moments.v, &expected_v).unwrap() < 1e-6);
        assert!(rel_error(&moments.m, &expected_m).unwrap() < 1e-6);
        assert_eq!(moments.t, 6);
    }

    #[test]
    fn rules_leave_gradient_untouched_and_create_state_lazily() {
        let w = grid(-0.4, 0.6);
        let dw = grid(-0.6, 0.4);
        let before = dw.clone();
        let config = OptimConfig::default();

        for rule in [
            UpdateRule::Sgd,
            UpdateRule::SgdMomentum,
            UpdateRule::RmsProp,
            UpdateRule::Adam,
        ] {
            let (next, state) = rule.apply(&w, &dw, &config, OptimState::Empty).unwrap();
            assert_eq!(dw, before);
            assert_eq!(next.shape(), w.shape());
            let (_, state) = rule.apply(&next, &dw, &config, state).unwrap();
            match (rule, state) {
                (UpdateRule::Sgd, OptimState::Empty) => {}
                (UpdateRule::SgdMomentum, OptimState::Velocity(v)) => assert_eq!(v.shape(), &[N, D]),
                (UpdateRule::RmsProp, OptimState::Cache(c)) => assert_eq!(c.shape(), &[N, D]),
                (UpdateRule::Adam, OptimState::Adam(m)) => assert_eq!(m.t, 2),
                (rule, state) => panic!("{rule} produced {state:?}"),
            }
        }
    }

    #[test]
    fn sgd_momentum_first_step_matches_sgd() {
        let w = Tensor::<f64>::from_f64(&[1.0, 2.0]);
        let dw = Tensor::from_f64(&[3.0, 4.0]);
        let config = OptimConfig::default().with_learning_rate(0.1);
        let (a, _) = sgd_momentum(&w, &dw, &config, None).unwrap();
        let b = sgd(&w, &dw, &config).unwrap();
        assert!(rel_error(&a, &b).unwrap() < 1e-12);
    }

    #[test]
    fn mismatched_state_is_rejected() {
        let w = Tensor::<f64>::zeros(&[2, 2]);
        let dw = Tensor::zeros(&[2, 2]);
        let config = OptimConfig::default();

        let err = UpdateRule::Adam
            .apply(&w, &dw, &config, OptimState::Velocity(Tensor::zeros(&[2, 2])))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));

        let err = sgd_momentum(&w, &dw, &config, Some(Tensor::zeros(&[3]))).unwrap_err();
        assert!(matches!(err, Error::ShapeMismatch { .. }));
    }

    #[test]
    fn rule_names_round_trip() {
        for name in ["sgd", "sgd_momentum", "rmsprop", "adam"] {
            let rule: UpdateRule = name.parse().unwrap();
            assert_eq!(rule.as_str(), name);
        }
        assert!("adagrad".parse::<UpdateRule>().is_err());
    }

    #[test]
    fn validation_rejects_bad_hyperparams() {
        assert!(OptimConfig::default().validate().is_ok());
        assert!(OptimConfig::default().with_learning_rate(0.0).validate().is_err());
        assert!(
            OptimConfig {
                momentum: 1.0,
                ..OptimConfig::default()
            }
            .validate()
            .is_err()
        );
        assert!(
            OptimConfig {
                beta2: f64::NAN,
                ..OptimConfig::default()
            }
            .validate()
            .is_err()
        );
        assert!(
            OptimConfig {
                epsilon: 0.0,
                ..OptimConfig::default()
            }
            .validate()
            .is_err()
        );
    }
}
