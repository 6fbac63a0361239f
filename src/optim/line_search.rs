//! # Backtracking Line-Search Gradient Descent
//!
//! Steepest descent with an Armijo backtracking search along the negative
//! gradient. Each step re-evaluates the loss through the closure, so it
//! implements [`ClosureOptimizer`] rather than [`Optimizer`](super::Optimizer).

use log::debug;
use serde::{Deserialize, Serialize};

use super::options::{non_negative, Hyper, OptimizerOptions};
use super::{ClosureOptimizer, LossClosure, OptimizerBase, OptimizerCore, ParamGroup};
use crate::error::{OptimError, Result};
use crate::tensor::{ops, Tensor};

/// Hyperparameters of [`LineSearchSgd`].
///
/// Only `lr` is read per group; `shrink`, `c1` and `max_evals` are taken from
/// the optimizer defaults because the search runs over all groups at once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineSearchOptions {
    /// Initial step length along `-grad`.
    pub lr: Hyper<f64>,
    /// Factor applied to the step after each rejected trial.
    pub shrink: Hyper<f64>,
    /// Sufficient decrease constant of the Armijo condition.
    pub c1: Hyper<f64>,
    /// Maximum number of trial evaluations per step.
    pub max_evals: Hyper<usize>,
}

impl Default for LineSearchOptions {
    fn default() -> Self {
        LineSearchOptions {
            lr: Hyper::implicit(1.0),
            shrink: Hyper::implicit(0.5),
            c1: Hyper::implicit(1e-4),
            max_evals: Hyper::implicit(20),
        }
    }
}

impl LineSearchOptions {
    pub fn new(lr: f64) -> Self {
        LineSearchOptions {
            lr: Hyper::explicit(lr),
            ..Default::default()
        }
    }

    pub fn shrink(mut self, shrink: f64) -> Self {
        self.shrink.set(shrink);
        self
    }

    pub fn c1(mut self, c1: f64) -> Self {
        self.c1.set(c1);
        self
    }

    pub fn max_evals(mut self, max_evals: usize) -> Self {
        self.max_evals.set(max_evals);
        self
    }
}

fn open_unit_interval(name: &'static str, value: f64) -> Result<()> {
    if value > 0.0 && value < 1.0 {
        Ok(())
    } else {
        Err(OptimError::InvalidOption { name, value })
    }
}

impl OptimizerOptions for LineSearchOptions {
    fn lr(&self) -> f64 {
        self.lr.get()
    }

    fn inherit(&mut self, defaults: &Self) {
        self.lr.inherit(&defaults.lr);
        self.shrink.inherit(&defaults.shrink);
        self.c1.inherit(&defaults.c1);
        self.max_evals.inherit(&defaults.max_evals);
    }

    fn validate(&self) -> Result<()> {
        non_negative("lr", self.lr.get())?;
        open_unit_interval("shrink", self.shrink.get())?;
        open_unit_interval("c1", self.c1.get())?;
        if self.max_evals.get() == 0 {
            return Err(OptimError::InvalidOption {
                name: "max_evals",
                value: 0.0,
            });
        }
        Ok(())
    }
}

/// Starting point of one parameter during a search.
struct Trial {
    param: Tensor,
    origin: Tensor,
    direction: Tensor,
    lr: f64,
}

/// Gradient descent whose step length is found by backtracking.
///
/// One `step`:
/// 1. evaluates `f0 = closure()` to populate gradients,
/// 2. tries `param = origin - t * lr * grad` for `t = 1, shrink, shrink^2, ...`,
/// 3. accepts the first trial with `f(t) <= f0 - c1 * t * sum(lr * |grad|^2)`.
///
/// When no trial is accepted within `max_evals` the last trial point is kept.
/// The returned loss is the one from the final closure call.
#[derive(Debug)]
pub struct LineSearchSgd {
    base: OptimizerBase<(), LineSearchOptions>,
}

impl LineSearchSgd {
    pub fn new<I>(params: I, options: LineSearchOptions) -> Result<Self>
    where
        I: IntoIterator<Item = Tensor>,
    {
        Ok(LineSearchSgd {
            base: OptimizerBase::new(params, options)?,
        })
    }

    pub fn with_groups(
        groups: Vec<ParamGroup<LineSearchOptions>>,
        defaults: LineSearchOptions,
    ) -> Result<Self> {
        Ok(LineSearchSgd {
            base: OptimizerBase::from_groups(groups, defaults)?,
        })
    }

    pub fn base(&self) -> &OptimizerBase<(), LineSearchOptions> {
        &self.base
    }

    pub fn base_mut(&mut self) -> &mut OptimizerBase<(), LineSearchOptions> {
        &mut self.base
    }
}

impl OptimizerCore for LineSearchSgd {
    fn zero_grad(&mut self) {
        self.base.zero_grad();
    }

    fn size(&self) -> usize {
        self.base.size()
    }
}

impl ClosureOptimizer for LineSearchSgd {
    fn step(&mut self, closure: LossClosure<'_>) -> Result<Tensor> {
        let mut loss = closure()?;
        let f0 = loss.item()?;

        let defaults = self.base.defaults();
        let shrink = defaults.shrink.get();
        let c1 = defaults.c1.get();
        let max_evals = defaults.max_evals.get();

        // Copies, so that gradients rewritten by the closure don't move the origin.
        let mut trials = Vec::new();
        for group in self.base.param_groups() {
            let lr = group.options_or(defaults).lr.get();
            for param in group.params() {
                if let Some(grad) = param.grad() {
                    trials.push(Trial {
                        param: param.clone(),
                        origin: param.to(param.device(), param.dtype()),
                        direction: grad.to(grad.device(), grad.dtype()),
                        lr,
                    });
                }
            }
        }
        if trials.is_empty() {
            return Ok(loss);
        }

        let mut decrease = 0.0;
        for trial in &trials {
            decrease += trial.lr * ops::dot(&trial.direction, &trial.direction)?;
        }

        let mut t = 1.0;
        for eval in 1..=max_evals {
            for trial in &trials {
                let stride = ops::mul_scalar(&trial.direction, t * trial.lr)?;
                let moved = ops::sub(&trial.origin, &stride)?;
                ops::copy_(&trial.param, &moved)?;
            }
            let evaluated = closure().and_then(|trial_loss| {
                let f = trial_loss.item()?;
                Ok((trial_loss, f))
            });
            let f = match evaluated {
                Ok((trial_loss, f)) => {
                    loss = trial_loss;
                    f
                }
                Err(err) => {
                    debug!("trial evaluation failed, restoring {} parameters", trials.len());
                    for trial in &trials {
                        ops::copy_(&trial.param, &trial.origin)?;
                    }
                    return Err(err);
                }
            };
            if f <= f0 - c1 * t * decrease {
                debug!(
                    "line search accepted t = {} after {} evaluations (loss {} -> {})",
                    t, eval, f0, f
                );
                return Ok(loss);
            }
            t *= shrink;
        }

        debug!("line search gave up after {} evaluations (loss {})", max_evals, f0);
        Ok(loss)
    }
}
