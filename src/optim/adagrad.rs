//! # Adagrad Optimizer
//!
//! Keeps its squared-gradient sums in a flat buffer indexed by parameter
//! position rather than in the identity-keyed state map.

use log::trace;
use serde::{Deserialize, Serialize};

use super::options::{non_negative, Hyper, OptimizerOptions};
use super::{OptimizerBase, OptimizerCore, Optimizer, ParamGroup};
use crate::error::Result;
use crate::tensor::{ops, Tensor};
use crate::utils::serialization::{InputArchive, OutputArchive};

/// Hyperparameters of [`Adagrad`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdagradOptions {
    pub lr: Hyper<f64>,
    pub lr_decay: Hyper<f64>,
    pub weight_decay: Hyper<f64>,
    /// Starting value of every accumulator.
    pub initial_accumulator_value: Hyper<f64>,
    pub eps: Hyper<f64>,
}

impl Default for AdagradOptions {
    fn default() -> Self {
        AdagradOptions {
            lr: Hyper::implicit(1e-2),
            lr_decay: Hyper::implicit(0.0),
            weight_decay: Hyper::implicit(0.0),
            initial_accumulator_value: Hyper::implicit(0.0),
            eps: Hyper::implicit(1e-10),
        }
    }
}

impl AdagradOptions {
    pub fn new(lr: f64) -> Self {
        AdagradOptions {
            lr: Hyper::explicit(lr),
            ..Default::default()
        }
    }

    pub fn lr_decay(mut self, lr_decay: f64) -> Self {
        self.lr_decay.set(lr_decay);
        self
    }

    pub fn weight_decay(mut self, weight_decay: f64) -> Self {
        self.weight_decay.set(weight_decay);
        self
    }

    pub fn initial_accumulator_value(mut self, value: f64) -> Self {
        self.initial_accumulator_value.set(value);
        self
    }

    pub fn eps(mut self, eps: f64) -> Self {
        self.eps.set(eps);
        self
    }
}

impl OptimizerOptions for AdagradOptions {
    fn lr(&self) -> f64 {
        self.lr.get()
    }

    fn inherit(&mut self, defaults: &Self) {
        self.lr.inherit(&defaults.lr);
        self.lr_decay.inherit(&defaults.lr_decay);
        self.weight_decay.inherit(&defaults.weight_decay);
        self.initial_accumulator_value.inherit(&defaults.initial_accumulator_value);
        self.eps.inherit(&defaults.eps);
    }

    fn validate(&self) -> Result<()> {
        non_negative("lr", self.lr.get())?;
        non_negative("lr_decay", self.lr_decay.get())?;
        non_negative("weight_decay", self.weight_decay.get())?;
        non_negative("initial_accumulator_value", self.initial_accumulator_value.get())?;
        non_negative("eps", self.eps.get())
    }
}

/// Implements the Adagrad algorithm.
/// Reference: Adaptive Subgradient Methods for Online Learning and Stochastic Optimization
/// - http://jmlr.org/papers/v12/duchi11a.html
///
/// Per parameter with a gradient, at step `t`:
/// - `clr = lr / (1 + (t - 1) * lr_decay)`
/// - `sum = sum + grad^2`
/// - `param = param - clr * grad / (sqrt(sum + initial_accumulator_value) + eps)`
#[derive(Debug)]
pub struct Adagrad {
    base: OptimizerBase<(), AdagradOptions>,
    /// Sum of squared gradients, one per parameter position.
    sums: Vec<Tensor>,
    t: u64,
}

impl Adagrad {
    pub fn new<I>(params: I, options: AdagradOptions) -> Result<Self>
    where
        I: IntoIterator<Item = Tensor>,
    {
        Ok(Adagrad {
            base: OptimizerBase::new(params, options)?,
            sums: Vec::new(),
            t: 0,
        })
    }

    pub fn with_groups(
        groups: Vec<ParamGroup<AdagradOptions>>,
        defaults: AdagradOptions,
    ) -> Result<Self> {
        Ok(Adagrad {
            base: OptimizerBase::from_groups(groups, defaults)?,
            sums: Vec::new(),
            t: 0,
        })
    }

    pub fn base(&self) -> &OptimizerBase<(), AdagradOptions> {
        &self.base
    }

    pub fn base_mut(&mut self) -> &mut OptimizerBase<(), AdagradOptions> {
        &mut self.base
    }

    /// Accumulated squared gradients, excluding the initial accumulator value.
    pub fn sums(&self) -> &[Tensor] {
        &self.sums
    }

    /// Number of steps taken.
    pub fn step_count(&self) -> u64 {
        self.t
    }
}

impl OptimizerCore for Adagrad {
    fn zero_grad(&mut self) {
        self.base.zero_grad();
    }

    fn size(&self) -> usize {
        self.base.size()
    }

    fn save(&self, archive: &mut OutputArchive) -> Result<()> {
        // Only the parameter count guard; the state map is unused.
        self.base.save_state(archive, "adagrad", |_, _, _| Ok(()))?;
        archive.write_value("adagrad.step", &self.t)?;
        for (index, sum) in self.sums.iter().enumerate() {
            archive.write_tensor(&format!("adagrad.sum.{}", index), sum);
        }
        Ok(())
    }

    fn load(&mut self, archive: &InputArchive) -> Result<()> {
        self.base.load_state(archive, "adagrad", |_, _, _| Ok(None))?;
        let t = archive.read_value("adagrad.step")?;

        let mut sums = Vec::new();
        for (index, param) in self.base.parameters().enumerate() {
            match archive.read_tensor_for(&format!("adagrad.sum.{}", index), param)? {
                Some(sum) => sums.push(sum),
                None => break,
            }
        }
        trace!("restored {} adagrad accumulators at step {}", sums.len(), t);
        self.sums = sums;
        self.t = t;
        Ok(())
    }
}

impl Optimizer for Adagrad {
    fn step(&mut self) -> Result<()> {
        let t = self.t + 1;
        let mut pending = Vec::new();
        let mut flat = 0;
        for group in self.base.param_groups() {
            let options = group.options_or(self.base.defaults());
            let lr = options.lr.get();
            let lr_decay = options.lr_decay.get();
            let weight_decay = options.weight_decay.get();
            let initial_accumulator_value = options.initial_accumulator_value.get();
            let eps = options.eps.get();
            let clr = lr / (1.0 + (t - 1) as f64 * lr_decay);

            for param in group.params() {
                let index = flat;
                flat += 1;
                let grad = match param.grad() {
                    Some(g) => g.detach(),
                    None => continue,
                };

                let grad = if weight_decay != 0.0 {
                    ops::add(&grad, &ops::mul_scalar(&param.detach(), weight_decay)?)?
                } else {
                    grad
                };

                let sum = self.base.tensor_buffer_at(&mut self.sums, index)?;
                let sum = ops::add(sum, &ops::mul(&grad, &grad)?)?;

                let std = ops::add_scalar(
                    &ops::sqrt(&ops::add_scalar(&sum, initial_accumulator_value)?)?,
                    eps,
                )?;
                let update = ops::mul_scalar(&ops::div(&grad, &std)?, clr)?;
                ops::check_compatible("sub_", param, &update)?;
                pending.push((index, param.clone(), sum, update));
            }
        }

        for (index, param, sum, update) in pending {
            ops::copy_(&self.sums[index], &sum)?;
            ops::sub_(&param, &update)?;
        }
        self.t = t;
        Ok(())
    }
}
