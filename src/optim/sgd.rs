//! # Stochastic Gradient Descent (SGD) Optimizer

use log::debug;
use serde::{Deserialize, Serialize};

use super::options::{non_negative, Hyper, OptimizerOptions};
use super::{OptimizerBase, OptimizerCore, Optimizer, ParamGroup};
use crate::error::{OptimError, Result};
use crate::tensor::{ops, Tensor};
use crate::utils::serialization::{InputArchive, OutputArchive};

/// Hyperparameters of [`Sgd`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SgdOptions {
    pub lr: Hyper<f64>,
    pub momentum: Hyper<f64>,
    pub dampening: Hyper<f64>,
    pub weight_decay: Hyper<f64>,
    pub nesterov: Hyper<bool>,
}

impl Default for SgdOptions {
    fn default() -> Self {
        SgdOptions {
            lr: Hyper::implicit(0.01),
            momentum: Hyper::implicit(0.0),
            dampening: Hyper::implicit(0.0),
            weight_decay: Hyper::implicit(0.0),
            nesterov: Hyper::implicit(false),
        }
    }
}

impl SgdOptions {
    pub fn new(lr: f64) -> Self {
        SgdOptions {
            lr: Hyper::explicit(lr),
            ..Default::default()
        }
    }

    pub fn momentum(mut self, momentum: f64) -> Self {
        self.momentum.set(momentum);
        self
    }

    pub fn dampening(mut self, dampening: f64) -> Self {
        self.dampening.set(dampening);
        self
    }

    pub fn weight_decay(mut self, weight_decay: f64) -> Self {
        self.weight_decay.set(weight_decay);
        self
    }

    pub fn nesterov(mut self, nesterov: bool) -> Self {
        self.nesterov.set(nesterov);
        self
    }
}

impl OptimizerOptions for SgdOptions {
    fn lr(&self) -> f64 {
        self.lr.get()
    }

    fn inherit(&mut self, defaults: &Self) {
        self.lr.inherit(&defaults.lr);
        self.momentum.inherit(&defaults.momentum);
        self.dampening.inherit(&defaults.dampening);
        self.weight_decay.inherit(&defaults.weight_decay);
        self.nesterov.inherit(&defaults.nesterov);
    }

    fn validate(&self) -> Result<()> {
        non_negative("lr", self.lr.get())?;
        non_negative("momentum", self.momentum.get())?;
        non_negative("dampening", self.dampening.get())?;
        non_negative("weight_decay", self.weight_decay.get())?;
        // Nesterov requires momentum > 0 and dampening = 0
        if self.nesterov.get() && (self.momentum.get() <= 0.0 || self.dampening.get() != 0.0) {
            return Err(OptimError::InvalidOption {
                name: "nesterov momentum",
                value: self.momentum.get(),
            });
        }
        Ok(())
    }
}

/// Momentum buffer of one parameter.
#[derive(Debug, Clone)]
pub struct SgdParamState {
    pub momentum_buffer: Tensor,
}

/// Implements the Stochastic Gradient Descent optimizer.
/// Supports momentum, dampening, weight decay, and Nesterov momentum.
///
/// Per parameter, following PyTorch:
/// - weight decay: `d_p = grad + weight_decay * param`
/// - momentum: `buf = d_p` on the first step, then
///   `buf = momentum * buf + (1 - dampening) * d_p`
/// - `d_p = d_p + momentum * buf` with Nesterov, `d_p = buf` without
/// - `param = param - lr * d_p`
#[derive(Debug)]
pub struct Sgd {
    base: OptimizerBase<SgdParamState, SgdOptions>,
}

impl Sgd {
    /// Creates an SGD optimizer over a single group of parameters.
    pub fn new<I>(params: I, options: SgdOptions) -> Result<Self>
    where
        I: IntoIterator<Item = Tensor>,
    {
        Ok(Sgd {
            base: OptimizerBase::new(params, options)?,
        })
    }

    /// Creates an SGD optimizer over several groups; `defaults` fills whatever
    /// a group leaves unset.
    pub fn with_groups(groups: Vec<ParamGroup<SgdOptions>>, defaults: SgdOptions) -> Result<Self> {
        Ok(Sgd {
            base: OptimizerBase::from_groups(groups, defaults)?,
        })
    }

    pub fn base(&self) -> &OptimizerBase<SgdParamState, SgdOptions> {
        &self.base
    }

    pub fn base_mut(&mut self) -> &mut OptimizerBase<SgdParamState, SgdOptions> {
        &mut self.base
    }
}

impl OptimizerCore for Sgd {
    fn zero_grad(&mut self) {
        self.base.zero_grad();
    }

    fn size(&self) -> usize {
        self.base.size()
    }

    fn save(&self, archive: &mut OutputArchive) -> Result<()> {
        self.base.save_state(archive, "sgd", |archive, index, state| {
            archive.write_tensor(&format!("sgd.momentum_buffer.{}", index), &state.momentum_buffer);
            Ok(())
        })
    }

    fn load(&mut self, archive: &InputArchive) -> Result<()> {
        self.base.load_state(archive, "sgd", |archive, index, param| {
            let key = format!("sgd.momentum_buffer.{}", index);
            let buffer = archive.read_tensor_for(&key, param)?;
            Ok(buffer.map(|momentum_buffer| SgdParamState { momentum_buffer }))
        })
    }
}

impl Optimizer for Sgd {
    fn step(&mut self) -> Result<()> {
        let (groups, defaults, state) = self.base.groups_and_state_mut();
        // (param, new momentum buffer, update), applied once every update is known
        let mut pending = Vec::new();
        for group in groups {
            let options = group.options_or(defaults);
            let lr = options.lr.get();
            let momentum = options.momentum.get();
            let dampening = options.dampening.get();
            let weight_decay = options.weight_decay.get();
            let nesterov = options.nesterov.get();

            for param in group.params() {
                // Skip parameters without computed gradients
                let grad = match param.grad() {
                    Some(g) => g.detach(),
                    None => continue,
                };

                let mut d_p = grad;
                if weight_decay != 0.0 {
                    let decay_term = ops::mul_scalar(&param.detach(), weight_decay)?;
                    d_p = ops::add(&d_p, &decay_term)?;
                }

                let mut momentum_buffer = None;
                if momentum != 0.0 {
                    let buf = match state.get(param.id()) {
                        Some(entry) => ops::add(
                            &ops::mul_scalar(&entry.momentum_buffer, momentum)?,
                            &ops::mul_scalar(&d_p, 1.0 - dampening)?,
                        )?,
                        None => d_p.to(d_p.device(), d_p.dtype()),
                    };

                    d_p = if nesterov {
                        ops::add(&d_p, &ops::mul_scalar(&buf, momentum)?)?
                    } else {
                        buf.clone()
                    };
                    momentum_buffer = Some(buf);
                }

                let update = ops::mul_scalar(&d_p, lr)?;
                ops::check_compatible("sub_", param, &update)?;
                pending.push((param.clone(), momentum_buffer, update));
            }
        }

        for (param, momentum_buffer, update) in pending {
            if let Some(buf) = momentum_buffer {
                match state.get_mut(param.id()) {
                    Some(entry) => ops::copy_(&entry.momentum_buffer, &buf)?,
                    None => {
                        debug!("creating momentum buffer for parameter {}", param.id());
                        state.insert(param.id(), SgdParamState { momentum_buffer: buf });
                    }
                }
            }
            // param = param - lr * d_p, written in place
            ops::sub_(&param, &update)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::DType;

    fn param(values: &[f64]) -> Tensor {
        Tensor::from_vec(&[values.len()], values.to_vec(), DType::F64, true).unwrap()
    }

    fn grad(values: &[f64]) -> Tensor {
        Tensor::from_vec(&[values.len()], values.to_vec(), DType::F64, false).unwrap()
    }

    fn assert_close(actual: &[f64], expected: &[f64]) {
        for (a, e) in actual.iter().zip(expected) {
            assert!((a - e).abs() < 1e-9, "{:?} != {:?}", actual, expected);
        }
    }

    #[test]
    fn default_options() {
        let options = SgdOptions::default();
        assert_eq!(options.lr(), 0.01);
        assert_eq!(options.momentum.get(), 0.0);
        assert!(!options.nesterov.get());
        assert!(!options.lr.is_explicit());
    }

    #[test]
    fn nesterov_needs_momentum() {
        let err = Sgd::new(vec![param(&[1.0])], SgdOptions::new(0.1).nesterov(true)).unwrap_err();
        assert!(matches!(err, OptimError::InvalidOption { .. }));
    }

    #[test]
    fn vanilla_step() {
        let w = param(&[1.0, 2.0, 3.0, 4.0]);
        let mut opt = Sgd::new(vec![w.clone()], SgdOptions::new(0.1)).unwrap();
        w.set_grad(grad(&[0.1, 0.2, 0.3, 0.4])).unwrap();
        opt.step().unwrap();
        assert_close(&w.to_vec(), &[0.99, 1.98, 2.97, 3.96]);
        assert!(opt.base().state().is_empty());
    }

    #[test]
    fn skips_parameters_without_grad() {
        let w = param(&[1.0]);
        let mut opt = Sgd::new(vec![w.clone()], SgdOptions::new(0.1).momentum(0.9)).unwrap();
        opt.step().unwrap();
        assert_eq!(w.to_vec(), vec![1.0]);
        assert!(opt.base().state().is_empty());
    }

    #[test]
    fn momentum_accumulates() {
        let w = param(&[1.0]);
        let mut opt = Sgd::new(vec![w.clone()], SgdOptions::new(0.1).momentum(0.9)).unwrap();

        w.set_grad(grad(&[1.0])).unwrap();
        opt.step().unwrap();
        // buf = 1.0
        assert_close(&w.to_vec(), &[0.9]);

        opt.step().unwrap();
        // buf = 0.9 * 1.0 + 1.0 = 1.9
        assert_close(&w.to_vec(), &[0.71]);
        let state = opt.base().state().get(w.id()).unwrap();
        assert_close(&state.momentum_buffer.to_vec(), &[1.9]);
    }

    #[test]
    fn nesterov_and_weight_decay() {
        let w = param(&[2.0]);
        let options = SgdOptions::new(0.1).momentum(0.5).nesterov(true).weight_decay(0.5);
        let mut opt = Sgd::new(vec![w.clone()], options).unwrap();
        w.set_grad(grad(&[1.0])).unwrap();
        opt.step().unwrap();
        // d_p = 1 + 0.5 * 2 = 2, buf = 2, nesterov d_p = 2 + 0.5 * 2 = 3
        assert_close(&w.to_vec(), &[1.7]);
    }

    #[test]
    fn groups_use_their_own_lr() {
        let a = param(&[1.0]);
        let b = param(&[1.0]);
        let groups = vec![
            ParamGroup::new(vec![a.clone()]),
            ParamGroup::with_options(vec![b.clone()], SgdOptions::new(1.0)),
        ];
        let mut opt = Sgd::with_groups(groups, SgdOptions::new(0.1)).unwrap();
        a.set_grad(grad(&[1.0])).unwrap();
        b.set_grad(grad(&[1.0])).unwrap();
        opt.step().unwrap();
        assert_close(&a.to_vec(), &[0.9]);
        assert_close(&b.to_vec(), &[0.0]);
    }

    #[test]
    fn failed_step_moves_no_parameter() {
        let a = param(&[1.0]);
        let b = param(&[1.0, 1.0]);
        let options = SgdOptions::new(0.1).momentum(0.9);
        let mut opt = Sgd::new(vec![a.clone(), b.clone()], options).unwrap();
        let stale = SgdParamState { momentum_buffer: grad(&[1.0]) };
        opt.base_mut().state_mut().insert(b.id(), stale);
        a.set_grad(grad(&[1.0])).unwrap();
        b.set_grad(grad(&[1.0, 1.0])).unwrap();

        assert!(opt.step().is_err());
        assert_eq!(a.to_vec(), vec![1.0]);
        assert_eq!(b.to_vec(), vec![1.0, 1.0]);
        assert!(!opt.base().state().contains(a.id()));
    }

    #[test]
    fn buffer_is_independent_of_gradient() {
        let w = param(&[1.0]);
        let mut opt = Sgd::new(vec![w.clone()], SgdOptions::new(0.1).momentum(0.9)).unwrap();
        w.set_grad(grad(&[1.0])).unwrap();
        opt.step().unwrap();
        opt.zero_grad();
        let state = opt.base().state().get(w.id()).unwrap();
        assert_eq!(state.momentum_buffer.to_vec(), vec![1.0]);
    }
}
