//! # Adam Optimizer

use serde::{Deserialize, Serialize};

use super::options::{non_negative, unit_interval, Hyper, OptimizerOptions};
use super::{OptimizerBase, OptimizerCore, Optimizer, ParamGroup};
use crate::error::Result;
use crate::tensor::{ops, zeros_like, Tensor};
use crate::utils::serialization::{InputArchive, OutputArchive, SerializationError};

/// Hyperparameters of [`Adam`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdamOptions {
    pub lr: Hyper<f64>,
    /// Coefficients for the running averages of the gradient and its square.
    pub betas: Hyper<(f64, f64)>,
    /// Added to the denominator for numerical stability.
    pub eps: Hyper<f64>,
    /// L2 penalty.
    pub weight_decay: Hyper<f64>,
    pub amsgrad: Hyper<bool>,
}

impl Default for AdamOptions {
    fn default() -> Self {
        AdamOptions {
            lr: Hyper::implicit(1e-3),
            betas: Hyper::implicit((0.9, 0.999)),
            eps: Hyper::implicit(1e-8),
            weight_decay: Hyper::implicit(0.0),
            amsgrad: Hyper::implicit(false),
        }
    }
}

impl AdamOptions {
    pub fn new(lr: f64) -> Self {
        AdamOptions {
            lr: Hyper::explicit(lr),
            ..Default::default()
        }
    }

    pub fn betas(mut self, beta1: f64, beta2: f64) -> Self {
        self.betas.set((beta1, beta2));
        self
    }

    pub fn eps(mut self, eps: f64) -> Self {
        self.eps.set(eps);
        self
    }

    pub fn weight_decay(mut self, weight_decay: f64) -> Self {
        self.weight_decay.set(weight_decay);
        self
    }

    pub fn amsgrad(mut self, amsgrad: bool) -> Self {
        self.amsgrad.set(amsgrad);
        self
    }
}

impl OptimizerOptions for AdamOptions {
    fn lr(&self) -> f64 {
        self.lr.get()
    }

    fn inherit(&mut self, defaults: &Self) {
        self.lr.inherit(&defaults.lr);
        self.betas.inherit(&defaults.betas);
        self.eps.inherit(&defaults.eps);
        self.weight_decay.inherit(&defaults.weight_decay);
        self.amsgrad.inherit(&defaults.amsgrad);
    }

    fn validate(&self) -> Result<()> {
        let (beta1, beta2) = self.betas.get();
        non_negative("lr", self.lr.get())?;
        non_negative("eps", self.eps.get())?;
        unit_interval("beta1", beta1)?;
        unit_interval("beta2", beta2)?;
        non_negative("weight_decay", self.weight_decay.get())
    }
}

/// Moment estimates of one parameter.
#[derive(Debug, Clone)]
pub struct AdamParamState {
    /// Number of updates applied to this parameter.
    pub step: u64,
    /// 1st moment estimate (m_t)
    pub exp_avg: Tensor,
    /// 2nd moment estimate (v_t)
    pub exp_avg_sq: Tensor,
    /// Running max of v_t, only kept with AMSGrad
    pub max_exp_avg_sq: Option<Tensor>,
}

impl AdamParamState {
    fn zeros_for(param: &Tensor, amsgrad: bool) -> Self {
        AdamParamState {
            step: 0,
            exp_avg: zeros_like(param),
            exp_avg_sq: zeros_like(param),
            max_exp_avg_sq: amsgrad.then(|| zeros_like(param)),
        }
    }
}

/// Implements the Adam algorithm.
/// Reference: Adam: A Method for Stochastic Optimization - https://arxiv.org/abs/1412.6980
#[derive(Debug)]
pub struct Adam {
    base: OptimizerBase<AdamParamState, AdamOptions>,
}

impl Adam {
    pub fn new<I>(params: I, options: AdamOptions) -> Result<Self>
    where
        I: IntoIterator<Item = Tensor>,
    {
        Ok(Adam {
            base: OptimizerBase::new(params, options)?,
        })
    }

    pub fn with_groups(
        groups: Vec<ParamGroup<AdamOptions>>,
        defaults: AdamOptions,
    ) -> Result<Self> {
        Ok(Adam {
            base: OptimizerBase::from_groups(groups, defaults)?,
        })
    }

    pub fn base(&self) -> &OptimizerBase<AdamParamState, AdamOptions> {
        &self.base
    }

    pub fn base_mut(&mut self) -> &mut OptimizerBase<AdamParamState, AdamOptions> {
        &mut self.base
    }
}

impl OptimizerCore for Adam {
    fn zero_grad(&mut self) {
        self.base.zero_grad();
    }

    fn size(&self) -> usize {
        self.base.size()
    }

    fn save(&self, archive: &mut OutputArchive) -> Result<()> {
        self.base.save_state(archive, "adam", |archive, index, state| {
            archive.write_value(&format!("adam.step.{}", index), &state.step)?;
            archive.write_tensor(&format!("adam.exp_avg.{}", index), &state.exp_avg);
            archive.write_tensor(&format!("adam.exp_avg_sq.{}", index), &state.exp_avg_sq);
            if let Some(max) = &state.max_exp_avg_sq {
                archive.write_tensor(&format!("adam.max_exp_avg_sq.{}", index), max);
            }
            Ok(())
        })
    }

    fn load(&mut self, archive: &InputArchive) -> Result<()> {
        self.base.load_state(archive, "adam", |archive, index, param| {
            let avg_key = format!("adam.exp_avg.{}", index);
            let exp_avg = match archive.read_tensor_for(&avg_key, param)? {
                Some(t) => t,
                None => return Ok(None),
            };
            let step_key = format!("adam.step.{}", index);
            let sq_key = format!("adam.exp_avg_sq.{}", index);
            let exp_avg_sq = archive
                .read_tensor_for(&sq_key, param)?
                .ok_or(SerializationError::MissingKey(sq_key))?;
            let max_key = format!("adam.max_exp_avg_sq.{}", index);
            let max_exp_avg_sq = archive.read_tensor_for(&max_key, param)?;
            Ok(Some(AdamParamState {
                step: archive.read_value(&step_key)?,
                exp_avg,
                exp_avg_sq,
                max_exp_avg_sq,
            }))
        })
    }
}

/// One parameter's update, computed before anything is written.
struct PendingUpdate {
    param: Tensor,
    step: u64,
    exp_avg: Tensor,
    exp_avg_sq: Tensor,
    max_exp_avg_sq: Option<Tensor>,
    update: Tensor,
}

impl Optimizer for Adam {
    fn step(&mut self) -> Result<()> {
        let (groups, defaults, state) = self.base.groups_and_state_mut();
        let mut pending = Vec::new();
        for group in groups.iter() {
            let options = group.options_or(defaults);
            let lr = options.lr.get();
            let (beta1, beta2) = options.betas.get();
            let eps = options.eps.get();
            let weight_decay = options.weight_decay.get();
            let amsgrad = options.amsgrad.get();

            for param in group.params() {
                let grad = match param.grad() {
                    Some(g) => g.detach(),
                    None => continue,
                };

                // grad = grad + weight_decay * param
                let grad = if weight_decay != 0.0 {
                    ops::add(&grad, &ops::mul_scalar(&param.detach(), weight_decay)?)?
                } else {
                    grad
                };

                let previous = match state.get(param.id()) {
                    Some(entry) => entry.clone(),
                    None => AdamParamState::zeros_for(param, amsgrad),
                };
                let step = previous.step + 1;

                // m_t = beta1 * m_{t-1} + (1 - beta1) * g_t
                let m_t = ops::add(
                    &ops::mul_scalar(&previous.exp_avg, beta1)?,
                    &ops::mul_scalar(&grad, 1.0 - beta1)?,
                )?;
                // v_t = beta2 * v_{t-1} + (1 - beta2) * g_t^2
                let v_t = ops::add(
                    &ops::mul_scalar(&previous.exp_avg_sq, beta2)?,
                    &ops::mul_scalar(&ops::mul(&grad, &grad)?, 1.0 - beta2)?,
                )?;

                let bias_correction1 = 1.0 - beta1.powi(step as i32);
                let bias_correction2 = 1.0 - beta2.powi(step as i32);

                let max_t = if amsgrad {
                    let max_prev = match &previous.max_exp_avg_sq {
                        Some(max) => max.clone(),
                        None => zeros_like(param),
                    };
                    Some(ops::maximum(&max_prev, &v_t)?)
                } else {
                    None
                };
                let second_moment = max_t.as_ref().unwrap_or(&v_t);

                // denom = sqrt(v) / sqrt(bias_correction2) + eps
                let denom = ops::add_scalar(
                    &ops::mul_scalar(&ops::sqrt(second_moment)?, 1.0 / bias_correction2.sqrt())?,
                    eps,
                )?;
                let step_size = lr / bias_correction1;
                let update = ops::mul_scalar(&ops::div(&m_t, &denom)?, step_size)?;
                ops::check_compatible("sub_", param, &update)?;

                pending.push(PendingUpdate {
                    param: param.clone(),
                    step,
                    exp_avg: m_t,
                    exp_avg_sq: v_t,
                    max_exp_avg_sq: max_t,
                    update,
                });
            }
        }

        for p in pending {
            match state.get_mut(p.param.id()) {
                Some(entry) => {
                    entry.step = p.step;
                    entry.exp_avg = p.exp_avg;
                    entry.exp_avg_sq = p.exp_avg_sq;
                    if p.max_exp_avg_sq.is_some() {
                        entry.max_exp_avg_sq = p.max_exp_avg_sq;
                    }
                }
                None => {
                    let entry = AdamParamState {
                        step: p.step,
                        exp_avg: p.exp_avg,
                        exp_avg_sq: p.exp_avg_sq,
                        max_exp_avg_sq: p.max_exp_avg_sq,
                    };
                    state.insert(p.param.id(), entry);
                }
            }
            ops::sub_(&p.param, &p.update)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::OptimError;
    use crate::tensor::{DType, TensorError};

    fn param(values: &[f64]) -> Tensor {
        Tensor::from_vec(&[values.len()], values.to_vec(), DType::F64, true).unwrap()
    }

    fn grad(values: &[f64]) -> Tensor {
        Tensor::from_vec(&[values.len()], values.to_vec(), DType::F64, false).unwrap()
    }

    #[test]
    fn default_options() {
        let options = AdamOptions::default();
        assert_eq!(options.lr(), 1e-3);
        assert_eq!(options.betas.get(), (0.9, 0.999));
        assert_eq!(options.eps.get(), 1e-8);
        assert!(!options.amsgrad.get());
    }

    #[test]
    fn rejects_bad_betas() {
        let options = AdamOptions::new(0.1).betas(1.0, 0.999);
        let err = Adam::new(vec![param(&[1.0])], options).unwrap_err();
        assert!(matches!(err, OptimError::InvalidOption { name: "beta1", .. }));
    }

    #[test]
    fn first_step_moves_by_lr() {
        // After bias correction the first update is lr * g / (|g| + eps).
        let w = param(&[1.0, -1.0]);
        let mut opt = Adam::new(vec![w.clone()], AdamOptions::new(0.1)).unwrap();
        w.set_grad(grad(&[0.5, -2.0])).unwrap();
        opt.step().unwrap();

        let values = w.to_vec();
        assert!((values[0] - 0.9).abs() < 1e-6);
        assert!((values[1] + 0.9).abs() < 1e-6);

        let state = opt.base().state().get(w.id()).unwrap();
        assert_eq!(state.step, 1);
        assert!(state.max_exp_avg_sq.is_none());
        let m = state.exp_avg.to_vec();
        assert!((m[0] - 0.05).abs() < 1e-12);
    }

    #[test]
    fn amsgrad_tracks_max() {
        let w = param(&[0.0]);
        let mut opt = Adam::new(vec![w.clone()], AdamOptions::new(0.1).amsgrad(true)).unwrap();
        w.set_grad(grad(&[2.0])).unwrap();
        opt.step().unwrap();
        w.set_grad(grad(&[0.0])).unwrap();
        opt.step().unwrap();

        let state = opt.base().state().get(w.id()).unwrap();
        let max = state.max_exp_avg_sq.as_ref().unwrap().to_vec()[0];
        let v = state.exp_avg_sq.to_vec()[0];
        assert!((max - 0.004).abs() < 1e-12);
        assert!(v < max);
    }

    #[test]
    fn failed_step_changes_nothing() {
        let ok = param(&[1.0]);
        let w = param(&[1.0, 2.0]);
        let mut opt = Adam::new(vec![ok.clone(), w.clone()], AdamOptions::new(0.1)).unwrap();
        let stale = AdamParamState {
            step: 3,
            exp_avg: grad(&[0.0]),
            exp_avg_sq: grad(&[0.0]),
            max_exp_avg_sq: None,
        };
        opt.base_mut().state_mut().insert(w.id(), stale);
        ok.set_grad(grad(&[1.0])).unwrap();
        w.set_grad(grad(&[1.0, 1.0])).unwrap();

        let err = opt.step().unwrap_err();
        assert!(matches!(err, OptimError::Tensor(TensorError::ShapeMismatch { .. })));
        assert_eq!(ok.to_vec(), vec![1.0]);
        assert_eq!(w.to_vec(), vec![1.0, 2.0]);
        assert!(opt.base().state().get(ok.id()).is_none());
        assert_eq!(opt.base().state().get(w.id()).unwrap().step, 3);
    }

    #[test]
    fn converges_on_quadratic() {
        let w = param(&[5.0]);
        let mut opt = Adam::new(vec![w.clone()], AdamOptions::new(0.5)).unwrap();
        for _ in 0..200 {
            opt.zero_grad();
            let x = w.to_vec()[0];
            w.set_grad(grad(&[2.0 * x])).unwrap();
            opt.step().unwrap();
        }
        assert!(w.to_vec()[0].abs() < 0.1);
    }
}
