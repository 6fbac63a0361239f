//! # Optimizer Base
//!
//! Bookkeeping shared by every optimizer: parameter groups, default options,
//! identity-keyed per-parameter state and the legacy per-index buffers. No
//! update arithmetic lives here.
//!
//! Groups are the single source of truth for membership. The flat parameter
//! list older code expects (`parameters`, `size`, `add_parameters`, buffer
//! indices) is a view over all groups in registration order.

use std::collections::HashSet;

use log::{debug, trace};

use super::options::OptimizerOptions;
use super::param_group::ParamGroup;
use super::state::OptimizerState;
use super::OptimizerCore;
use crate::error::{OptimError, Result};
use crate::tensor::{zeros_like, Tensor, TensorId};
use crate::utils::serialization::{InputArchive, OutputArchive, SerializationError};

/// Parameters, options and state of one optimizer.
///
/// `S` is the per-parameter record of the concrete algorithm, `O` its options.
#[derive(Debug, Clone)]
pub struct OptimizerBase<S, O> {
    defaults: O,
    param_groups: Vec<ParamGroup<O>>,
    state: OptimizerState<S>,
}

impl<S, O: OptimizerOptions> OptimizerBase<S, O> {
    /// Wraps `parameters` in a single group that uses `defaults`.
    ///
    /// Fails with [`OptimError::InvalidParameter`] if any handle is not a leaf.
    pub fn new<I>(parameters: I, defaults: O) -> Result<Self>
    where
        I: IntoIterator<Item = Tensor>,
    {
        Self::from_groups(vec![ParamGroup::new(parameters)], defaults)
    }

    /// Registers each group in order, with `defaults` as the fallback options.
    pub fn from_groups(groups: Vec<ParamGroup<O>>, defaults: O) -> Result<Self> {
        defaults.validate()?;
        let mut base = OptimizerBase {
            defaults,
            param_groups: Vec::with_capacity(groups.len()),
            state: OptimizerState::new(),
        };
        for group in groups {
            base.add_param_group(group)?;
        }
        Ok(base)
    }

    /// Validates and appends a parameter group.
    ///
    /// A group without options receives a copy of the current defaults; a
    /// group with options inherits the defaults for every field it did not set
    /// explicitly. Either way the options are resolved now and never again.
    /// On error the optimizer is left untouched.
    pub fn add_param_group(&mut self, mut group: ParamGroup<O>) -> Result<()> {
        self.check_new_params(&group.params)?;

        let options = match group.options.take() {
            Some(mut own) => {
                own.inherit(&self.defaults);
                own
            }
            None => self.defaults.clone(),
        };
        options.validate()?;
        group.options = Some(options);

        debug!(
            "registered parameter group {} with {} parameters (lr = {})",
            self.param_groups.len(),
            group.params.len(),
            group.options_or(&self.defaults).lr()
        );
        self.param_groups.push(group);
        Ok(())
    }

    /// Appends parameters to the first group, registering a default group if
    /// none exists yet.
    pub fn add_parameters<I>(&mut self, parameters: I) -> Result<()>
    where
        I: IntoIterator<Item = Tensor>,
    {
        let parameters: Vec<Tensor> = parameters.into_iter().collect();
        if self.param_groups.is_empty() {
            return self.add_param_group(ParamGroup::new(parameters));
        }
        self.check_new_params(&parameters)?;
        debug!("appending {} parameters to group 0", parameters.len());
        self.param_groups[0].params.extend(parameters);
        Ok(())
    }

    /// Rejects non-leaf handles and handles already known to the optimizer or
    /// repeated within `params`.
    fn check_new_params(&self, params: &[Tensor]) -> Result<()> {
        for (index, param) in params.iter().enumerate() {
            check_leaf(index, param)?;
        }
        let mut seen: HashSet<TensorId> = self.parameters().map(Tensor::id).collect();
        for param in params {
            if !seen.insert(param.id()) {
                return Err(OptimError::DuplicateMembership { id: param.id() });
            }
        }
        Ok(())
    }

    /// Zeroes the gradient of every parameter that has one.
    ///
    /// Each gradient is detached from its history and overwritten in place.
    /// Parameters without a gradient are left without one. Every parameter is
    /// visited at most once.
    pub fn zero_grad(&mut self) {
        let mut visited = HashSet::new();
        for param in self.parameters() {
            if visited.insert(param.id()) {
                param.zero_grad();
            }
        }
    }

    /// All parameters, group by group, in registration order.
    pub fn parameters(&self) -> impl Iterator<Item = &Tensor> + '_ {
        self.param_groups.iter().flat_map(|group| group.params.iter())
    }

    /// The parameter at flat position `index`.
    pub fn parameter(&self, index: usize) -> Option<&Tensor> {
        self.parameters().nth(index)
    }

    /// Swaps the parameter at flat position `index` for `parameter`.
    ///
    /// The new handle must be a leaf and must not be registered at any other
    /// position. State recorded for the old handle is left in place.
    pub fn replace_parameter(&mut self, index: usize, parameter: Tensor) -> Result<()> {
        let len = self.size();
        let (group, offset) = self
            .locate(index)
            .ok_or(OptimError::IndexOutOfRange { index, len })?;
        check_leaf(index, &parameter)?;
        let taken = self
            .parameters()
            .enumerate()
            .any(|(i, p)| i != index && p.id() == parameter.id());
        if taken {
            return Err(OptimError::DuplicateMembership { id: parameter.id() });
        }

        debug!("replacing parameter {} with {}", index, parameter.id());
        self.param_groups[group].params[offset] = parameter;
        Ok(())
    }

    /// Maps a flat position to `(group, offset within group)`.
    fn locate(&self, index: usize) -> Option<(usize, usize)> {
        let mut remaining = index;
        for (group_index, group) in self.param_groups.iter().enumerate() {
            if remaining < group.params.len() {
                return Some((group_index, remaining));
            }
            remaining -= group.params.len();
        }
        None
    }

    /// Number of parameters across all groups.
    pub fn size(&self) -> usize {
        self.param_groups.iter().map(ParamGroup::len).sum()
    }

    pub fn defaults(&self) -> &O {
        &self.defaults
    }

    /// Replaces the defaults used by groups registered from now on.
    /// Groups already registered keep the options they resolved at the time.
    pub fn set_defaults(&mut self, defaults: O) -> Result<()> {
        defaults.validate()?;
        debug!("replacing optimizer defaults: {:?}", defaults);
        self.defaults = defaults;
        Ok(())
    }

    pub fn param_groups(&self) -> &[ParamGroup<O>] {
        &self.param_groups
    }

    /// Replaces the options of registered group `group`.
    ///
    /// Fields `options` leaves implicit are filled from the current defaults
    /// and the result is validated before anything changes.
    pub fn set_group_options(&mut self, group: usize, mut options: O) -> Result<()> {
        let len = self.param_groups.len();
        if group >= len {
            return Err(OptimError::IndexOutOfRange { index: group, len });
        }
        options.inherit(&self.defaults);
        options.validate()?;
        debug!("replacing options of parameter group {} (lr = {})", group, options.lr());
        self.param_groups[group].options = Some(options);
        Ok(())
    }

    pub fn state(&self) -> &OptimizerState<S> {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut OptimizerState<S> {
        &mut self.state
    }

    /// Splits the borrow for `step` implementations: groups and defaults to
    /// read, state to update.
    pub fn groups_and_state_mut(&mut self) -> (&[ParamGroup<O>], &O, &mut OptimizerState<S>) {
        (&self.param_groups, &self.defaults, &mut self.state)
    }

    /// Returns `buffers[index]`, growing the vector with `T::default()` (zero
    /// for numeric types) when `index` is past the end.
    pub fn buffer_at<'b, T: Default>(&self, buffers: &'b mut Vec<T>, index: usize) -> &'b mut T {
        if buffers.len() <= index {
            trace!("growing buffers from {} to {}", buffers.len(), index + 1);
            buffers.resize_with(index + 1, T::default);
        }
        &mut buffers[index]
    }

    /// Returns the tensor buffer for the parameter at flat position `index`.
    ///
    /// Missing slots up to `index` are filled with zeros shaped and placed like
    /// their parameters. The returned buffer is then moved to the device and
    /// dtype of its parameter if it has drifted; the converted copy is stored
    /// back, so later calls return it unchanged.
    pub fn tensor_buffer_at<'b>(
        &self,
        buffers: &'b mut Vec<Tensor>,
        index: usize,
    ) -> Result<&'b mut Tensor> {
        let len = self.size();
        let out_of_range = OptimError::IndexOutOfRange { index, len };
        let parameter = self.parameter(index).ok_or(out_of_range)?;

        if buffers.len() <= index {
            let start = buffers.len();
            trace!("growing tensor buffers from {} to {}", start, index + 1);
            buffers.extend(self.parameters().skip(start).take(index + 1 - start).map(zeros_like));
        }

        let buffer = &mut buffers[index];
        if buffer.device() != parameter.device() || buffer.dtype() != parameter.dtype() {
            trace!(
                "moving buffer {} from {}/{} to {}/{}",
                index,
                buffer.device(),
                buffer.dtype(),
                parameter.device(),
                parameter.dtype()
            );
            *buffer = buffer.to(parameter.device(), parameter.dtype());
        }
        Ok(buffer)
    }

    /// Writes `{prefix}.param_count`, then calls `write` with the flat position
    /// of every parameter that has state.
    ///
    /// Positions are only meaningful against the same parameter layout, which
    /// [`load_state`](Self::load_state) checks through the stored count.
    pub fn save_state<F>(
        &self,
        archive: &mut OutputArchive,
        prefix: &str,
        mut write: F,
    ) -> Result<()>
    where
        F: FnMut(&mut OutputArchive, usize, &S) -> Result<()>,
    {
        archive.write_value(&format!("{}.param_count", prefix), &self.size())?;
        let mut written = 0;
        for (index, param) in self.parameters().enumerate() {
            if let Some(state) = self.state.get(param.id()) {
                write(archive, index, state)?;
                written += 1;
            }
        }
        debug!("saved {} state entries under '{}'", written, prefix);
        Ok(())
    }

    /// Rebuilds the state map from an archive written by
    /// [`save_state`](Self::save_state).
    ///
    /// `read` gets each flat position with its current parameter and returns
    /// the restored record, or `None` if nothing was saved for it. Records are
    /// re-keyed to the current parameters' identities. The existing state is
    /// replaced only once every record has been read.
    pub fn load_state<F>(&mut self, archive: &InputArchive, prefix: &str, mut read: F) -> Result<()>
    where
        F: FnMut(&InputArchive, usize, &Tensor) -> Result<Option<S>>,
    {
        let key = format!("{}.param_count", prefix);
        let saved: usize = archive.read_value(&key)?;
        if saved != self.size() {
            return Err(SerializationError::ParameterCountMismatch {
                key,
                expected: self.size(),
                got: saved,
            }
            .into());
        }

        let mut restored = Vec::new();
        for (index, param) in self.parameters().enumerate() {
            match read(archive, index, param)? {
                Some(state) => restored.push((param.id(), state)),
                None => trace!("no saved state for parameter {} under '{}'", index, prefix),
            }
        }

        debug!("loaded {} state entries under '{}'", restored.len(), prefix);
        self.state.clear();
        for (id, state) in restored {
            self.state.insert(id, state);
        }
        Ok(())
    }
}

fn check_leaf(index: usize, param: &Tensor) -> Result<()> {
    match param.grad_fn() {
        Some(grad_fn) => Err(OptimError::InvalidParameter {
            index,
            reason: format!("can't optimize a non-leaf tensor (produced by {})", grad_fn.op()),
        }),
        None => Ok(()),
    }
}

/// The base contributes nothing to archives; `save` and `load` keep their
/// default no-op bodies.
impl<S, O: OptimizerOptions> OptimizerCore for OptimizerBase<S, O> {
    fn zero_grad(&mut self) {
        OptimizerBase::zero_grad(self);
    }

    fn size(&self) -> usize {
        OptimizerBase::size(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optim::sgd::SgdOptions;
    use crate::tensor::{ops, DType, Device};

    type Base = OptimizerBase<(), SgdOptions>;

    fn init_logging() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn leaf(shape: &[usize]) -> Tensor {
        crate::tensor::ones(shape, true)
    }

    fn non_leaf() -> Tensor {
        ops::mul_scalar(&leaf(&[2]), 2.0).unwrap()
    }

    #[test]
    fn construct_from_flat_list() {
        init_logging();
        let params = vec![leaf(&[2]), leaf(&[3]), leaf(&[4])];
        let base = Base::new(params.clone(), SgdOptions::default()).unwrap();
        assert_eq!(base.size(), 3);
        assert_eq!(base.param_groups().len(), 1);
        let ids: Vec<_> = base.parameters().map(Tensor::id).collect();
        let expected: Vec<_> = params.iter().map(Tensor::id).collect();
        assert_eq!(ids, expected);
    }

    #[test]
    fn construct_rejects_non_leaf() {
        let err = Base::new(vec![leaf(&[2]), non_leaf()], SgdOptions::default()).unwrap_err();
        assert!(matches!(err, OptimError::InvalidParameter { index: 1, .. }));
    }

    #[test]
    fn failed_group_leaves_groups_unchanged() {
        let mut base = Base::new(vec![leaf(&[2])], SgdOptions::default()).unwrap();
        let err = base
            .add_param_group(ParamGroup::new(vec![leaf(&[1]), non_leaf(), leaf(&[1])]))
            .unwrap_err();
        assert!(matches!(err, OptimError::InvalidParameter { .. }));
        assert_eq!(base.param_groups().len(), 1);
        assert_eq!(base.size(), 1);
    }

    #[test]
    fn duplicate_membership_is_rejected() {
        let shared = leaf(&[2]);
        let mut base = Base::new(vec![shared.clone()], SgdOptions::default()).unwrap();

        let err = base
            .add_param_group(ParamGroup::new(vec![leaf(&[2]), shared.clone()]))
            .unwrap_err();
        assert!(matches!(err, OptimError::DuplicateMembership { id } if id == shared.id()));

        let fresh = leaf(&[2]);
        let err = base
            .add_param_group(ParamGroup::new(vec![fresh.clone(), fresh.clone()]))
            .unwrap_err();
        assert!(matches!(err, OptimError::DuplicateMembership { .. }));
        assert_eq!(base.param_groups().len(), 1);
    }

    #[test]
    fn group_without_options_snapshots_defaults() {
        let defaults = SgdOptions::new(0.1).momentum(0.5);
        let mut base = Base::new(vec![leaf(&[2])], defaults.clone()).unwrap();
        base.add_param_group(ParamGroup::new(vec![leaf(&[2])])).unwrap();
        assert_eq!(base.param_groups()[1].options(), Some(&defaults));

        base.set_defaults(SgdOptions::new(0.9)).unwrap();
        assert_eq!(base.param_groups()[1].options(), Some(&defaults));
        assert_eq!(base.defaults().lr(), 0.9);
    }

    #[test]
    fn explicit_group_options_inherit_unset_fields() {
        let defaults = SgdOptions::new(0.1).momentum(0.9).weight_decay(1e-4);
        let mut base = Base::new(Vec::new(), defaults).unwrap();
        base.add_param_group(ParamGroup::with_options(vec![leaf(&[2])], SgdOptions::new(0.5)))
            .unwrap();

        let opts = base.param_groups()[1].options().unwrap();
        assert_eq!(opts.lr(), 0.5);
        assert_eq!(opts.momentum.get(), 0.9);
        assert_eq!(opts.weight_decay.get(), 1e-4);
    }

    #[test]
    fn invalid_group_options_are_rejected() {
        let mut base = Base::new(Vec::new(), SgdOptions::default()).unwrap();
        let err = base
            .add_param_group(ParamGroup::with_options(vec![leaf(&[1])], SgdOptions::new(-1.0)))
            .unwrap_err();
        assert!(matches!(err, OptimError::InvalidOption { name: "lr", .. }));
        assert_eq!(base.param_groups().len(), 1);
    }

    #[test]
    fn add_parameters_extends_first_group() {
        let mut base = Base::new(vec![leaf(&[1])], SgdOptions::default()).unwrap();
        base.add_param_group(ParamGroup::new(vec![leaf(&[1])])).unwrap();
        base.add_parameters(vec![leaf(&[3]), leaf(&[4])]).unwrap();
        assert_eq!(base.param_groups()[0].len(), 3);
        assert_eq!(base.size(), 4);
        assert_eq!(base.parameter(1).unwrap().shape(), &[3]);
    }

    #[test]
    fn add_parameters_on_empty_registers_group() {
        let mut base = Base::from_groups(Vec::new(), SgdOptions::default()).unwrap();
        base.add_parameters(vec![leaf(&[1])]).unwrap();
        assert_eq!(base.param_groups().len(), 1);
        assert!(base.param_groups()[0].has_options());
        assert!(base.add_parameters(vec![non_leaf()]).is_err());
        assert_eq!(base.size(), 1);
    }

    #[test]
    fn zero_grad_scenario() {
        init_logging();
        let params = vec![leaf(&[2]), leaf(&[2]), leaf(&[2])];
        let mut base = Base::new(params.clone(), SgdOptions::default()).unwrap();
        assert_eq!(base.size(), 3);

        let fourth = leaf(&[2]);
        base.add_param_group(ParamGroup::new(vec![fourth.clone()])).unwrap();
        assert_eq!(base.param_groups()[1].options(), Some(base.defaults()));

        params[0].set_grad(crate::tensor::ones(&[2], false)).unwrap();
        fourth.set_grad(crate::tensor::ones(&[2], false)).unwrap();

        base.zero_grad();
        assert_eq!(params[0].grad().unwrap().to_vec(), vec![0.0, 0.0]);
        assert_eq!(fourth.grad().unwrap().to_vec(), vec![0.0, 0.0]);
        assert!(params[1].grad().is_none());
        assert!(params[2].grad().is_none());

        base.zero_grad();
        assert_eq!(params[0].grad().unwrap().to_vec(), vec![0.0, 0.0]);
        assert!(params[1].grad().is_none());
    }

    #[test]
    fn state_survives_growth() {
        let p = leaf(&[1]);
        let mut base: OptimizerBase<u32, SgdOptions> =
            OptimizerBase::new(vec![p.clone()], SgdOptions::default()).unwrap();
        base.state_mut().insert(p.id(), 7);
        base.add_parameters(vec![leaf(&[1])]).unwrap();
        base.add_param_group(ParamGroup::new(vec![leaf(&[1])])).unwrap();
        assert_eq!(base.state().get(p.id()), Some(&7));
        assert_eq!(base.state().len(), 1);
    }

    #[test]
    fn generic_buffer_grows_with_zeros() {
        let base = Base::new(Vec::new(), SgdOptions::default()).unwrap();
        let mut buffers: Vec<f64> = vec![1.5];
        *base.buffer_at(&mut buffers, 3) += 2.0;
        assert_eq!(buffers, vec![1.5, 0.0, 0.0, 2.0]);
        assert_eq!(*base.buffer_at(&mut buffers, 0), 1.5);
        assert_eq!(buffers.len(), 4);
    }

    #[test]
    fn tensor_buffer_grows_to_match_parameters() {
        let params: Vec<Tensor> = (1..=6).map(|n| leaf(&[n])).collect();
        let base = Base::new(params.clone(), SgdOptions::default()).unwrap();
        let mut buffers = Vec::new();

        base.tensor_buffer_at(&mut buffers, 5).unwrap();
        assert_eq!(buffers.len(), 6);
        for (buffer, param) in buffers.iter().zip(&params) {
            assert_eq!(buffer.shape(), param.shape());
            assert_eq!(buffer.device(), param.device());
            assert_eq!(buffer.dtype(), param.dtype());
            assert!(buffer.to_vec().iter().all(|&v| v == 0.0));
        }
    }

    #[test]
    fn tensor_buffer_follows_parameter_placement() {
        let param = crate::tensor::ones(&[3], true).to(Device::Gpu(1), DType::F64);
        let base = Base::new(vec![param.clone()], SgdOptions::default()).unwrap();
        let mut buffers = vec![crate::tensor::full_like(&crate::tensor::ones(&[3], false), 2.0)];

        let first_id = {
            let buffer = base.tensor_buffer_at(&mut buffers, 0).unwrap();
            assert_eq!(buffer.device(), Device::Gpu(1));
            assert_eq!(buffer.dtype(), DType::F64);
            assert_eq!(buffer.to_vec(), vec![2.0, 2.0, 2.0]);
            buffer.id()
        };
        let second_id = base.tensor_buffer_at(&mut buffers, 0).unwrap().id();
        assert_eq!(first_id, second_id);
    }

    #[test]
    fn tensor_buffer_index_must_have_parameter() {
        let base = Base::new(vec![leaf(&[1])], SgdOptions::default()).unwrap();
        let mut buffers = Vec::new();
        let err = base.tensor_buffer_at(&mut buffers, 1).unwrap_err();
        assert!(matches!(err, OptimError::IndexOutOfRange { index: 1, len: 1 }));
        assert!(buffers.is_empty());
    }
}
