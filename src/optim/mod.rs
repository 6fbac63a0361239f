//! # Optimization Algorithms (`optim`)
//!
//! The generic optimizer layer ([`OptimizerBase`]: groups, options, state,
//! buffers) and the algorithms built on top of it.
//!
//! Optimizers come in two calling conventions. [`Optimizer::step`] takes no
//! arguments and expects gradients to be populated already.
//! [`ClosureOptimizer::step`] takes a loss closure it may call several times
//! per update, which line-search style algorithms need. A training loop that
//! must accept either holds a [`Stepper`].

use crate::error::Result;
use crate::tensor::Tensor;
use crate::utils::serialization::{InputArchive, OutputArchive};

// --- Submodules ---
pub mod adagrad;
pub mod adam;
pub mod base;
pub mod line_search;
pub mod options;
pub mod param_group;
pub mod sgd;
pub mod state;

// Re-export optimizers
pub use adagrad::{Adagrad, AdagradOptions};
pub use adam::{Adam, AdamOptions, AdamParamState};
pub use base::OptimizerBase;
pub use line_search::{LineSearchOptions, LineSearchSgd};
pub use options::{Hyper, OptimizerOptions};
pub use param_group::ParamGroup;
pub use sgd::{Sgd, SgdOptions, SgdParamState};
pub use state::OptimizerState;

// --- Optimizer Traits ---

/// Behaviour shared by every optimizer regardless of how it steps.
pub trait OptimizerCore {
    /// Zeros the gradients of all parameters managed by the optimizer.
    /// Call it before computing gradients for a new batch.
    fn zero_grad(&mut self);

    /// Number of parameters managed by the optimizer.
    fn size(&self) -> usize;

    /// Writes the optimizer's state into `archive`. Writes nothing by default.
    fn save(&self, archive: &mut OutputArchive) -> Result<()> {
        let _ = archive;
        Ok(())
    }

    /// Restores state written by [`save`](Self::save). Reads nothing by default.
    fn load(&mut self, archive: &InputArchive) -> Result<()> {
        let _ = archive;
        Ok(())
    }
}

/// Optimizer whose `step` takes no arguments.
pub trait Optimizer: OptimizerCore {
    /// Performs a single optimization step (parameter update).
    ///
    /// Updates every parameter with a gradient in place; parameters without
    /// a gradient are skipped.
    fn step(&mut self) -> Result<()>;
}

/// Re-evaluates the loss, repopulating gradients, and returns it.
pub type LossClosure<'a> = &'a mut dyn FnMut() -> Result<Tensor>;

/// Optimizer that needs to evaluate the loss itself, possibly several times
/// per step (conjugate gradient, quasi-Newton and line-search methods).
pub trait ClosureOptimizer: OptimizerCore {
    /// Performs a single optimization step and returns the last loss the
    /// closure produced.
    fn step(&mut self, closure: LossClosure<'_>) -> Result<Tensor>;
}

/// Either kind of optimizer, chosen when it is built.
pub enum Stepper {
    Plain(Box<dyn Optimizer>),
    Closure(Box<dyn ClosureOptimizer>),
}

impl Stepper {
    /// Runs one update.
    ///
    /// A plain optimizer gets one closure call to populate gradients and then
    /// steps; a closure optimizer receives the closure itself.
    pub fn step(&mut self, closure: LossClosure<'_>) -> Result<Tensor> {
        match self {
            Stepper::Plain(optimizer) => {
                let loss = closure()?;
                optimizer.step()?;
                Ok(loss)
            }
            Stepper::Closure(optimizer) => optimizer.step(closure),
        }
    }

    pub fn zero_grad(&mut self) {
        match self {
            Stepper::Plain(optimizer) => optimizer.zero_grad(),
            Stepper::Closure(optimizer) => optimizer.zero_grad(),
        }
    }

    pub fn size(&self) -> usize {
        match self {
            Stepper::Plain(optimizer) => optimizer.size(),
            Stepper::Closure(optimizer) => optimizer.size(),
        }
    }

    pub fn save(&self, archive: &mut OutputArchive) -> Result<()> {
        match self {
            Stepper::Plain(optimizer) => optimizer.save(archive),
            Stepper::Closure(optimizer) => optimizer.save(archive),
        }
    }

    pub fn load(&mut self, archive: &InputArchive) -> Result<()> {
        match self {
            Stepper::Plain(optimizer) => optimizer.load(archive),
            Stepper::Closure(optimizer) => optimizer.load(archive),
        }
    }
}

impl From<Box<dyn Optimizer>> for Stepper {
    fn from(optimizer: Box<dyn Optimizer>) -> Self {
        Stepper::Plain(optimizer)
    }
}

impl From<Box<dyn ClosureOptimizer>> for Stepper {
    fn from(optimizer: Box<dyn ClosureOptimizer>) -> Self {
        Stepper::Closure(optimizer)
    }
}
