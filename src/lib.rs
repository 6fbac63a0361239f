//! # RTorch Optimizer Library
//!
//! The generic base layer for gradient-based optimizers: parameter groups
//! with per-group options, identity-keyed per-parameter state, lazily
//! materialized per-position buffers, and the gradient-reset protocol.
//!
//! The crate also carries a small host-memory tensor type the optimizers
//! operate on, a keyed archive for saving optimizer state, and a handful of
//! concrete algorithms (SGD, Adam, Adagrad, line-search SGD).

pub mod error;
pub mod optim;
pub mod tensor;
pub mod utils;

pub use error::{OptimError, Result};
pub use optim::{ClosureOptimizer, Optimizer, OptimizerBase, OptimizerCore, ParamGroup, Stepper};
pub use tensor::{DType, Device, Tensor, TensorId};
pub use utils::{InputArchive, OutputArchive};
