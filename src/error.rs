//! Error types for the optimizer layer.

use crate::tensor::{TensorError, TensorId};
use crate::utils::serialization::SerializationError;

/// Result alias used throughout `optim`.
pub type Result<T> = std::result::Result<T, OptimError>;

#[derive(thiserror::Error, Debug)]
pub enum OptimError {
    /// A handle that cannot be optimized, e.g. one with computation history.
    #[error("Invalid parameter at position {index}: {reason}")]
    InvalidParameter { index: usize, reason: String },

    /// A parameter listed twice within a group or across groups.
    #[error("Parameter {id} appears in more than one parameter group")]
    DuplicateMembership { id: TensorId },

    /// A hyperparameter outside its valid range.
    #[error("Invalid {name} value: {value}")]
    InvalidOption { name: &'static str, value: f64 },

    /// A parameter position, buffer index or group index with nothing behind it.
    #[error("Index {index} out of range for length {len}")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("Tensor error: {0}")]
    Tensor(#[from] TensorError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] SerializationError),
}
