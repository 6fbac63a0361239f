//! # Optimizer Options
//!
//! Hyperparameter records. Every field is wrapped in [`Hyper`], which
//! remembers whether the value was chosen by the caller or came from a
//! default, so a parameter group that overrides only its learning rate still
//! picks up the optimizer's defaults for everything else.

use serde::{Deserialize, Serialize};

use crate::error::{OptimError, Result};

/// A hyperparameter value plus a flag recording whether it was set explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Hyper<T> {
    value: T,
    explicit: bool,
}

impl<T: Copy> Hyper<T> {
    /// A value that was not chosen by the caller.
    pub const fn implicit(value: T) -> Self {
        Hyper { value, explicit: false }
    }

    /// A value chosen by the caller.
    pub const fn explicit(value: T) -> Self {
        Hyper { value, explicit: true }
    }

    pub fn get(&self) -> T {
        self.value
    }

    /// Overwrites the value and marks it explicit.
    pub fn set(&mut self, value: T) {
        self.value = value;
        self.explicit = true;
    }

    pub fn is_explicit(&self) -> bool {
        self.explicit
    }

    /// Takes `fallback`'s value unless this one was set explicitly.
    pub fn inherit(&mut self, fallback: &Hyper<T>) {
        if !self.explicit {
            self.value = fallback.value;
        }
    }
}

/// Behaviour every options record provides to the optimizer base.
pub trait OptimizerOptions: Clone + std::fmt::Debug {
    /// Learning rate of this record.
    fn lr(&self) -> f64;

    /// Fills every field not set explicitly from `defaults`.
    fn inherit(&mut self, defaults: &Self);

    /// Checks every field is in range.
    fn validate(&self) -> Result<()> {
        Ok(())
    }
}

/// Errors unless `value` is finite and non-negative.
pub(crate) fn non_negative(name: &'static str, value: f64) -> Result<()> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(OptimError::InvalidOption { name, value })
    }
}

/// Errors unless `value` lies in `[0, 1)`.
pub(crate) fn unit_interval(name: &'static str, value: f64) -> Result<()> {
    if (0.0..1.0).contains(&value) {
        Ok(())
    } else {
        Err(OptimError::InvalidOption { name, value })
    }
}
