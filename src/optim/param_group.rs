//! # Parameter Groups
//!
//! A group bundles parameters that share one set of hyperparameters, so a
//! model can, say, train its embedding table with a smaller learning rate than
//! its head.

use crate::tensor::Tensor;

/// An ordered set of parameters with an optional options override.
///
/// Before registration `options` may be `None`; once an optimizer accepts the
/// group it always carries the resolved options. A registered group is only
/// changed through its optimizer, which validates every change.
#[derive(Debug, Clone)]
pub struct ParamGroup<O> {
    pub(crate) params: Vec<Tensor>,
    pub(crate) options: Option<O>,
}

impl<O> ParamGroup<O> {
    /// A group that will take the optimizer's defaults.
    pub fn new<I>(params: I) -> Self
    where
        I: IntoIterator<Item = Tensor>,
    {
        ParamGroup {
            params: params.into_iter().collect(),
            options: None,
        }
    }

    /// A group with its own options. Fields left implicit still fall back to
    /// the optimizer's defaults at registration.
    pub fn with_options<I>(params: I, options: O) -> Self
    where
        I: IntoIterator<Item = Tensor>,
    {
        ParamGroup {
            params: params.into_iter().collect(),
            options: Some(options),
        }
    }

    pub fn params(&self) -> &[Tensor] {
        &self.params
    }

    pub fn has_options(&self) -> bool {
        self.options.is_some()
    }

    pub fn options(&self) -> Option<&O> {
        self.options.as_ref()
    }

    /// The group's options, or `defaults` for a group that was never registered.
    pub fn options_or<'a>(&'a self, defaults: &'a O) -> &'a O {
        self.options.as_ref().unwrap_or(defaults)
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }
}
