//! # Autograd History
//!
//! Records which op produced a tensor and from which inputs. A tensor carrying
//! a `GradFn` is not a leaf and cannot be handed to an optimizer. Replaying the
//! history (the backward pass) is the job of the training graph, not of this
//! crate.

use super::Tensor;

/// History node attached to the output of a gradient-tracked op.
#[derive(Debug)]
pub struct GradFn {
    op: &'static str,
    inputs: Vec<Tensor>,
}

impl GradFn {
    pub fn new(op: &'static str, inputs: Vec<Tensor>) -> Self {
        GradFn { op, inputs }
    }

    pub fn op(&self) -> &'static str {
        self.op
    }

    /// The tensors the op consumed, in argument order.
    pub fn inputs(&self) -> &[Tensor] {
        &self.inputs
    }
}
