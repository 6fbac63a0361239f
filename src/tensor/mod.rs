//! # Tensor Module
//!
//! This module defines the core `Tensor` handle the optimizers work on:
//! shared storage, a shared gradient slot, device/dtype placement and a
//! record of the op that produced it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use ndarray::{ArrayD, IxDyn};
use rand::distributions::{Distribution, Uniform};
use serde::{Deserialize, Serialize};

// --- Submodules ---
pub mod autograd;
pub mod ops;
pub mod storage;

// --- Re-exports ---
pub use autograd::GradFn;
pub use storage::{DType, Device, Storage};

// --- Error Handling ---
#[derive(thiserror::Error, Debug)]
pub enum TensorError {
    #[error("Shape mismatch in {op}: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        op: &'static str,
        expected: Vec<usize>,
        got: Vec<usize>,
    },
    #[error("Dtype mismatch in {op}: {lhs} and {rhs}")]
    DTypeMismatch {
        op: &'static str,
        lhs: DType,
        rhs: DType,
    },
    #[error("Device mismatch in {op}: {lhs} and {rhs}")]
    DeviceMismatch {
        op: &'static str,
        lhs: Device,
        rhs: Device,
    },
    #[error("Expected a single-element tensor, got shape {0:?}")]
    NotScalar(Vec<usize>),
    #[error("ndarray error: {0}")]
    NdarrayError(#[from] ndarray::ShapeError),
}

/// Default element type of tensors built from plain arrays.
pub type TensorData = f32;

/// Identity of a tensor's storage.
///
/// Every fresh allocation gets a new id; clones and detached views share it.
/// Two tensors with equal values but different storage have different ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TensorId(u64);

impl TensorId {
    fn next() -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        TensorId(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for TensorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// # Tensor
///
/// A reference-counted handle. Cloning is cheap and every clone sees the same
/// data and the same gradient slot, so an optimizer holding a clone observes
/// gradients written through the model's handle and vice versa.
#[derive(Clone, Debug)]
pub struct Tensor {
    id: TensorId,
    data: Arc<RwLock<Storage>>,
    shape: Vec<usize>,
    dtype: DType,
    device: Device,
    grad: Arc<Mutex<Option<Tensor>>>,
    grad_fn: Option<Arc<GradFn>>,
    requires_grad: bool,
}

impl Tensor {
    /// Creates a new leaf Tensor on the CPU from an `f32` array.
    pub fn new(data: ArrayD<TensorData>, requires_grad: bool) -> Self {
        Self::from_storage(Storage::F32(data), Device::Cpu, requires_grad)
    }

    /// Creates a new leaf Tensor from typed storage placed on `device`.
    pub fn from_storage(storage: Storage, device: Device, requires_grad: bool) -> Self {
        let shape = storage.shape().to_vec();
        let dtype = storage.dtype();
        Tensor {
            id: TensorId::next(),
            data: Arc::new(RwLock::new(storage)),
            shape,
            dtype,
            device,
            grad: Arc::new(Mutex::new(None)),
            grad_fn: None,
            requires_grad,
        }
    }

    /// Creates a leaf Tensor from row-major values.
    pub fn from_vec(
        shape: &[usize],
        values: Vec<f64>,
        dtype: DType,
        requires_grad: bool,
    ) -> Result<Self, TensorError> {
        let storage = Storage::from_vec(shape, values, dtype)?;
        Ok(Self::from_storage(storage, Device::Cpu, requires_grad))
    }

    /// Creates a Tensor that is not a leaf node (i.e., result of an operation).
    pub(crate) fn from_op(storage: Storage, device: Device, grad_fn: GradFn) -> Self {
        let mut tensor = Self::from_storage(storage, device, true);
        tensor.grad_fn = Some(Arc::new(grad_fn));
        tensor
    }

    pub fn id(&self) -> TensorId {
        self.id
    }

    /// Returns the shape of the tensor.
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Returns the number of dimensions.
    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Returns the total number of elements.
    pub fn size(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn requires_grad(&self) -> bool {
        self.requires_grad
    }

    pub fn set_requires_grad(&mut self, requires_grad: bool) {
        self.requires_grad = requires_grad;
    }

    /// A leaf has no recorded computation history.
    pub fn is_leaf(&self) -> bool {
        self.grad_fn.is_none()
    }

    /// Record of the op that produced this tensor, if any.
    pub fn grad_fn(&self) -> Option<&GradFn> {
        self.grad_fn.as_deref()
    }

    /// Provides read-only access to the underlying storage.
    pub fn storage(&self) -> RwLockReadGuard<'_, Storage> {
        self.data.read().expect("Tensor data RwLock poisoned")
    }

    /// Provides mutable access to the underlying storage.
    /// Writes through this guard are not recorded in any history.
    pub fn storage_mut(&self) -> RwLockWriteGuard<'_, Storage> {
        self.data.write().expect("Tensor data RwLock poisoned")
    }

    /// Row-major copy of the values widened to `f64`.
    pub fn to_vec(&self) -> Vec<f64> {
        self.storage().to_f64_vec()
    }

    /// Value of a single-element tensor.
    pub fn item(&self) -> Result<f64, TensorError> {
        if self.size() != 1 {
            return Err(TensorError::NotScalar(self.shape.clone()));
        }
        Ok(self.to_vec()[0])
    }

    /// Returns a view sharing the same storage but without autograd history
    /// or gradient.
    pub fn detach(&self) -> Self {
        Tensor {
            id: self.id,
            data: Arc::clone(&self.data),
            shape: self.shape.clone(),
            dtype: self.dtype,
            device: self.device,
            grad: Arc::new(Mutex::new(None)),
            grad_fn: None,
            requires_grad: false,
        }
    }

    /// Drops the autograd history of this handle in place.
    pub fn detach_(&mut self) {
        self.grad_fn = None;
        self.requires_grad = false;
    }

    /// Copies the data into fresh storage on `device` with element type `dtype`.
    ///
    /// The copy is a leaf with a new identity and no gradient; `requires_grad`
    /// carries over.
    pub fn to(&self, device: Device, dtype: DType) -> Self {
        let storage = self.storage().cast(dtype);
        Self::from_storage(storage, device, self.requires_grad)
    }

    /// Overwrites every element with zero, in place.
    pub fn zero_(&self) {
        self.storage_mut().fill(0.0);
    }

    /// Overwrites every element with `value`, in place.
    pub fn fill_(&self, value: f64) {
        self.storage_mut().fill(value);
    }

    fn grad_slot(&self) -> MutexGuard<'_, Option<Tensor>> {
        self.grad.lock().expect("Gradient Mutex poisoned")
    }

    /// Retrieves the gradient tensor, if it exists.
    /// The returned Tensor shares data with the stored gradient.
    pub fn grad(&self) -> Option<Tensor> {
        self.grad_slot().clone()
    }

    /// Replaces the gradient. The gradient must match this tensor's shape,
    /// dtype and device.
    pub fn set_grad(&self, grad: Tensor) -> Result<(), TensorError> {
        if grad.shape() != self.shape() {
            return Err(TensorError::ShapeMismatch {
                op: "set_grad",
                expected: self.shape.clone(),
                got: grad.shape().to_vec(),
            });
        }
        if grad.dtype() != self.dtype {
            return Err(TensorError::DTypeMismatch {
                op: "set_grad",
                lhs: self.dtype,
                rhs: grad.dtype(),
            });
        }
        if grad.device() != self.device {
            return Err(TensorError::DeviceMismatch {
                op: "set_grad",
                lhs: self.device,
                rhs: grad.device(),
            });
        }
        *self.grad_slot() = Some(grad);
        Ok(())
    }

    /// Adds `incoming` into the gradient, materializing a zero gradient with
    /// this tensor's placement first if none exists.
    pub fn accumulate_grad(&self, incoming: &Tensor) -> Result<(), TensorError> {
        let mut slot = self.grad_slot();
        let existing = slot.get_or_insert_with(|| zeros_like(self));
        ops::add_(existing, incoming)
    }

    /// Zeroes the gradient of the tensor if it exists.
    ///
    /// The gradient is first detached from any history, then overwritten with
    /// zeros in place. A tensor without a gradient is left without one.
    pub fn zero_grad(&self) {
        let mut slot = self.grad_slot();
        if let Some(grad) = slot.as_mut() {
            grad.detach_();
            grad.zero_();
        }
    }
}

// --- Helper functions ---

/// Helper to create an `f32` CPU tensor filled with zeros.
pub fn zeros(shape: &[usize], requires_grad: bool) -> Tensor {
    let data = ArrayD::zeros(IxDyn(shape));
    Tensor::new(data, requires_grad)
}

/// Helper to create an `f32` CPU tensor filled with ones.
pub fn ones(shape: &[usize], requires_grad: bool) -> Tensor {
    let data = ArrayD::ones(IxDyn(shape));
    Tensor::new(data, requires_grad)
}

/// Zero tensor with the shape, dtype and device of `like`.
pub fn zeros_like(like: &Tensor) -> Tensor {
    full_like(like, 0.0)
}

/// Tensor filled with `value`, with the shape, dtype and device of `like`.
pub fn full_like(like: &Tensor, value: f64) -> Tensor {
    let storage = Storage::full(like.shape(), value, like.dtype());
    Tensor::from_storage(storage, like.device(), false)
}

/// Helper to create an `f32` CPU tensor with values drawn uniformly from `[0, 1)`.
pub fn rand(shape: &[usize], requires_grad: bool) -> Tensor {
    let dist = Uniform::new(0.0f32, 1.0);
    let mut rng = rand::thread_rng();
    let len: usize = shape.iter().product();
    let values: Vec<f32> = (0..len).map(|_| dist.sample(&mut rng)).collect();
    let data = ArrayD::from_shape_vec(IxDyn(shape), values)
        .expect("value count matches shape product");
    Tensor::new(data, requires_grad)
}
