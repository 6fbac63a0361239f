//! # Tensor Operations
//!
//! Element-wise arithmetic used by the optimizers. Binary ops require both
//! operands to agree on shape, dtype and device; there is no broadcasting.
//! Out-of-place ops on gradient-tracked inputs record a `GradFn`, in-place ops
//! (trailing underscore) write straight into storage and record nothing.

use ndarray::Zip;

use super::{DType, Device, GradFn, Storage, Tensor, TensorError};

// --- Helper Functions ---

/// Fails unless `a` and `b` agree on shape, dtype and device.
pub fn check_compatible(op: &'static str, a: &Tensor, b: &Tensor) -> Result<(), TensorError> {
    if a.shape() != b.shape() {
        return Err(TensorError::ShapeMismatch {
            op,
            expected: a.shape().to_vec(),
            got: b.shape().to_vec(),
        });
    }
    if a.dtype() != b.dtype() {
        return Err(TensorError::DTypeMismatch {
            op,
            lhs: a.dtype(),
            rhs: b.dtype(),
        });
    }
    if a.device() != b.device() {
        return Err(TensorError::DeviceMismatch {
            op,
            lhs: a.device(),
            rhs: b.device(),
        });
    }
    Ok(())
}

fn dtype_mismatch(op: &'static str, lhs: &Storage, rhs: &Storage) -> TensorError {
    TensorError::DTypeMismatch {
        op,
        lhs: lhs.dtype(),
        rhs: rhs.dtype(),
    }
}

/// Wraps op output, attaching history when any input tracks gradients.
fn create_op_result(
    op: &'static str,
    storage: Storage,
    device: Device,
    inputs: &[&Tensor],
) -> Tensor {
    if inputs.iter().any(|t| t.requires_grad()) {
        let grad_fn = GradFn::new(op, inputs.iter().map(|t| (*t).clone()).collect());
        Tensor::from_op(storage, device, grad_fn)
    } else {
        Tensor::from_storage(storage, device, false)
    }
}

fn binary<F, G>(
    op: &'static str,
    a: &Tensor,
    b: &Tensor,
    f32_op: F,
    f64_op: G,
) -> Result<Tensor, TensorError>
where
    F: Fn(f32, f32) -> f32,
    G: Fn(f64, f64) -> f64,
{
    check_compatible(op, a, b)?;
    let storage = {
        let lhs = a.storage();
        let rhs = b.storage();
        match (&*lhs, &*rhs) {
            (Storage::F32(x), Storage::F32(y)) => {
                Storage::F32(Zip::from(x).and(y).map_collect(|&p, &q| f32_op(p, q)))
            }
            (Storage::F64(x), Storage::F64(y)) => {
                Storage::F64(Zip::from(x).and(y).map_collect(|&p, &q| f64_op(p, q)))
            }
            (l, r) => return Err(dtype_mismatch(op, l, r)),
        }
    };
    Ok(create_op_result(op, storage, a.device(), &[a, b]))
}

fn unary<F, G>(op: &'static str, a: &Tensor, f32_op: F, f64_op: G) -> Tensor
where
    F: Fn(f32) -> f32,
    G: Fn(f64) -> f64,
{
    let storage = match &*a.storage() {
        Storage::F32(x) => Storage::F32(x.mapv(f32_op)),
        Storage::F64(x) => Storage::F64(x.mapv(f64_op)),
    };
    create_op_result(op, storage, a.device(), &[a])
}

fn in_place<F, G>(
    op: &'static str,
    target: &Tensor,
    other: &Tensor,
    f32_op: F,
    f64_op: G,
) -> Result<(), TensorError>
where
    F: Fn(&mut f32, f32),
    G: Fn(&mut f64, f64),
{
    check_compatible(op, target, other)?;
    // Snapshot the operand first so `x.add_(&x)` cannot deadlock on its own lock.
    let rhs = other.storage().clone();
    let mut lhs = target.storage_mut();
    match (&mut *lhs, &rhs) {
        (Storage::F32(x), Storage::F32(y)) => Zip::from(x).and(y).for_each(|p, &q| f32_op(p, q)),
        (Storage::F64(x), Storage::F64(y)) => Zip::from(x).and(y).for_each(|p, &q| f64_op(p, q)),
        (l, r) => return Err(dtype_mismatch(op, l, r)),
    }
    Ok(())
}

// --- Arithmetic Operations ---

/// Element-wise addition.
pub fn add(a: &Tensor, b: &Tensor) -> Result<Tensor, TensorError> {
    binary("add", a, b, |p, q| p + q, |p, q| p + q)
}

/// Element-wise subtraction (a - b).
pub fn sub(a: &Tensor, b: &Tensor) -> Result<Tensor, TensorError> {
    binary("sub", a, b, |p, q| p - q, |p, q| p - q)
}

/// Element-wise multiplication.
pub fn mul(a: &Tensor, b: &Tensor) -> Result<Tensor, TensorError> {
    binary("mul", a, b, |p, q| p * q, |p, q| p * q)
}

/// Element-wise division (a / b).
pub fn div(a: &Tensor, b: &Tensor) -> Result<Tensor, TensorError> {
    binary("div", a, b, |p, q| p / q, |p, q| p / q)
}

/// Element-wise maximum.
pub fn maximum(a: &Tensor, b: &Tensor) -> Result<Tensor, TensorError> {
    binary("maximum", a, b, f32::max, f64::max)
}

pub fn add_scalar(a: &Tensor, scalar: f64) -> Result<Tensor, TensorError> {
    let s32 = scalar as f32;
    Ok(unary("add_scalar", a, move |v| v + s32, move |v| v + scalar))
}

pub fn mul_scalar(a: &Tensor, scalar: f64) -> Result<Tensor, TensorError> {
    let s32 = scalar as f32;
    Ok(unary("mul_scalar", a, move |v| v * s32, move |v| v * scalar))
}

pub fn sqrt(a: &Tensor) -> Result<Tensor, TensorError> {
    Ok(unary("sqrt", a, f32::sqrt, f64::sqrt))
}

/// Sum of all elements as a single-element tensor.
pub fn sum(a: &Tensor) -> Result<Tensor, TensorError> {
    let storage = match &*a.storage() {
        Storage::F32(x) => Storage::from_vec(&[1], vec![f64::from(x.sum())], DType::F32)?,
        Storage::F64(x) => Storage::from_vec(&[1], vec![x.sum()], DType::F64)?,
    };
    Ok(create_op_result("sum", storage, a.device(), &[a]))
}

/// Inner product of two same-shaped tensors, accumulated in `f64`.
pub fn dot(a: &Tensor, b: &Tensor) -> Result<f64, TensorError> {
    check_compatible("dot", a, b)?;
    let lhs = a.to_vec();
    let rhs = b.to_vec();
    Ok(lhs.iter().zip(&rhs).map(|(p, q)| p * q).sum())
}

// --- In-place Operations ---

/// `target += other`
pub fn add_(target: &Tensor, other: &Tensor) -> Result<(), TensorError> {
    in_place("add_", target, other, |p, q| *p += q, |p, q| *p += q)
}

/// `target -= other`
pub fn sub_(target: &Tensor, other: &Tensor) -> Result<(), TensorError> {
    in_place("sub_", target, other, |p, q| *p -= q, |p, q| *p -= q)
}

/// Copies `source` into `target`'s storage.
pub fn copy_(target: &Tensor, source: &Tensor) -> Result<(), TensorError> {
    in_place("copy_", target, source, |p, q| *p = q, |p, q| *p = q)
}
