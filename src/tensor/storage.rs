//! # Tensor Storage
//!
//! Defines the underlying memory storage for Tensors.
//! Data always lives in host memory as an `ndarray::ArrayD`; the element type
//! is chosen per tensor and the device is a placement tag.

use ndarray::{ArrayD, IxDyn};
use serde::{Deserialize, Serialize};

/// Element type of a tensor's storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum DType {
    #[default]
    F32,
    F64,
}

impl std::fmt::Display for DType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DType::F32 => write!(f, "float32"),
            DType::F64 => write!(f, "float64"),
        }
    }
}

// --- Device Enum ---
/// Represents the device where the tensor data resides.
///
/// `Gpu` is a placement tag only: the bytes stay in host memory, but tensors on
/// different devices refuse to mix in an op, which is what callers observe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Device {
    #[default]
    Cpu,
    Gpu(u32),
}

impl std::fmt::Display for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
            Device::Gpu(id) => write!(f, "gpu:{}", id),
        }
    }
}

/// Typed backing array of a tensor.
#[derive(Debug, Clone, PartialEq)]
pub enum Storage {
    F32(ArrayD<f32>),
    F64(ArrayD<f64>),
}

impl Storage {
    /// Zero-filled storage of the given shape and element type.
    pub fn zeros(shape: &[usize], dtype: DType) -> Self {
        match dtype {
            DType::F32 => Storage::F32(ArrayD::zeros(IxDyn(shape))),
            DType::F64 => Storage::F64(ArrayD::zeros(IxDyn(shape))),
        }
    }

    /// Storage filled with `value`.
    pub fn full(shape: &[usize], value: f64, dtype: DType) -> Self {
        match dtype {
            DType::F32 => Storage::F32(ArrayD::from_elem(IxDyn(shape), value as f32)),
            DType::F64 => Storage::F64(ArrayD::from_elem(IxDyn(shape), value)),
        }
    }

    /// Builds storage from flat values laid out in row-major order.
    pub fn from_vec(
        shape: &[usize],
        values: Vec<f64>,
        dtype: DType,
    ) -> Result<Self, ndarray::ShapeError> {
        let array = ArrayD::from_shape_vec(IxDyn(shape), values)?;
        Ok(match dtype {
            DType::F32 => Storage::F32(array.mapv(|v| v as f32)),
            DType::F64 => Storage::F64(array),
        })
    }

    pub fn dtype(&self) -> DType {
        match self {
            Storage::F32(_) => DType::F32,
            Storage::F64(_) => DType::F64,
        }
    }

    pub fn shape(&self) -> &[usize] {
        match self {
            Storage::F32(a) => a.shape(),
            Storage::F64(a) => a.shape(),
        }
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        match self {
            Storage::F32(a) => a.len(),
            Storage::F64(a) => a.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns a copy converted to `dtype`. Same-type casts are plain clones.
    pub fn cast(&self, dtype: DType) -> Self {
        match (self, dtype) {
            (Storage::F32(a), DType::F64) => Storage::F64(a.mapv(f64::from)),
            (Storage::F64(a), DType::F32) => Storage::F32(a.mapv(|v| v as f32)),
            _ => self.clone(),
        }
    }

    /// Overwrites every element with `value`.
    pub fn fill(&mut self, value: f64) {
        match self {
            Storage::F32(a) => a.fill(value as f32),
            Storage::F64(a) => a.fill(value),
        }
    }

    /// Row-major copy of the elements widened to `f64`.
    pub fn to_f64_vec(&self) -> Vec<f64> {
        match self {
            Storage::F32(a) => a.iter().map(|&v| f64::from(v)).collect(),
            Storage::F64(a) => a.iter().copied().collect(),
        }
    }
}
