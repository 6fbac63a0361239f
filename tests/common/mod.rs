#![allow(dead_code)]

use rtorch_optim::tensor::{DType, Tensor};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Trainable `f64` CPU vector.
pub fn param(values: &[f64]) -> Tensor {
    Tensor::from_vec(&[values.len()], values.to_vec(), DType::F64, true).unwrap()
}

/// Gradient-shaped `f64` CPU vector.
pub fn grad(values: &[f64]) -> Tensor {
    Tensor::from_vec(&[values.len()], values.to_vec(), DType::F64, false).unwrap()
}

/// Independent copy with the same values and placement.
pub fn copy_of(t: &Tensor) -> Tensor {
    t.to(t.device(), t.dtype())
}

pub fn assert_close(actual: &[f64], expected: &[f64]) {
    assert_eq!(actual.len(), expected.len());
    for (a, e) in actual.iter().zip(expected) {
        assert!((a - e).abs() < 1e-9, "{:?} != {:?}", actual, expected);
    }
}
