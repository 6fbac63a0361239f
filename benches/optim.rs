use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use std::hint::black_box;

use rtorch_optim::optim::{
    Adagrad, AdagradOptions, Adam, AdamOptions, Optimizer, OptimizerCore, Sgd, SgdOptions,
};
use rtorch_optim::tensor::{rand, Tensor};

fn parameters(count: usize, len: usize) -> Vec<Tensor> {
    (0..count)
        .map(|_| {
            let p = rand(&[len], true);
            p.set_grad(rand(&[len], false)).unwrap();
            p
        })
        .collect()
}

fn benchmark_step(c: &mut Criterion) {
    let mut group = c.benchmark_group("step");

    for len in [256usize, 4096] {
        let mut sgd = Sgd::new(parameters(16, len), SgdOptions::new(1e-3).momentum(0.9)).unwrap();
        group.bench_with_input(BenchmarkId::new("sgd_momentum", len), &len, |b, _| {
            b.iter(|| black_box(sgd.step().unwrap()))
        });

        let mut adam = Adam::new(parameters(16, len), AdamOptions::new(1e-3)).unwrap();
        group.bench_with_input(BenchmarkId::new("adam", len), &len, |b, _| {
            b.iter(|| black_box(adam.step().unwrap()))
        });

        let mut adagrad = Adagrad::new(parameters(16, len), AdagradOptions::new(1e-2)).unwrap();
        group.bench_with_input(BenchmarkId::new("adagrad", len), &len, |b, _| {
            b.iter(|| black_box(adagrad.step().unwrap()))
        });
    }

    group.finish();
}

fn benchmark_zero_grad(c: &mut Criterion) {
    // Gradients stay allocated, so every iteration zeroes all of them.
    let mut sgd = Sgd::new(parameters(64, 1024), SgdOptions::default()).unwrap();
    c.bench_function("zero_grad_64x1024", |b| b.iter(|| sgd.zero_grad()));
}

criterion_group!(benches, benchmark_step, benchmark_zero_grad);
criterion_main!(benches);
