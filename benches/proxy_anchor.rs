//! # Proxy Anchor Benchmarks
//!
//! Forward and backward passes of the proxy-anchor family on a fixed batch.
//!
//! Run: `cargo bench --bench proxy_anchor`

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use proxy_anchor::nn::init::{kaiming_normal_fan_out, seeded_rng};
use proxy_anchor::{
    AdaptiveProxyAnchorLoss, AutogradEngine, Device, MetricLoss, NewtonProxyAnchorLoss, ProxyAnchorConfig,
    ProxyAnchorLoss, Shape, Tensor,
};

const NUM_CLASSES: usize = 16;
const EMBEDDING_DIM: usize = 64;

fn batch(size: usize) -> (Tensor, Vec<usize>) {
    let x = kaiming_normal_fan_out(Shape::new([size, EMBEDDING_DIM]), Device::Cpu, &mut seeded_rng(Some(0)));
    let labels = (0..size).map(|i| i % NUM_CLASSES).collect();
    (x, labels)
}

fn step(loss: &dyn MetricLoss, x: &Tensor, labels: &[usize]) -> f64 {
    let engine = AutogradEngine::new();
    let embeddings = engine.variable(x.clone(), true);
    let value = loss.forward(&embeddings, labels).unwrap();
    let grads = value.backward().unwrap();
    black_box(grads.len());
    value.item().unwrap()
}

/// Benchmark forward + backward over batch sizes
fn bench_forward_backward(c: &mut Criterion) {
    let mut group = c.benchmark_group("forward_backward");
    let config = ProxyAnchorConfig::new(NUM_CLASSES, EMBEDDING_DIM).with_seed(1);

    let losses: Vec<Box<dyn MetricLoss>> = vec![
        Box::new(ProxyAnchorLoss::from_config(&config).unwrap()),
        Box::new(AdaptiveProxyAnchorLoss::from_config(&config.clone().with_num_proxy_sets(3)).unwrap()),
        Box::new(NewtonProxyAnchorLoss::from_config(&config).unwrap()),
    ];

    for size in [32, 128] {
        let (x, labels) = batch(size);
        for loss in &losses {
            group.bench_with_input(BenchmarkId::new(loss.name(), size), &size, |b, _| {
                b.iter(|| step(loss.as_ref(), &x, &labels))
            });
        }
    }

    group.finish();
}

criterion_group!(benches, bench_forward_backward);
criterion_main!(benches);
