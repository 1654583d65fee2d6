//! Criterion benchmarks for the all-reduce strategies.
//!
//! Compares the single-stage, two-stage and staged-copy fallback paths over
//! payload sizes straddling the dispatch threshold, on the in-process mesh.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use allreduce_core::{
    all_reduce_with_config, CollectiveConfig, DeviceBuffer, DeviceMesh, Signal, Strategy,
};

fn bench_strategies(c: &mut Criterion) {
    let mut group = c.benchmark_group("all_reduce_f32");

    let n = 4;
    let mesh = DeviceMesh::new(n);

    for &num_elements in &[4 * 1024, 64 * 1024, 512 * 1024] {
        let inputs: Vec<_> = (0..n)
            .map(|d| {
                let host: Vec<f32> = (0..num_elements).map(|i| (d + i) as f32 * 0.5).collect();
                DeviceBuffer::from_slice(&mesh, d, &host).unwrap()
            })
            .collect();
        let mut outputs: Vec<_> = (0..n)
            .map(|d| DeviceBuffer::<f32>::zeros(&mesh, d, num_elements).unwrap())
            .collect();
        let signals: Vec<_> = (0..n)
            .map(|_| {
                Signal::new(Signal::required_scratch_bytes(
                    num_elements,
                    allreduce_core::DType::F32,
                ))
            })
            .collect();

        for strategy in [Strategy::SingleStage, Strategy::TwoStage, Strategy::Fallback] {
            let cfg = CollectiveConfig::with_strategy(strategy);
            let label = format!("{strategy:?}");
            group.bench_with_input(
                BenchmarkId::new(label, num_elements),
                &num_elements,
                |b, _| {
                    b.iter(|| {
                        all_reduce_with_config(
                            &mesh,
                            black_box(&inputs),
                            &mut outputs,
                            &signals,
                            None,
                            &cfg,
                        )
                        .expect("all_reduce failed")
                    });
                },
            );
        }
    }
    group.finish();
}

criterion_group!(benches, bench_strategies);
criterion_main!(benches);
