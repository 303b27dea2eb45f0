use burn_core::tensor::backend::Backend;
use burn_core::tensor::{Tensor, TensorData};
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use geodesics::{ConvFrontEnd, Geodesic, GeodesicBackend, GeodesicConfig, SynthesisConfig};

type B = GeodesicBackend;

fn image(seed: u64, side: usize) -> Tensor<B, 4> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let values: Vec<f32> = (0..side * side)
        .map(|_| 0.1 + 0.8 * rng.random::<f32>())
        .collect();
    Tensor::from_data(
        TensorData::new(values, [1, 1, side, side]),
        &<B as Backend>::Device::default(),
    )
}

fn engine(side: usize, n_steps: usize) -> Geodesic<B, ConvFrontEnd<B>> {
    let model = ConvFrontEnd::<B>::new(&<B as Backend>::Device::default(), 1, 8, 3, 0)
        .expect("odd kernel");
    Geodesic::new(
        image(1, side),
        image(2, side),
        model,
        &GeodesicConfig::new().with_n_steps(n_steps),
        None,
    )
    .unwrap()
}

fn bench_objective(c: &mut Criterion) {
    let mut group = c.benchmark_group("geodesic");
    group.sample_size(20);

    let cases = [(16usize, 10usize), (32usize, 10usize), (32usize, 20usize)];
    for &(side, n_steps) in &cases {
        let id = format!("side{side}_steps{n_steps}");
        let geo = engine(side, n_steps);

        group.bench_with_input(BenchmarkId::new("objective", &id), &(), |b, _| {
            b.iter(|| geo.objective_function(None).unwrap())
        });

        group.bench_with_input(BenchmarkId::new("jerkiness", &id), &(), |b, _| {
            b.iter(|| geo.calculate_jerkiness(None).unwrap())
        });

        // One optimizer step per iteration; the engine is rebuilt outside the timed closure.
        group.bench_with_input(BenchmarkId::new("synthesize_step", &id), &(), |b, _| {
            b.iter_batched(
                || engine(side, n_steps),
                |mut geo| {
                    geo.synthesize(&SynthesisConfig::new().with_max_iter(1), None)
                        .unwrap()
                },
                criterion::BatchSize::SmallInput,
            )
        });
    }

    group.finish();
}

criterion_group!(benches, bench_objective);
criterion_main!(benches);
