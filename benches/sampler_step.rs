use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use ndarray::{Array1, Array3, Array4};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, StandardNormal};

use aodiff::likelihood::{batch_likelihood_score, MeasurementCovariance};
use aodiff::operator::{polynomial_modes, ForwardOperator, PupilMask};
use aodiff::sampler::{GuidedSampler, SamplerConfig};
use aodiff::score::{GaussianPrior, VeSde};

fn make_batch(op: &ForwardOperator, b: usize, c: usize, seed: u64) -> (Array4<f32>, Array3<f32>) {
    let (h, w) = op.field_shape();
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let x = Array4::from_shape_simple_fn((b, c, h, w), || StandardNormal.sample(&mut rng));
    let y = op.project_batch(&x.view()).unwrap();
    (x, y)
}

fn bench_likelihood(c: &mut Criterion) {
    let mut group = c.benchmark_group("likelihood_score");
    group.sample_size(30);

    let mask = PupilMask::circular(22).padded(1);
    for &m in &[10usize, 30] {
        let z = polynomial_modes(&mask, m);
        let op = ForwardOperator::from_modes(&z.view(), &mask).unwrap();
        let cov = MeasurementCovariance::for_operator(&op, 0.01, 10.0).unwrap();
        let (x, y) = make_batch(&op, 8, 4, 123);
        let sig = Array1::from_elem(8, 0.7f32);

        group.bench_with_input(BenchmarkId::new("batch", format!("b8_c4_m{m}")), &m, |bch, _| {
            bch.iter(|| {
                batch_likelihood_score(&op, &cov, &x.view(), &y.view(), &sig.view()).unwrap()
            })
        });
    }
    group.finish();
}

fn bench_sampler(c: &mut Criterion) {
    let mut group = c.benchmark_group("guided_sampler");
    group.sample_size(10);

    let mask = PupilMask::circular(22).padded(1);
    let z = polynomial_modes(&mask, 30);
    let op = ForwardOperator::from_modes(&z.view(), &mask).unwrap();
    let prior = GaussianPrior::new(VeSde::new(0.01, 5.0).unwrap(), 0.0, 1.0).unwrap();
    let (x, y) = make_batch(&op, 8, 4, 7);

    for &steps in &[10usize, 50] {
        let cfg = SamplerConfig {
            num_steps: steps,
            eta: 0.01,
            batch_size: 8,
            channels: 4,
            ..SamplerConfig::default()
        };
        let sampler = GuidedSampler::new(cfg, op.clone(), &prior).unwrap();
        group.bench_with_input(BenchmarkId::new("sample", format!("steps{steps}")), &steps, |bch, _| {
            bch.iter(|| {
                let mut rng = ChaCha8Rng::seed_from_u64(0);
                sampler.sample(&x.view(), &y.view(), &mut rng).unwrap()
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_likelihood, bench_sampler);
criterion_main!(benches);
