//! Benchmarks for artifact rejection

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use droptrack::{ArtifactRejector, RejectorParams, SpatialGrid};
use rand::{Rng, SeedableRng};
use std::hint::black_box;

/// Droplets drifting along x plus a fixed set of static artifacts
fn create_test_frames(n_moving: usize, n_static: usize, n_frames: usize) -> Vec<Vec<(f64, f64)>> {
    let mut rng = rand::rngs::StdRng::seed_from_u64(7);
    let artifacts: Vec<(f64, f64)> = (0..n_static)
        .map(|_| (rng.gen_range(0.0..1280.0), rng.gen_range(0.0..720.0)))
        .collect();

    (0..n_frames)
        .map(|frame| {
            let mut points = Vec::with_capacity(n_moving + n_static);
            for i in 0..n_moving {
                let x = (i * 60) as f64 + frame as f64 * 4.0;
                let y = (i * 25 % 700) as f64 + rng.gen_range(-0.5..0.5);
                points.push((x, y));
            }
            points.extend(artifacts.iter().copied());
            points
        })
        .collect()
}

fn bench_filter_stream(c: &mut Criterion) {
    let frames = create_test_frames(20, 5, 30);

    c.bench_function("rejector_filter_25_candidates_30_frames", |b| {
        b.iter_batched(
            || ArtifactRejector::new(RejectorParams::default()),
            |mut rejector| {
                for (frame_id, candidates) in frames.iter().enumerate() {
                    let _passed = rejector
                        .filter(black_box(candidates.clone()), frame_id as u64)
                        .unwrap();
                }
            },
            criterion::BatchSize::SmallInput,
        )
    });
}

fn bench_filter_various_sizes(c: &mut Criterion) {
    let mut group = c.benchmark_group("rejector_various_candidate_counts");

    for &n_moving in &[10, 50, 100, 200] {
        let frames = create_test_frames(n_moving, n_moving / 10, 10);

        group.bench_with_input(
            BenchmarkId::new("candidates", n_moving),
            &frames,
            |b, frames| {
                b.iter_batched(
                    || ArtifactRejector::new(RejectorParams::default()),
                    |mut rejector| {
                        for (frame_id, candidates) in frames.iter().enumerate() {
                            let _passed = rejector
                                .filter(black_box(candidates.clone()), frame_id as u64)
                                .unwrap();
                        }
                    },
                    criterion::BatchSize::SmallInput,
                )
            },
        );
    }
    group.finish();
}

fn bench_spatial_query(c: &mut Criterion) {
    let mut grid = SpatialGrid::new(20.0);
    let frames = create_test_frames(200, 0, 1);
    for (i, &p) in frames[0].iter().enumerate() {
        grid.insert(p, i);
    }

    c.bench_function("spatial_grid_query_200_points", |b| {
        b.iter(|| {
            for &p in &frames[0] {
                black_box(grid.query(black_box(p), 20.0));
            }
        })
    });
}

criterion_group!(
    benches,
    bench_filter_stream,
    bench_filter_various_sizes,
    bench_spatial_query
);
criterion_main!(benches);
