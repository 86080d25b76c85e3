use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use dropscope::{
    config::MorphOperation,
    histogram::{Dimension, DropletHistogram},
    measurement::Measurer,
    preprocessing::{median_image, open, threshold_binary, to_grayscale, StructuringElement},
    segmentation::extract_blobs,
    CalibrationProfile, DropletPipeline, Frame, PipelineConfig,
};
use image::GrayImage;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const BACKGROUND: u8 = 30;
const DROPLET: u8 = 200;

/// Flat noisy background with randomly placed droplets
fn synthetic_frame(rng: &mut StdRng, width: u32, height: u32, droplets: usize, id: u64) -> Frame {
    let mut data: Vec<u8> = (0..width * height)
        .map(|_| BACKGROUND + rng.gen_range(0..6))
        .collect();

    for _ in 0..droplets {
        let r = rng.gen_range(4..14) as i64;
        let cx = rng.gen_range(r..width as i64 - r);
        let cy = rng.gen_range(r..height as i64 - r);
        for y in cy - r..=cy + r {
            for x in cx - r..=cx + r {
                if (x - cx).pow(2) + (y - cy).pow(2) <= r * r {
                    data[(y as u32 * width + x as u32) as usize] = DROPLET;
                }
            }
        }
    }

    Frame::gray(data, width, height, id)
}

fn synthetic_mask(rng: &mut StdRng, width: u32, height: u32, droplets: usize) -> GrayImage {
    let frame = synthetic_frame(rng, width, height, droplets, 0);
    let gray = to_grayscale(&frame).unwrap();
    threshold_binary(&gray, 100)
}

/// Benchmark median background computation over the warm-up stack
fn bench_median_background(c: &mut Criterion) {
    let mut group = c.benchmark_group("median_background");
    let mut rng = StdRng::seed_from_u64(7);

    for &frames in [10usize, 30].iter() {
        let samples: Vec<GrayImage> = (0..frames)
            .map(|i| to_grayscale(&synthetic_frame(&mut rng, 640, 480, 0, i as u64)).unwrap())
            .collect();

        group.throughput(Throughput::Elements(640 * 480));
        group.bench_with_input(BenchmarkId::new("frames", frames), &samples, |b, samples| {
            b.iter(|| median_image(black_box(samples)).unwrap());
        });
    }

    group.finish();
}

/// Benchmark morphological open at several kernel sizes
fn bench_morphology(c: &mut Criterion) {
    let mut group = c.benchmark_group("morphology_open");
    let mut rng = StdRng::seed_from_u64(11);
    let mask = synthetic_mask(&mut rng, 640, 480, 40);

    for &size in [3u32, 5, 7].iter() {
        let kernel = StructuringElement::ellipse(size);
        group.bench_with_input(BenchmarkId::new("kernel", size), &kernel, |b, kernel| {
            b.iter(|| open(black_box(&mask), kernel));
        });
    }

    group.finish();
}

/// Benchmark blob extraction and measurement for varying droplet counts
fn bench_segmentation(c: &mut Criterion) {
    let mut group = c.benchmark_group("segmentation");
    let mut rng = StdRng::seed_from_u64(13);
    let measurer = Measurer::new(CalibrationProfile::new(2.5, -0.5));

    for &droplets in [10usize, 50, 200].iter() {
        let mask = synthetic_mask(&mut rng, 1280, 720, droplets);
        group.throughput(Throughput::Elements(droplets as u64));

        group.bench_with_input(BenchmarkId::new("extract", droplets), &mask, |b, mask| {
            b.iter(|| extract_blobs(black_box(mask), 5));
        });

        let blobs = extract_blobs(&mask, 5);
        group.bench_with_input(BenchmarkId::new("measure", droplets), &blobs, |b, blobs| {
            b.iter(|| measurer.measure(black_box(blobs), 1, 0));
        });
    }

    group.finish();
}

/// Benchmark statistics over a full histogram window
fn bench_histogram_statistics(c: &mut Criterion) {
    let mut rng = StdRng::seed_from_u64(17);
    let measurer = Measurer::new(CalibrationProfile::default());
    let mut histogram = DropletHistogram::new(2000, 40, 2.0);

    let mut id = 0;
    while histogram.len() < histogram.capacity() {
        let mask = synthetic_mask(&mut rng, 640, 480, 50);
        histogram.extend(measurer.measure(&extract_blobs(&mask, 5), id, 0));
        id += 1;
    }

    c.bench_function("histogram_report_2000", |b| {
        b.iter(|| black_box(histogram.report()));
    });
    c.bench_function("histogram_snapshot_2000", |b| {
        b.iter(|| black_box(histogram.snapshot(Dimension::EquivalentDiameter)));
    });
}

/// Benchmark a full pass through a warmed-up pipeline
fn bench_full_pipeline(c: &mut Criterion) {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut group = c.benchmark_group("full_pipeline");
    let mut rng = StdRng::seed_from_u64(19);

    for &(width, height) in [(640u32, 480u32), (1280, 720)].iter() {
        let config = PipelineConfig {
            background_warmup_frames: 5,
            morph_operation: MorphOperation::Open,
            ..PipelineConfig::default()
        };
        let mut pipeline = DropletPipeline::new(config, CalibrationProfile::default()).unwrap();
        let mut frame_id = 0u64;
        for _ in 0..5 {
            pipeline
                .process_frame(synthetic_frame(&mut rng, width, height, 0, frame_id))
                .unwrap();
            frame_id += 1;
        }

        let frames: Vec<Frame> = (0..16)
            .map(|i| synthetic_frame(&mut rng, width, height, 30, i))
            .collect();

        group.throughput(Throughput::Elements(1));
        group.bench_function(BenchmarkId::new("frame", format!("{}x{}", width, height)), |b| {
            let mut i = 0usize;
            b.iter(|| {
                let mut frame = frames[i % frames.len()].clone();
                frame.frame_id = frame_id;
                frame_id += 1;
                i += 1;
                let result = pipeline.process_frame(frame).unwrap();
                pipeline.publish(result);
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_median_background,
    bench_morphology,
    bench_segmentation,
    bench_histogram_statistics,
    bench_full_pipeline
);
criterion_main!(benches);
