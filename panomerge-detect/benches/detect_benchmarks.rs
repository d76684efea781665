use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use panomerge_core::synthetic::textured_scene;
use panomerge_detect::{
    BinaryDetector, CornerDetector, DetectorConfig, ImagePreprocessing, PreprocessParams, ScaleSpaceDetector,
};

fn bench_image(width: usize, height: usize) -> Vec<u8> {
    textured_scene(width, height, 7).luminance()
}

/// Benchmark both detectors end to end at a few resolutions
fn bench_detectors(c: &mut Criterion) {
    let mut group = c.benchmark_group("detectors");
    group.sample_size(20);

    let binary = BinaryDetector::new(DetectorConfig::default()).unwrap();
    let scale_space = ScaleSpaceDetector::new(DetectorConfig::default()).unwrap();

    for &(width, height) in &[(320, 240), (640, 480), (800, 600)] {
        let img = bench_image(width, height);
        group.bench_with_input(BenchmarkId::new("binary", format!("{}x{}", width, height)), &img, |b, img| {
            b.iter(|| black_box(binary.detect(black_box(img), width, height).unwrap()))
        });
        group.bench_with_input(BenchmarkId::new("scale_space", format!("{}x{}", width, height)), &img, |b, img| {
            b.iter(|| black_box(scale_space.detect(black_box(img), width, height).unwrap()))
        });
    }

    group.finish();
}

/// Benchmark preprocessing stages
fn bench_preprocessing(c: &mut Criterion) {
    let (width, height) = (800, 600);
    let img = bench_image(width, height);
    let params = PreprocessParams::default();

    let mut group = c.benchmark_group("preprocessing");
    group.bench_function("enhance", |b| {
        b.iter(|| black_box(ImagePreprocessing::enhance(black_box(&img), width, height, &params).unwrap()))
    });
    group.bench_function("clahe_8x8", |b| {
        b.iter(|| black_box(ImagePreprocessing::apply_clahe(black_box(&img), width, height, 2.0, 8).unwrap()))
    });
    group.bench_function("gaussian_blur_sigma_1_6", |b| {
        b.iter(|| black_box(ImagePreprocessing::gaussian_blur(black_box(&img), width, height, 1.6)))
    });
    group.finish();
}

/// Benchmark raw FAST corner detection with Harris scoring
fn bench_corners(c: &mut Criterion) {
    let (width, height) = (640, 480);
    let img = bench_image(width, height);
    c.bench_function("fast9_harris_640x480", |b| {
        b.iter(|| black_box(CornerDetector::detect(black_box(&img), width, height, 20, 16)))
    });
}

criterion_group!(benches, bench_detectors, bench_preprocessing, bench_corners);
criterion_main!(benches);
