use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use spike_extract::config::{DetectionConfig, FilterConfig};
use spike_extract::detector::SpikeDetector;
use spike_extract::filter::BandpassFilter;
use spike_extract::writer::write_flat_file;
use spike_extract::{extract, Block, ExtractConfig, Job, SignalBuffer, SourceSpec};
use tempfile::TempDir;

const SAMPLE_RATE: f64 = 20000.0;

fn synthetic(len: usize) -> Vec<i16> {
    let mut rng = StdRng::seed_from_u64(42);
    (0..len)
        .map(|i| {
            let spike = if i % 2000 < 3 { 400 } else { 0 };
            rng.gen_range(-40..=40) + spike
        })
        .collect()
}

fn bench_filter_block(c: &mut Criterion) {
    let filter = BandpassFilter::new(&FilterConfig::default(), SAMPLE_RATE).unwrap();
    let block: Vec<f32> = synthetic(10_490).iter().map(|&x| x as f32 * 0.195).collect();

    let mut group = c.benchmark_group("filter");
    group.throughput(Throughput::Elements(block.len() as u64));
    group.bench_function("bandpass_block", |b| b.iter(|| filter.apply(black_box(&block))));
    group.finish();
}

fn bench_detect_block(c: &mut Criterion) {
    let values: Vec<f32> = synthetic(10_490).iter().map(|&x| x as f32).collect();
    let signal = SignalBuffer {
        start: 0,
        times: (0..values.len()).map(|i| i as f64 / SAMPLE_RATE).collect(),
        values,
        timestep_drift_us: None,
    };
    let detector = SpikeDetector::new(DetectionConfig::default());
    let block = Block { seq: 1, start: 245, stop: 10_245 };

    c.bench_function("detect_block", |b| {
        b.iter(|| detector.detect(black_box(&block), &signal, &signal.values))
    });
}

fn bench_extract_channel(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let source = dir.path().join("bench.i16");
    let samples = synthetic(2_000_000);
    write_flat_file(&source, &samples).unwrap();

    let mut group = c.benchmark_group("extract_channel");
    group.sample_size(10);
    group.throughput(Throughput::Elements(samples.len() as u64));

    for workers in [1usize, 4, 8].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(workers), workers, |b, &workers| {
            let config = ExtractConfig {
                workers,
                ..ExtractConfig::default()
            };
            let jobs = vec![Job::new("bench", SourceSpec::flat(&source, SAMPLE_RATE), dir.path().join("out"))];
            b.iter(|| black_box(extract(&jobs, config.clone()).unwrap()));
        });
    }

    group.finish();
}

criterion_group!(benches, bench_filter_block, bench_detect_block, bench_extract_channel);
criterion_main!(benches);
