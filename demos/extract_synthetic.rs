use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use spike_extract::writer::write_flat_file;
use spike_extract::{extract, ExtractConfig, Job, SourceSpec, SpikeArchive, DEFAULT_FLAT_SAMPLE_RATE};
use std::env;
use std::error::Error;
use std::path::PathBuf;

const NUM_SAMPLES: usize = 1_000_000;
const SPIKE_INTERVAL: usize = 4000;

/// Template roughly shaped like an extracellular action potential, in ADC units.
fn template(k: usize) -> f64 {
    let t = k as f64 / DEFAULT_FLAT_SAMPLE_RATE * 1000.0;
    -600.0 * (-((t - 0.3) / 0.12).powi(2)).exp() + 250.0 * (-((t - 0.7) / 0.25).powi(2)).exp()
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    // Optional arguments: output directory, config file
    let args: Vec<String> = env::args().collect();
    let out_dir = args.get(1).map(PathBuf::from).unwrap_or_else(|| env::temp_dir().join("spike_extract_demo"));
    let config = match args.get(2) {
        Some(path) => ExtractConfig::from_json_file(path)?,
        None => ExtractConfig::default(),
    };
    std::fs::create_dir_all(&out_dir)?;

    // Generate a synthetic recording
    let mut rng = StdRng::seed_from_u64(2024);
    let mut samples: Vec<i16> = (0..NUM_SAMPLES).map(|_| rng.gen_range(-60..=60)).collect();
    let mut planted = 0;
    for start in (SPIKE_INTERVAL..NUM_SAMPLES - 600).step_by(SPIKE_INTERVAL) {
        let jitter = rng.gen_range(0..500);
        for k in 0..30 {
            let i = start + jitter + k;
            samples[i] = samples[i].saturating_add(template(k) as i16);
        }
        planted += 1;
    }

    let source = out_dir.join("synthetic.i16");
    write_flat_file(&source, &samples)?;
    println!("Wrote {} samples with {} spikes to {}", NUM_SAMPLES, planted, source.display());

    let jobs = vec![Job::new(
        "synthetic",
        SourceSpec::flat(&source, DEFAULT_FLAT_SAMPLE_RATE),
        &out_dir,
    )];
    let reports = extract(&jobs, config)?;

    for report in &reports {
        match &report.error {
            Some(e) => println!("{}: failed: {}", report.name, e),
            None => println!(
                "{}: {}/{} blocks, {} positive, {} negative, {} anomalies",
                report.name,
                report.blocks_written,
                report.blocks_total,
                report.positive,
                report.negative,
                report.anomalies
            ),
        }
    }

    let contents = SpikeArchive::load(out_dir.join("synthetic"))?;
    println!(
        "Archive: {} negative waveforms of {} samples, {} threshold rows",
        contents.negative.len(),
        contents.manifest.snippet_len,
        contents.thresholds.nrows()
    );
    if let Some(first) = contents.negative.times.first() {
        println!("First negative spike at {:.4} s", first);
    }

    Ok(())
}
