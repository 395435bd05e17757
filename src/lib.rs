//! Block-parallel spike waveform extraction from raw extracellular recordings.
//!
//! Each channel is split into fixed-size blocks. Worker threads read a block
//! plus a small margin, optionally subtract a reference channel, band-pass
//! filter it, detect threshold crossings and cut waveform snippets. Results
//! are appended to a per-channel archive strictly in block order.

pub mod config;
pub mod detector;
pub mod filter;
pub mod reader;
pub mod reference;
pub mod scheduler;
pub mod store;
pub mod types;
pub mod writer;

// Re-export types
pub use config::{DetectionConfig, ExtractConfig, FilterConfig};
pub use reader::RawChannelSource;
pub use scheduler::{partition, Extractor};
pub use store::{ArchiveContents, Manifest, SpikeArchive};
pub use types::*;

/// Extracts spikes for every job and returns one report per job
///
/// # Examples
///
/// ```no_run
/// use spike_extract::{extract, ExtractConfig, Job, SourceSpec};
///
/// let jobs = vec![
///     Job::new("CSC1", SourceSpec::record("CSC1.ncs"), "spikes")
///         .with_reference(SourceSpec::record("CSC4.ncs")),
/// ];
/// match extract(&jobs, ExtractConfig::default()) {
///     Ok(reports) => {
///         for report in reports {
///             println!("{}: {} positive, {} negative", report.name, report.positive, report.negative);
///         }
///     }
///     Err(e) => println!("Extraction failed: {}", e),
/// }
/// ```
pub fn extract(jobs: &[Job], config: ExtractConfig) -> Result<Vec<ChannelReport>> {
    Extractor::new(config)?.run(jobs)
}
