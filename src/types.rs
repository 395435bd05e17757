use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Default sample rate assumed for flat `.i16` recordings (Hz).
pub const DEFAULT_FLAT_SAMPLE_RATE: f64 = 20000.0;

/// Intan amplifier scale factor (μV per bit), used for flat recordings
/// unless the job says otherwise.
pub const INTAN_AMPLIFIER_SCALE_FACTOR: f64 = 0.195;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ExtractError>;

fn default_flat_sample_rate() -> f64 {
    DEFAULT_FLAT_SAMPLE_RATE
}

fn default_conversion_factor() -> f64 {
    INTAN_AMPLIFIER_SCALE_FACTOR
}

/// On-disk layout of a raw recording.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceFormat {
    /// Back-to-back little-endian `i16` samples with no header.
    Flat {
        /// Sample rate of the recording (Hz)
        #[serde(default = "default_flat_sample_rate")]
        sample_rate: f64,
        /// Raw units to μV
        #[serde(default = "default_conversion_factor")]
        conversion_factor: f64,
    },
    /// Neuralynx-style file: text header followed by fixed-size records,
    /// each carrying its own start timestamp and valid-sample count.
    Record,
}

/// Identifies one raw recording and how to decode it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceSpec {
    /// Path of the raw file
    pub path: PathBuf,
    /// Layout of the raw file
    pub format: SourceFormat,
}

impl SourceSpec {
    /// A flat `i16` source at the given sample rate with the default Intan scaling.
    pub fn flat<P: Into<PathBuf>>(path: P, sample_rate: f64) -> Self {
        SourceSpec {
            path: path.into(),
            format: SourceFormat::Flat {
                sample_rate,
                conversion_factor: INTAN_AMPLIFIER_SCALE_FACTOR,
            },
        }
    }

    /// A record-oriented source; sample rate and scaling come from the file header.
    pub fn record<P: Into<PathBuf>>(path: P) -> Self {
        SourceSpec {
            path: path.into(),
            format: SourceFormat::Record,
        }
    }
}

/// One channel's worth of extraction work.
///
/// Built by whatever front end drives the pipeline. The reference source,
/// if any, is resolved from the re-referencing scheme before the job is
/// handed over.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Channel name; also the archive directory name
    pub name: String,
    /// Primary recording
    pub source: SourceSpec,
    /// Recording subtracted from the primary, sample by sample
    #[serde(default)]
    pub reference: Option<SourceSpec>,
    /// First sample to extract (defaults to 0)
    #[serde(default)]
    pub start: Option<u64>,
    /// One past the last sample to extract (defaults to, and is clamped to, the channel length)
    #[serde(default)]
    pub stop: Option<u64>,
    /// Root directory under which the channel archive is created
    pub destination: PathBuf,
}

impl Job {
    pub fn new<S: Into<String>, P: Into<PathBuf>>(name: S, source: SourceSpec, destination: P) -> Self {
        Job {
            name: name.into(),
            source,
            reference: None,
            start: None,
            stop: None,
            destination: destination.into(),
        }
    }

    pub fn with_reference(mut self, reference: SourceSpec) -> Self {
        self.reference = Some(reference);
        self
    }

    pub fn with_range(mut self, start: u64, stop: u64) -> Self {
        self.start = Some(start);
        self.stop = Some(stop);
        self
    }
}

/// A half-open range `[start, stop)` of sample indices dispatched as one unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Block {
    /// Position of the block within its channel, starting at 0
    pub seq: usize,
    /// First sample index
    pub start: u64,
    /// One past the last sample index
    pub stop: u64,
}

impl Block {
    pub fn len(&self) -> u64 {
        self.stop - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.stop <= self.start
    }
}

/// Raw samples and their timestamps for one contiguous range of a source.
#[derive(Debug, Clone)]
pub struct SampleBuffer {
    /// Sample index of the first element
    pub start: u64,
    /// Raw integer samples
    pub samples: Vec<i16>,
    /// Timestamp of every sample (seconds)
    pub times: Vec<f64>,
    /// Record-implied minus synthesized elapsed time (μs), when they disagree
    pub timestep_drift_us: Option<f64>,
}

impl SampleBuffer {
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Samples converted to physical units (μV), after optional re-referencing.
#[derive(Debug, Clone)]
pub struct SignalBuffer {
    /// Sample index of the first element
    pub start: u64,
    /// Amplitudes (μV)
    pub values: Vec<f32>,
    /// Timestamp of every sample (seconds)
    pub times: Vec<f64>,
    /// Carried over from the primary source's read
    pub timestep_drift_us: Option<f64>,
}

impl SignalBuffer {
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Direction of a threshold crossing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Polarity {
    Positive,
    Negative,
}

impl Polarity {
    /// Both polarities, in archive order.
    pub const BOTH: [Polarity; 2] = [Polarity::Positive, Polarity::Negative];

    /// +1 for positive, -1 for negative; multiplying a sample by this makes
    /// the polarity's direction positive.
    pub fn sign(self) -> f64 {
        match self {
            Polarity::Positive => 1.0,
            Polarity::Negative => -1.0,
        }
    }
}

/// Waveforms of one polarity detected in a block.
///
/// Row `i` of `waveforms` was excerpted around the event at `times[i]`.
#[derive(Debug, Clone, PartialEq)]
pub struct SpikeSet {
    /// Raw snippets (μV)
    /// - Shape: [num_spikes, snippet_len]
    pub waveforms: Array2<f32>,
    /// Event timestamps (seconds)
    pub times: Array1<f64>,
}

impl SpikeSet {
    pub fn empty(snippet_len: usize) -> Self {
        SpikeSet {
            waveforms: Array2::zeros((0, snippet_len)),
            times: Array1::zeros(0),
        }
    }

    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }
}

/// Noise estimate and the detection thresholds derived from it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
    pub noise: f64,
    pub positive: f64,
    pub negative: f64,
}

impl Thresholds {
    /// Row layout used by the archive: noise, positive, negative.
    pub fn as_row(&self) -> [f64; 3] {
        [self.noise, self.positive, self.negative]
    }
}

/// Non-fatal irregularity noticed while processing a block.
#[derive(Debug, Clone, PartialEq)]
pub enum Anomaly {
    /// Record timestamps disagree with the nominal sample rate
    TimestepMismatch { drift_us: f64 },
    /// Noise estimate was zero or not finite; detection skipped
    DegenerateNoise { noise: f64 },
}

impl fmt::Display for Anomaly {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Anomaly::TimestepMismatch { drift_us } => {
                write!(f, "timestep mismatch of {:.1} ms", drift_us / 1e3)
            }
            Anomaly::DegenerateNoise { noise } => {
                write!(f, "degenerate noise estimate ({}), detection skipped", noise)
            }
        }
    }
}

/// Everything extracted from one block.
#[derive(Debug, Clone)]
pub struct BlockResult {
    /// Sequence number of the originating block
    pub seq: usize,
    /// First sample index of the block
    pub start: u64,
    /// One past the last sample index of the block
    pub stop: u64,
    /// Upward crossings of the positive threshold
    pub positive: SpikeSet,
    /// Downward crossings of the negative threshold
    pub negative: SpikeSet,
    /// Always present, even for silent blocks
    pub thresholds: Thresholds,
    /// Irregularities to report; none of them stop processing
    pub anomalies: Vec<Anomaly>,
}

impl BlockResult {
    pub fn spikes(&self, polarity: Polarity) -> &SpikeSet {
        match polarity {
            Polarity::Positive => &self.positive,
            Polarity::Negative => &self.negative,
        }
    }
}

/// Outcome of one channel job.
#[derive(Debug)]
pub struct ChannelReport {
    /// Channel name from the job
    pub name: String,
    /// Number of blocks the channel was partitioned into
    pub blocks_total: usize,
    /// Number of blocks appended to the archive
    pub blocks_written: usize,
    /// Positive waveforms appended
    pub positive: usize,
    /// Negative waveforms appended
    pub negative: usize,
    /// Non-fatal anomalies seen across all blocks
    pub anomalies: usize,
    /// Set when the channel stopped early
    pub error: Option<ExtractError>,
}

impl ChannelReport {
    pub(crate) fn new(name: &str, blocks_total: usize) -> Self {
        ChannelReport {
            name: name.to_string(),
            blocks_total,
            blocks_written: 0,
            positive: 0,
            negative: 0,
            anomalies: 0,
            error: None,
        }
    }

    /// True when every block was extracted and written.
    pub fn is_complete(&self) -> bool {
        self.error.is_none() && self.blocks_written == self.blocks_total
    }
}

/// Errors raised by the extraction pipeline.
#[derive(Debug, Error)]
pub enum ExtractError {
    /// The raw file could not be opened
    #[error("cannot open source {path}: {source}")]
    SourceOpen {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    /// The file header was not understood
    #[error("unrecognized file format in {path}: {reason}")]
    UnrecognizedFileFormat { path: PathBuf, reason: String },
    /// The file body is not a whole number of records
    #[error("file size error in {path}: {size} data bytes is not a multiple of the {record_size}-byte record")]
    FileSizeError {
        path: PathBuf,
        size: u64,
        record_size: u64,
    },
    /// The requested range lies outside the channel
    #[error("requested samples {start}..{stop} outside channel of {total} samples")]
    OutOfRange { start: u64, stop: u64, total: u64 },
    /// Record timestamps disagree with the sample rate; reported, never fatal
    #[error("timestep mismatch in {path} between samples {start} and {stop}: {drift_us:.1} μs")]
    TimestepMismatch {
        path: PathBuf,
        start: u64,
        stop: u64,
        drift_us: f64,
    },
    /// Writing the spike archive failed
    #[error("archive error at {path}: {source}")]
    Store {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    /// A worker disappeared without reporting its block
    #[error("worker for channel {channel} exited without a result")]
    WorkerLost { channel: String },
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("thread pool error: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
