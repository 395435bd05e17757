use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::types::{ExtractError, Result};

/// Band-pass filter applied to each block before detection.
///
/// The filtered signal only drives noise estimation and crossing detection;
/// stored waveforms are always cut from the unfiltered signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// When false, detection runs on the unfiltered signal
    pub enabled: bool,
    /// Lower cutoff frequency (Hz)
    pub low_cutoff: f64,
    /// Upper cutoff frequency (Hz)
    pub high_cutoff: f64,
    /// Order of each of the high-pass and low-pass halves; must be even
    pub order: usize,
}

impl Default for FilterConfig {
    fn default() -> Self {
        FilterConfig {
            enabled: true,
            low_cutoff: 300.0,
            high_cutoff: 1000.0,
            order: 4,
        }
    }
}

impl FilterConfig {
    pub fn disabled() -> Self {
        FilterConfig {
            enabled: false,
            ..FilterConfig::default()
        }
    }

    /// Checks the cutoffs against a concrete sample rate.
    pub fn validate(&self, sample_rate: f64) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        if self.order == 0 || self.order % 2 != 0 {
            return Err(ExtractError::Config(format!(
                "filter order must be a positive even number, got {}",
                self.order
            )));
        }
        let nyquist = sample_rate / 2.0;
        if !(self.low_cutoff > 0.0 && self.low_cutoff < self.high_cutoff && self.high_cutoff < nyquist) {
            return Err(ExtractError::Config(format!(
                "filter band {}..{} Hz invalid for sample rate {} Hz",
                self.low_cutoff, self.high_cutoff, sample_rate
            )));
        }
        Ok(())
    }
}

/// Threshold detection and waveform excerpting parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    /// Thresholds sit at ± this multiple of the noise estimate
    pub threshold_factor: f64,
    /// Divisor turning the median absolute amplitude into a noise estimate
    /// (0.6745 makes it a standard deviation for Gaussian noise)
    pub noise_divisor: f64,
    /// Minimum gap, in samples, between accepted crossings of the same polarity
    pub refractory_samples: usize,
    /// Length of every stored waveform
    pub snippet_len: usize,
    /// Index of the crossing sample inside the waveform
    pub align_offset: usize,
    /// Extra samples read on each side of a block to absorb filter edge effects
    pub edge_padding: usize,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        DetectionConfig {
            threshold_factor: 5.0,
            noise_divisor: 0.6745,
            refractory_samples: 30,
            snippet_len: 64,
            align_offset: 19,
            edge_padding: 200,
        }
    }
}

impl DetectionConfig {
    pub fn validate(&self) -> Result<()> {
        if self.snippet_len == 0 {
            return Err(ExtractError::Config("snippet_len must be positive".into()));
        }
        if self.align_offset >= self.snippet_len {
            return Err(ExtractError::Config(format!(
                "align_offset {} must lie inside the {}-sample snippet",
                self.align_offset, self.snippet_len
            )));
        }
        if !(self.threshold_factor > 0.0) || !(self.noise_divisor > 0.0) {
            return Err(ExtractError::Config(
                "threshold_factor and noise_divisor must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Settings for one extraction run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractConfig {
    /// Size of the worker pool shared by every channel in the run
    pub workers: usize,
    /// Nominal block length in samples
    pub block_size: u64,
    /// Upper bound on dispatched-but-unwritten blocks per channel;
    /// 0 means four per worker
    pub max_blocks_in_flight: usize,
    pub filter: FilterConfig,
    pub detection: DetectionConfig,
}

impl Default for ExtractConfig {
    fn default() -> Self {
        ExtractConfig {
            workers: 8,
            block_size: 10_000,
            max_blocks_in_flight: 0,
            filter: FilterConfig::default(),
            detection: DetectionConfig::default(),
        }
    }
}

impl ExtractConfig {
    /// Loads a configuration from a JSON file; missing fields take their defaults.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = fs::read_to_string(path.as_ref())?;
        let config: ExtractConfig = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(ExtractError::Config("workers must be positive".into()));
        }
        if self.block_size < 2 {
            return Err(ExtractError::Config(format!(
                "block_size must be at least 2, got {}",
                self.block_size
            )));
        }
        self.detection.validate()
    }

    pub(crate) fn blocks_in_flight(&self) -> usize {
        if self.max_blocks_in_flight == 0 {
            self.workers * 4
        } else {
            self.max_blocks_in_flight
        }
    }
}
