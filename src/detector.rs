use ndarray::{Array1, Array2};

use crate::config::DetectionConfig;
use crate::types::*;

/// A threshold crossing in the filtered signal.
#[derive(Debug, Clone, Copy)]
struct Crossing {
    index: usize,
    polarity: Polarity,
    /// Largest filtered excursion in the crossing's direction within one
    /// refractory window
    peak: f64,
}

/// Threshold detector turning one filtered block into polarity-separated waveforms.
///
/// Thresholds are `±threshold_factor * noise`, with the noise level taken as
/// the median absolute filtered amplitude over the block divided by
/// `noise_divisor`. A crossing is the first sample beyond a threshold after
/// a sample that was not; after an accepted crossing, the same polarity is
/// ignored for `refractory_samples` samples.
///
/// The band-pass filter turns a single deflection into a main lobe flanked
/// by smaller lobes of the opposite sign. Crossings of either polarity that
/// follow each other within `refractory_samples` are therefore treated as
/// one event, and only the crossing with the largest filtered excursion is
/// kept.
///
/// Each event is then located in the unfiltered signal: its time is the
/// first sample, from the crossing onwards, that reaches half of the raw
/// deflection. Waveforms are cut from the unfiltered signal so that this
/// sample lands at `align_offset`. The caller supplies the block padded by
/// [`margin`](SpikeDetector::margin) samples on both sides, which is enough
/// for every snippet to be complete except at the very ends of a channel,
/// where the first or last available sample is repeated.
#[derive(Debug, Clone)]
pub struct SpikeDetector {
    config: DetectionConfig,
}

impl SpikeDetector {
    pub fn new(config: DetectionConfig) -> Self {
        SpikeDetector { config }
    }

    pub fn config(&self) -> &DetectionConfig {
        &self.config
    }

    /// Samples needed on each side of a block.
    pub fn margin(&self) -> u64 {
        let before = self.config.align_offset;
        let after = self.config.snippet_len - self.config.align_offset;
        (before.max(after) + self.config.edge_padding) as u64
    }

    pub fn estimate_thresholds(&self, filtered: &[f32]) -> Thresholds {
        let noise = median_abs(filtered) / self.config.noise_divisor;
        let threshold = self.config.threshold_factor * noise;
        Thresholds {
            noise,
            positive: threshold,
            negative: -threshold,
        }
    }

    /// Runs detection on `block`.
    ///
    /// `signal` and `filtered` cover the same (padded) range, which must
    /// contain the block.
    pub fn detect(&self, block: &Block, signal: &SignalBuffer, filtered: &[f32]) -> BlockResult {
        let len = filtered.len().min(signal.len());
        let core_lo = (block.start.saturating_sub(signal.start) as usize).min(len);
        let core_hi = (core_lo + block.len() as usize).min(len);

        let thresholds = self.estimate_thresholds(&filtered[core_lo..core_hi]);
        let mut anomalies = Vec::new();

        let (positive, negative) = if thresholds.noise > 0.0 && thresholds.noise.is_finite() {
            let values = &signal.values[..len];
            let events = strongest_per_event(
                self.find_crossings(&filtered[..len], core_lo, core_hi, &thresholds),
                self.config.refractory_samples,
            );

            let mut positive_idx = Vec::new();
            let mut negative_idx = Vec::new();
            for event in &events {
                let onset = raw_onset(values, event, self.config.refractory_samples, core_hi);
                match event.polarity {
                    Polarity::Positive => positive_idx.push(onset),
                    Polarity::Negative => negative_idx.push(onset),
                }
            }

            (
                self.excerpt(values, &signal.times, &positive_idx),
                self.excerpt(values, &signal.times, &negative_idx),
            )
        } else {
            anomalies.push(Anomaly::DegenerateNoise {
                noise: thresholds.noise,
            });
            (
                SpikeSet::empty(self.config.snippet_len),
                SpikeSet::empty(self.config.snippet_len),
            )
        };

        BlockResult {
            seq: block.seq,
            start: block.start,
            stop: block.stop,
            positive,
            negative,
            thresholds,
            anomalies,
        }
    }

    /// Crossings of both polarities in `lo..hi`, in sample order.
    fn find_crossings(&self, filtered: &[f32], lo: usize, hi: usize, thresholds: &Thresholds) -> Vec<Crossing> {
        let refractory = self.config.refractory_samples;
        let mut crossings = Vec::new();
        let mut last_positive: Option<usize> = None;
        let mut last_negative: Option<usize> = None;

        for i in lo..hi {
            let x = filtered[i] as f64;
            let prev = if i > 0 { filtered[i - 1] as f64 } else { 0.0 };

            if x > thresholds.positive
                && prev <= thresholds.positive
                && last_positive.map_or(true, |last| i - last >= refractory)
            {
                crossings.push(crossing(filtered, i, Polarity::Positive, refractory));
                last_positive = Some(i);
            }

            if x < thresholds.negative
                && prev >= thresholds.negative
                && last_negative.map_or(true, |last| i - last >= refractory)
            {
                crossings.push(crossing(filtered, i, Polarity::Negative, refractory));
                last_negative = Some(i);
            }
        }

        crossings
    }

    fn excerpt(&self, values: &[f32], times: &[f64], indices: &[usize]) -> SpikeSet {
        let snippet_len = self.config.snippet_len;
        let offset = self.config.align_offset;
        if indices.is_empty() || values.is_empty() {
            return SpikeSet::empty(snippet_len);
        }

        let last = values.len() - 1;
        let mut waveforms = Array2::<f32>::zeros((indices.len(), snippet_len));
        for (row, &i) in indices.iter().enumerate() {
            for k in 0..snippet_len {
                let j = (i + k).saturating_sub(offset).min(last);
                waveforms[[row, k]] = values[j];
            }
        }

        SpikeSet {
            waveforms,
            times: indices.iter().map(|&i| times[i]).collect::<Array1<f64>>(),
        }
    }
}

fn crossing(filtered: &[f32], index: usize, polarity: Polarity, window: usize) -> Crossing {
    let end = (index + window.max(1)).min(filtered.len());
    let sign = polarity.sign();
    let peak = filtered[index..end]
        .iter()
        .map(|&x| sign * x as f64)
        .fold(f64::MIN, f64::max);
    Crossing { index, polarity, peak }
}

/// Collapses chains of crossings closer than `refractory` samples into the
/// strongest crossing of each chain.
fn strongest_per_event(crossings: Vec<Crossing>, refractory: usize) -> Vec<Crossing> {
    let mut events: Vec<Crossing> = Vec::new();
    let mut last_index: Option<usize> = None;

    for crossing in crossings {
        let same_event = last_index.map_or(false, |last| crossing.index - last < refractory);
        last_index = Some(crossing.index);

        match events.last_mut() {
            Some(strongest) if same_event => {
                if crossing.peak > strongest.peak {
                    *strongest = crossing;
                }
            }
            _ => events.push(crossing),
        }
    }

    events
}

/// First raw sample in `[crossing, min(crossing + window, limit))` reaching
/// half of the raw deflection, measured from the sample before the crossing.
///
/// Keeping the result below `limit` (the end of the block) keeps event times
/// ordered across blocks.
fn raw_onset(values: &[f32], crossing: &Crossing, window: usize, limit: usize) -> usize {
    let i = crossing.index;
    let end = (i + window).min(limit).max(i + 1);
    let sign = crossing.polarity.sign();

    let base = sign * values[i.saturating_sub(1)] as f64;
    let peak = values[i..end]
        .iter()
        .map(|&x| sign * x as f64)
        .fold(f64::MIN, f64::max);
    let level = base + (peak - base) / 2.0;

    (i..end)
        .find(|&j| sign * values[j] as f64 >= level)
        .unwrap_or(i)
}

/// Median of absolute values; 0 for an empty slice.
fn median_abs(data: &[f32]) -> f64 {
    if data.is_empty() {
        return 0.0;
    }

    let mut magnitudes: Vec<f32> = data.iter().map(|x| x.abs()).collect();
    let mid = magnitudes.len() / 2;
    let (lower, upper, _) = magnitudes.select_nth_unstable_by(mid, f32::total_cmp);
    let upper = *upper as f64;

    if data.len() % 2 == 1 {
        upper
    } else {
        let below = lower.iter().fold(f32::MIN, |m, &x| m.max(x)) as f64;
        (below + upper) / 2.0
    }
}
