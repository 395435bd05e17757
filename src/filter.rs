use std::f64::consts::PI;

use crate::config::FilterConfig;
use crate::types::Result;

/// Second-order section in normalized form (a0 = 1).
///
/// y[n] = b0*x[n] + b1*x[n-1] + b2*x[n-2] - a1*y[n-1] - a2*y[n-2]
#[derive(Clone, Copy, Debug)]
struct Biquad {
    b0: f64,
    b1: f64,
    b2: f64,
    a1: f64,
    a2: f64,
}

impl Biquad {
    fn lowpass(sample_rate: f64, cutoff: f64, q: f64) -> Self {
        let omega = 2.0 * PI * cutoff / sample_rate;
        let cos_omega = omega.cos();
        let alpha = omega.sin() / (2.0 * q);

        let a0 = 1.0 + alpha;
        let b0 = (1.0 - cos_omega) / 2.0;
        Biquad {
            b0: b0 / a0,
            b1: (1.0 - cos_omega) / a0,
            b2: b0 / a0,
            a1: -2.0 * cos_omega / a0,
            a2: (1.0 - alpha) / a0,
        }
    }

    fn highpass(sample_rate: f64, cutoff: f64, q: f64) -> Self {
        let omega = 2.0 * PI * cutoff / sample_rate;
        let cos_omega = omega.cos();
        let alpha = omega.sin() / (2.0 * q);

        let a0 = 1.0 + alpha;
        let b0 = (1.0 + cos_omega) / 2.0;
        Biquad {
            b0: b0 / a0,
            b1: -(1.0 + cos_omega) / a0,
            b2: b0 / a0,
            a1: -2.0 * cos_omega / a0,
            a2: (1.0 - alpha) / a0,
        }
    }

    /// Filters `data` in place starting from rest.
    fn run(&self, data: &mut [f64]) {
        let (mut x1, mut x2, mut y1, mut y2) = (0.0, 0.0, 0.0, 0.0);
        for sample in data.iter_mut() {
            let x = *sample;
            let y = self.b0 * x + self.b1 * x1 + self.b2 * x2 - self.a1 * y1 - self.a2 * y2;
            x2 = x1;
            x1 = x;
            y2 = y1;
            y1 = y;
            *sample = y;
        }
    }
}

/// Q of section `k` of an `order`-pole Butterworth prototype.
fn butterworth_q(order: usize, k: usize) -> f64 {
    let theta = PI * (2 * k + 1) as f64 / (2 * order) as f64;
    1.0 / (2.0 * theta.cos())
}

/// Zero-phase Butterworth band-pass used to drive spike detection.
///
/// Each call filters one block forward and then backward, starting from
/// rest, so blocks can be filtered independently and in any order. The
/// ends are padded with an odd reflection of the block to damp start-up
/// transients.
#[derive(Debug, Clone)]
pub struct BandpassFilter {
    sections: Vec<Biquad>,
}

impl BandpassFilter {
    pub fn new(config: &FilterConfig, sample_rate: f64) -> Result<Self> {
        config.validate(sample_rate)?;
        if !config.enabled {
            return Ok(Self::passthrough());
        }

        let mut sections = Vec::with_capacity(config.order);
        for k in 0..config.order / 2 {
            let q = butterworth_q(config.order, k);
            sections.push(Biquad::highpass(sample_rate, config.low_cutoff, q));
            sections.push(Biquad::lowpass(sample_rate, config.high_cutoff, q));
        }
        Ok(BandpassFilter { sections })
    }

    /// A filter that returns its input unchanged.
    pub fn passthrough() -> Self {
        BandpassFilter { sections: Vec::new() }
    }

    pub fn is_passthrough(&self) -> bool {
        self.sections.is_empty()
    }

    /// Returns a filtered copy of `samples`, same length.
    pub fn apply(&self, samples: &[f32]) -> Vec<f32> {
        let n = samples.len();
        if self.is_passthrough() || n < 2 {
            return samples.to_vec();
        }

        let pad = (3 * (2 * self.sections.len() + 1)).min(n - 1);
        let first = samples[0] as f64;
        let last = samples[n - 1] as f64;

        let mut data = Vec::with_capacity(n + 2 * pad);
        data.extend((1..=pad).rev().map(|i| 2.0 * first - samples[i] as f64));
        data.extend(samples.iter().map(|&x| x as f64));
        data.extend((1..=pad).map(|i| 2.0 * last - samples[n - 1 - i] as f64));

        for section in &self.sections {
            section.run(&mut data);
        }
        data.reverse();
        for section in &self.sections {
            section.run(&mut data);
        }
        data.reverse();

        data[pad..pad + n].iter().map(|&y| y as f32).collect()
    }
}
