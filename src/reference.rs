use std::sync::Arc;

use crate::reader::RawChannelSource;
use crate::types::*;

/// Produces physical-unit samples for a channel, optionally re-referenced.
///
/// With a reference source every sample becomes
/// `primary[i] * primary.conversion - reference[i] * reference.conversion`.
/// Both sources are always read with the same bounds, so the returned
/// timestamps are the primary's.
#[derive(Debug, Clone)]
pub struct ReferenceCombiner {
    primary: Arc<RawChannelSource>,
    reference: Option<Arc<RawChannelSource>>,
}

impl ReferenceCombiner {
    pub fn new(primary: Arc<RawChannelSource>, reference: Option<Arc<RawChannelSource>>) -> Self {
        ReferenceCombiner { primary, reference }
    }

    pub fn primary(&self) -> &RawChannelSource {
        &self.primary
    }

    pub fn sample_rate(&self) -> f64 {
        self.primary.sample_rate()
    }

    /// Samples available in both sources.
    pub fn total_samples(&self) -> u64 {
        match &self.reference {
            Some(reference) => self.primary.total_samples().min(reference.total_samples()),
            None => self.primary.total_samples(),
        }
    }

    pub fn combine(&self, start: u64, stop: u64) -> Result<SignalBuffer> {
        let primary = self.primary.read(start, stop)?;
        let scale = self.primary.conversion_factor();
        let mut values: Vec<f32> = primary
            .samples
            .iter()
            .map(|&x| (x as f64 * scale) as f32)
            .collect();

        if let Some(reference) = &self.reference {
            let reference_data = reference.read(start, stop)?;
            let reference_scale = reference.conversion_factor();
            for (value, &r) in values.iter_mut().zip(reference_data.samples.iter()) {
                *value -= (r as f64 * reference_scale) as f32;
            }
        }

        Ok(SignalBuffer {
            start,
            values,
            times: primary.times,
            timestep_drift_us: primary.timestep_drift_us,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writer::write_flat_file;
    use tempfile::TempDir;

    fn open_flat(dir: &TempDir, name: &str, samples: &[i16], conversion_factor: f64) -> Arc<RawChannelSource> {
        let path = dir.path().join(name);
        write_flat_file(&path, samples).unwrap();
        let spec = SourceSpec {
            path,
            format: SourceFormat::Flat {
                sample_rate: 1000.0,
                conversion_factor,
            },
        };
        Arc::new(RawChannelSource::open(&spec).unwrap())
    }

    #[test]
    fn test_without_reference_converts_units() {
        let dir = TempDir::new().unwrap();
        let primary = open_flat(&dir, "a.i16", &[10, -20, 30], 0.5);
        let combiner = ReferenceCombiner::new(primary, None);

        let buffer = combiner.combine(0, 3).unwrap();
        assert_eq!(buffer.values, vec![5.0, -10.0, 15.0]);
        assert_eq!(buffer.times, vec![0.0, 0.001, 0.002]);
    }

    #[test]
    fn test_subtracts_scaled_reference() {
        let dir = TempDir::new().unwrap();
        let primary = open_flat(&dir, "a.i16", &[10, 20, 30, 40], 1.0);
        let reference = open_flat(&dir, "ref.i16", &[1, 2, 3, 4], 2.0);
        let combiner = ReferenceCombiner::new(primary, Some(reference));

        let buffer = combiner.combine(1, 4).unwrap();
        assert_eq!(buffer.values, vec![16.0, 24.0, 32.0]);
        assert_eq!(buffer.start, 1);
    }

    #[test]
    fn test_shorter_reference_limits_range() {
        let dir = TempDir::new().unwrap();
        let primary = open_flat(&dir, "a.i16", &[1; 10], 1.0);
        let reference = open_flat(&dir, "ref.i16", &[1; 6], 1.0);
        let combiner = ReferenceCombiner::new(primary, Some(reference));

        assert_eq!(combiner.total_samples(), 6);
        assert!(matches!(
            combiner.combine(0, 8),
            Err(ExtractError::OutOfRange { total: 6, .. })
        ));
    }
}
