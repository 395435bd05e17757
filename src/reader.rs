use byteorder::{LittleEndian, ReadBytesExt};
use log::{debug, info};
use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::types::*;

// Record layout constants (Neuralynx continuous sampled channel format)
pub const FILE_HEADER_SIZE: u64 = 16 * 1024;
pub const SAMPLES_PER_RECORD: usize = 512;
pub const RECORD_PREFIX_SIZE: u64 = 8 + 4 + 4 + 4;
pub const RECORD_SIZE: u64 = RECORD_PREFIX_SIZE + 2 * SAMPLES_PER_RECORD as u64;
const BYTES_PER_SAMPLE: u64 = 2;

// μV per volt
const VOLTS_TO_MICROVOLTS: f64 = 1e6;

/// Where one record sits in the channel's sample index space.
#[derive(Debug, Clone, Copy)]
struct RecordEntry {
    timestamp_us: u64,
    sample_offset: u64,
    valid: u32,
}

#[derive(Debug)]
enum Layout {
    Flat,
    Record { entries: Vec<RecordEntry> },
}

/// An open raw recording.
///
/// The file handle is held for the lifetime of the source and shared by all
/// workers processing the channel; reads take a lock on it, so seeks issued
/// for different blocks never interleave.
///
/// # Examples
///
/// ```no_run
/// use spike_extract::{RawChannelSource, SourceSpec};
///
/// let source = RawChannelSource::open(&SourceSpec::record("CSC1.ncs")).unwrap();
/// let buffer = source.read(0, 1024).unwrap();
/// println!("first sample at {:.6} s", buffer.times[0]);
/// ```
#[derive(Debug)]
pub struct RawChannelSource {
    path: PathBuf,
    sample_rate: f64,
    conversion_factor: f64,
    total_samples: u64,
    layout: Layout,
    handle: Mutex<BufReader<File>>,
}

impl RawChannelSource {
    /// Opens a raw recording and works out how many samples it holds.
    ///
    /// For record files every record header is visited once here, so later
    /// reads can locate records without touching the file.
    pub fn open(spec: &SourceSpec) -> Result<Self> {
        let path = spec.path.clone();
        let file = File::open(&path).map_err(|source| ExtractError::SourceOpen {
            path: path.clone(),
            source,
        })?;
        let file_size = file
            .metadata()
            .map_err(|source| ExtractError::SourceOpen {
                path: path.clone(),
                source,
            })?
            .len();
        let mut reader = BufReader::with_capacity(65536, file);

        let (sample_rate, conversion_factor, total_samples, layout) = match &spec.format {
            SourceFormat::Flat {
                sample_rate,
                conversion_factor,
            } => {
                if !(*sample_rate > 0.0) {
                    return Err(ExtractError::Config(format!(
                        "sample rate for {} must be positive, got {}",
                        path.display(),
                        sample_rate
                    )));
                }
                if file_size % BYTES_PER_SAMPLE != 0 {
                    return Err(ExtractError::FileSizeError {
                        path,
                        size: file_size,
                        record_size: BYTES_PER_SAMPLE,
                    });
                }
                (
                    *sample_rate,
                    *conversion_factor,
                    file_size / BYTES_PER_SAMPLE,
                    Layout::Flat,
                )
            }
            SourceFormat::Record => {
                let header = read_file_header(&mut reader, &path, file_size)?;
                let num_records = calculate_record_count(&path, file_size)?;
                let (entries, record_rate) = scan_records(&mut reader, &path, num_records)?;
                let sample_rate = header
                    .sampling_frequency
                    .or(record_rate)
                    .filter(|sr| *sr > 0.0)
                    .ok_or_else(|| ExtractError::UnrecognizedFileFormat {
                        path: path.clone(),
                        reason: "no sampling frequency in header or records".into(),
                    })?;
                let total = entries
                    .last()
                    .map(|e| e.sample_offset + e.valid as u64)
                    .unwrap_or(0);
                (
                    sample_rate,
                    header.ad_bit_volts * VOLTS_TO_MICROVOLTS,
                    total,
                    Layout::Record { entries },
                )
            }
        };

        print_record_time_summary(&path, total_samples, sample_rate);

        Ok(RawChannelSource {
            path,
            sample_rate,
            conversion_factor,
            total_samples,
            layout,
            handle: Mutex::new(reader),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Sample rate (Hz)
    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    /// Multiplier turning raw integer samples into μV
    pub fn conversion_factor(&self) -> f64 {
        self.conversion_factor
    }

    /// Number of samples in the channel, fixed at open time
    pub fn total_samples(&self) -> u64 {
        self.total_samples
    }

    /// Duration of the recording in seconds.
    pub fn duration(&self) -> f64 {
        self.total_samples as f64 / self.sample_rate
    }

    /// Reads samples `[start, stop)` together with their timestamps.
    pub fn read(&self, start: u64, stop: u64) -> Result<SampleBuffer> {
        if start >= stop || stop > self.total_samples {
            return Err(ExtractError::OutOfRange {
                start,
                stop,
                total: self.total_samples,
            });
        }

        let mut reader = self
            .handle
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "source handle lock poisoned"))?;

        match &self.layout {
            Layout::Flat => read_flat(&mut *reader, start, stop, self.sample_rate),
            Layout::Record { entries } => {
                read_records(&mut *reader, entries, start, stop, self.sample_rate)
            }
        }
    }

    /// Releases the file handle.
    pub fn close(self) {
        debug!("Closed {}", self.path.display());
    }
}

struct FileHeader {
    ad_bit_volts: f64,
    sampling_frequency: Option<f64>,
}

/// Reads the fixed-size text header of a record file.
///
/// The header is ASCII, padded with NULs, one `-Key value` pair per line.
fn read_file_header<R: Read + Seek>(reader: &mut R, path: &Path, file_size: u64) -> Result<FileHeader> {
    if file_size < FILE_HEADER_SIZE {
        return Err(ExtractError::UnrecognizedFileFormat {
            path: path.to_path_buf(),
            reason: format!("{} bytes is shorter than the file header", file_size),
        });
    }

    let mut raw = vec![0u8; FILE_HEADER_SIZE as usize];
    reader.seek(SeekFrom::Start(0))?;
    reader.read_exact(&mut raw)?;

    let text_len = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    let text = String::from_utf8_lossy(&raw[..text_len]);

    let mut ad_bit_volts = None;
    let mut sampling_frequency = None;
    for line in text.lines() {
        let mut fields = line.split_whitespace();
        match fields.next() {
            Some("-ADBitVolts") => ad_bit_volts = fields.next().and_then(|v| v.parse::<f64>().ok()),
            Some("-SamplingFrequency") => {
                sampling_frequency = fields.next().and_then(|v| v.parse::<f64>().ok())
            }
            _ => {}
        }
    }

    let ad_bit_volts = ad_bit_volts.ok_or_else(|| ExtractError::UnrecognizedFileFormat {
        path: path.to_path_buf(),
        reason: "header has no -ADBitVolts entry".into(),
    })?;

    Ok(FileHeader {
        ad_bit_volts,
        sampling_frequency,
    })
}

/// Number of records following the header; the body must hold whole records.
fn calculate_record_count(path: &Path, file_size: u64) -> Result<u64> {
    let bytes_remaining = file_size - FILE_HEADER_SIZE;

    if bytes_remaining % RECORD_SIZE != 0 {
        return Err(ExtractError::FileSizeError {
            path: path.to_path_buf(),
            size: bytes_remaining,
            record_size: RECORD_SIZE,
        });
    }

    Ok(bytes_remaining / RECORD_SIZE)
}

/// Visits every record header, building the record index.
///
/// Returns the index and the sample frequency stored in the first record.
fn scan_records<R: Read + Seek>(
    reader: &mut BufReader<R>,
    path: &Path,
    num_records: u64,
) -> Result<(Vec<RecordEntry>, Option<f64>)> {
    reader.seek(SeekFrom::Start(FILE_HEADER_SIZE))?;

    let mut entries = Vec::with_capacity(num_records as usize);
    let mut record_rate = None;
    let mut sample_offset = 0u64;
    let payload_size = (RECORD_SIZE - RECORD_PREFIX_SIZE) as i64;

    for i in 0..num_records {
        let timestamp_us = reader.read_u64::<LittleEndian>()?;
        let _channel_number = reader.read_u32::<LittleEndian>()?;
        let frequency = reader.read_u32::<LittleEndian>()?;
        let valid = reader.read_u32::<LittleEndian>()?;
        // skip the payload without discarding the read buffer
        reader.seek_relative(payload_size)?;

        if valid as usize > SAMPLES_PER_RECORD {
            return Err(ExtractError::UnrecognizedFileFormat {
                path: path.to_path_buf(),
                reason: format!("record {} claims {} valid samples", i, valid),
            });
        }
        if record_rate.is_none() {
            record_rate = Some(frequency as f64);
        }

        entries.push(RecordEntry {
            timestamp_us,
            sample_offset,
            valid,
        });
        sample_offset += valid as u64;
    }

    Ok((entries, record_rate))
}

fn print_record_time_summary(path: &Path, num_samples: u64, sample_rate: f64) {
    info!(
        "{} contains {:.3} seconds of data ({} samples at {:.2} kS/s)",
        path.display(),
        num_samples as f64 / sample_rate,
        num_samples,
        sample_rate / 1000.0
    );
}

fn read_flat<R: Read + Seek>(reader: &mut R, start: u64, stop: u64, sample_rate: f64) -> Result<SampleBuffer> {
    let num_samples = (stop - start) as usize;

    reader.seek(SeekFrom::Start(start * BYTES_PER_SAMPLE))?;
    let mut samples = vec![0i16; num_samples];
    reader.read_i16_into::<LittleEndian>(&mut samples)?;

    let times = (start..stop).map(|i| i as f64 / sample_rate).collect();

    Ok(SampleBuffer {
        start,
        samples,
        times,
        timestep_drift_us: None,
    })
}

/// Collects the payload of every record overlapping `[start, stop)`.
///
/// Timestamps are synthesized from the first record of the file and the
/// sample index, so they stay strictly increasing even when record headers
/// repeat or jump. Disagreement with the record headers is only reported
/// through `timestep_drift_us`.
fn read_records<R: Read + Seek>(
    reader: &mut R,
    entries: &[RecordEntry],
    start: u64,
    stop: u64,
    sample_rate: f64,
) -> Result<SampleBuffer> {
    let num_samples = (stop - start) as usize;
    let mut samples = Vec::with_capacity(num_samples);
    let mut times = Vec::with_capacity(num_samples);
    let mut payload = vec![0i16; SAMPLES_PER_RECORD];

    let origin = entries.first().map_or(0.0, |e| e.timestamp_us as f64 / 1e6);
    let first = entries.partition_point(|e| e.sample_offset + e.valid as u64 <= start);
    let mut touched: Option<(RecordEntry, RecordEntry)> = None;

    for (index, entry) in entries.iter().enumerate().skip(first) {
        if entry.sample_offset >= stop {
            break;
        }
        if entry.valid == 0 {
            continue;
        }

        let valid = entry.valid as usize;
        reader.seek(SeekFrom::Start(
            FILE_HEADER_SIZE + index as u64 * RECORD_SIZE + RECORD_PREFIX_SIZE,
        ))?;
        reader.read_i16_into::<LittleEndian>(&mut payload[..valid])?;

        let lo = (start.max(entry.sample_offset) - entry.sample_offset) as usize;
        let hi = (stop.min(entry.sample_offset + entry.valid as u64) - entry.sample_offset) as usize;
        samples.extend_from_slice(&payload[lo..hi]);
        times.extend((lo..hi).map(|k| origin + (entry.sample_offset + k as u64) as f64 / sample_rate));

        touched = match touched {
            None => Some((*entry, *entry)),
            Some((head, _)) => Some((head, *entry)),
        };
    }

    Ok(SampleBuffer {
        start,
        samples,
        times,
        timestep_drift_us: touched.and_then(|(head, tail)| timestep_drift(head, tail, sample_rate)),
    })
}

/// Record-implied minus synthesized elapsed time between two records (μs),
/// or `None` when they agree to within half a sample period.
fn timestep_drift(head: RecordEntry, tail: RecordEntry, sample_rate: f64) -> Option<f64> {
    let expected_us = (tail.sample_offset - head.sample_offset) as f64 / sample_rate * 1e6;
    let actual_us = tail.timestamp_us as f64 - head.timestamp_us as f64;
    let drift = actual_us - expected_us;

    if drift.abs() > 0.5e6 / sample_rate {
        Some(drift)
    } else {
        None
    }
}
