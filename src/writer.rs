//! Writers for the two raw layouts understood by [`RawChannelSource`](crate::RawChannelSource).
//!
//! Used to produce synthetic recordings for testing detection settings and
//! for benchmarks.

use byteorder::{LittleEndian, WriteBytesExt};
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

use crate::reader::{FILE_HEADER_SIZE, SAMPLES_PER_RECORD};

/// Writes samples as a headerless little-endian `i16` stream.
pub fn write_flat_file<P: AsRef<Path>>(path: P, samples: &[i16]) -> io::Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    for &sample in samples {
        writer.write_i16::<LittleEndian>(sample)?;
    }
    writer.flush()
}

/// Writes a record file with gap-free timestamps starting at zero,
/// splitting `samples` into full records (the last one may be partial).
pub fn write_record_file<P: AsRef<Path>>(
    path: P,
    samples: &[i16],
    sample_rate: f64,
    ad_bit_volts: f64,
) -> io::Result<()> {
    let mut writer = RecordFileWriter::create(path, sample_rate, ad_bit_volts)?;
    for (i, chunk) in samples.chunks(SAMPLES_PER_RECORD).enumerate() {
        let offset = (i * SAMPLES_PER_RECORD) as f64;
        let timestamp_us = (offset / sample_rate * 1e6).round() as u64;
        writer.write_record(timestamp_us, chunk)?;
    }
    writer.finish()
}

/// Incremental writer for record files, for callers that need control over
/// record timestamps (e.g. to simulate dropped records).
pub struct RecordFileWriter {
    writer: BufWriter<File>,
    sample_rate: f64,
    channel_number: u32,
}

impl RecordFileWriter {
    /// Creates the file and writes its text header.
    pub fn create<P: AsRef<Path>>(path: P, sample_rate: f64, ad_bit_volts: f64) -> io::Result<Self> {
        let mut writer = BufWriter::new(File::create(path)?);

        let mut header = Vec::with_capacity(FILE_HEADER_SIZE as usize);
        writeln!(header, "######## Neuralynx Data File Header")?;
        writeln!(header, "-FileType CSC")?;
        writeln!(header, "-RecordSize {}", crate::reader::RECORD_SIZE)?;
        writeln!(header, "-SamplingFrequency {}", sample_rate)?;
        writeln!(header, "-ADBitVolts {:e}", ad_bit_volts)?;
        if header.len() > FILE_HEADER_SIZE as usize {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "header text too long"));
        }
        header.resize(FILE_HEADER_SIZE as usize, 0);
        writer.write_all(&header)?;

        Ok(RecordFileWriter {
            writer,
            sample_rate,
            channel_number: 0,
        })
    }

    /// Appends one record holding up to 512 samples; unused slots are zeroed.
    pub fn write_record(&mut self, timestamp_us: u64, samples: &[i16]) -> io::Result<()> {
        if samples.len() > SAMPLES_PER_RECORD {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} samples do not fit in one record", samples.len()),
            ));
        }

        self.writer.write_u64::<LittleEndian>(timestamp_us)?;
        self.writer.write_u32::<LittleEndian>(self.channel_number)?;
        self.writer.write_u32::<LittleEndian>(self.sample_rate.round() as u32)?;
        self.writer.write_u32::<LittleEndian>(samples.len() as u32)?;
        for i in 0..SAMPLES_PER_RECORD {
            self.writer
                .write_i16::<LittleEndian>(samples.get(i).copied().unwrap_or(0))?;
        }
        Ok(())
    }

    pub fn finish(mut self) -> io::Result<()> {
        self.writer.flush()
    }
}
