//! Append-only per-channel spike archive.
//!
//! ## Layout
//! ```text
//! <destination>/<channel>/
//! ├── pos_spikes.f32     positive waveforms, row-major [n, snippet_len]
//! ├── pos_times.f64      positive crossing times (s)
//! ├── neg_spikes.f32     negative waveforms
//! ├── neg_times.f64      negative crossing times (s)
//! ├── thresholds.f64     one row per block: noise, positive, negative
//! └── manifest.json      snippet length, row counts, completion flag
//! ```
//! All arrays are little-endian and grow by appending whole rows.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use log::{debug, warn};
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::types::*;

const POS_SPIKES_FILE: &str = "pos_spikes.f32";
const POS_TIMES_FILE: &str = "pos_times.f64";
const NEG_SPIKES_FILE: &str = "neg_spikes.f32";
const NEG_TIMES_FILE: &str = "neg_times.f64";
const THRESHOLDS_FILE: &str = "thresholds.f64";
const MANIFEST_FILE: &str = "manifest.json";

/// Columns of the threshold array.
pub const THRESHOLD_COLUMNS: usize = 3;

/// Shape information stored next to the arrays.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub channel: String,
    pub snippet_len: usize,
    pub positive: u64,
    pub negative: u64,
    pub blocks: u64,
    /// False when extraction stopped before the last block
    pub complete: bool,
}

/// Everything read back from an archive directory.
#[derive(Debug, Clone)]
pub struct ArchiveContents {
    pub manifest: Manifest,
    pub positive: SpikeSet,
    pub negative: SpikeSet,
    /// - Shape: [num_blocks, 3]
    pub thresholds: Array2<f64>,
}

/// Writable archive for one channel.
///
/// Results must be appended in block order; the archive does not check.
/// Dropping an archive without closing it flushes what was written and
/// marks it incomplete.
pub struct SpikeArchive {
    dir: PathBuf,
    manifest: Manifest,
    pos_spikes: BufWriter<File>,
    pos_times: BufWriter<File>,
    neg_spikes: BufWriter<File>,
    neg_times: BufWriter<File>,
    thresholds: BufWriter<File>,
    closed: bool,
}

impl SpikeArchive {
    /// Creates `<destination>/<channel_name>/`, replacing any arrays already there.
    pub fn open<P: AsRef<Path>>(channel_name: &str, destination: P, snippet_len: usize) -> Result<Self> {
        let dir = destination.as_ref().join(channel_name);
        fs::create_dir_all(&dir).map_err(|source| ExtractError::Store {
            path: dir.clone(),
            source,
        })?;

        let create = |name: &str| -> Result<BufWriter<File>> {
            let path = dir.join(name);
            File::create(&path)
                .map(BufWriter::new)
                .map_err(|source| ExtractError::Store { path, source })
        };
        let pos_spikes = create(POS_SPIKES_FILE)?;
        let pos_times = create(POS_TIMES_FILE)?;
        let neg_spikes = create(NEG_SPIKES_FILE)?;
        let neg_times = create(NEG_TIMES_FILE)?;
        let thresholds = create(THRESHOLDS_FILE)?;

        let mut archive = SpikeArchive {
            dir,
            manifest: Manifest {
                channel: channel_name.to_string(),
                snippet_len,
                positive: 0,
                negative: 0,
                blocks: 0,
                complete: false,
            },
            pos_spikes,
            pos_times,
            neg_spikes,
            neg_times,
            thresholds,
            closed: false,
        };
        archive.write_manifest()?;

        debug!("Initialized archive {}", archive.dir.display());
        Ok(archive)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    /// Appends one block's spikes and thresholds, then flushes.
    pub fn append(&mut self, result: &BlockResult) -> Result<()> {
        self.append_rows(result).map_err(|source| ExtractError::Store {
            path: self.dir.clone(),
            source,
        })?;

        self.manifest.positive += result.positive.len() as u64;
        self.manifest.negative += result.negative.len() as u64;
        self.manifest.blocks += 1;
        Ok(())
    }

    fn append_rows(&mut self, result: &BlockResult) -> io::Result<()> {
        for polarity in Polarity::BOTH {
            let spikes = result.spikes(polarity);
            if spikes.is_empty() {
                continue;
            }
            let (waveforms, times) = match polarity {
                Polarity::Positive => (&mut self.pos_spikes, &mut self.pos_times),
                Polarity::Negative => (&mut self.neg_spikes, &mut self.neg_times),
            };
            write_spike_set(waveforms, times, spikes)?;
        }
        for value in result.thresholds.as_row() {
            self.thresholds.write_f64::<LittleEndian>(value)?;
        }
        self.flush_arrays()
    }

    /// Flushes everything and marks the archive complete.
    pub fn close(mut self) -> Result<Manifest> {
        self.finish(true)?;
        Ok(self.manifest.clone())
    }

    /// Flushes everything but leaves the archive marked incomplete.
    pub fn close_partial(mut self) -> Result<Manifest> {
        self.finish(false)?;
        Ok(self.manifest.clone())
    }

    fn finish(&mut self, complete: bool) -> Result<()> {
        self.closed = true;
        self.flush_arrays().map_err(|source| ExtractError::Store {
            path: self.dir.clone(),
            source,
        })?;
        self.manifest.complete = complete;
        self.write_manifest()
    }

    fn flush_arrays(&mut self) -> io::Result<()> {
        self.pos_spikes.flush()?;
        self.pos_times.flush()?;
        self.neg_spikes.flush()?;
        self.neg_times.flush()?;
        self.thresholds.flush()
    }

    fn write_manifest(&mut self) -> Result<()> {
        let path = self.dir.join(MANIFEST_FILE);
        let text = serde_json::to_string_pretty(&self.manifest)?;
        fs::write(&path, text).map_err(|source| ExtractError::Store { path, source })
    }

    /// Reads an archive directory back into memory.
    ///
    /// Row counts come from the array files themselves, so an archive left
    /// behind by an interrupted run is still readable.
    pub fn load<P: AsRef<Path>>(dir: P) -> Result<ArchiveContents> {
        let dir = dir.as_ref();
        let manifest: Manifest = serde_json::from_str(&fs::read_to_string(dir.join(MANIFEST_FILE))?)?;
        let snippet_len = manifest.snippet_len;

        let positive = SpikeSet {
            waveforms: read_rows_f32(&dir.join(POS_SPIKES_FILE), snippet_len)?,
            times: Array1::from(read_f64(&dir.join(POS_TIMES_FILE))?),
        };
        let negative = SpikeSet {
            waveforms: read_rows_f32(&dir.join(NEG_SPIKES_FILE), snippet_len)?,
            times: Array1::from(read_f64(&dir.join(NEG_TIMES_FILE))?),
        };

        let path = dir.join(THRESHOLDS_FILE);
        let mut values = read_f64(&path)?;
        let rows = values.len() / THRESHOLD_COLUMNS;
        values.truncate(rows * THRESHOLD_COLUMNS);
        let thresholds = Array2::from_shape_vec((rows, THRESHOLD_COLUMNS), values)
            .map_err(|e| shape_error(&path, e))?;

        if manifest.positive != positive.len() as u64 || manifest.negative != negative.len() as u64 {
            warn!(
                "Archive {} manifest lists {}/{} spikes but arrays hold {}/{}",
                dir.display(),
                manifest.positive,
                manifest.negative,
                positive.len(),
                negative.len()
            );
        }

        Ok(ArchiveContents {
            manifest,
            positive,
            negative,
            thresholds,
        })
    }
}

impl Drop for SpikeArchive {
    fn drop(&mut self) {
        if !self.closed {
            if let Err(e) = self.finish(false) {
                warn!("Failed to finalize archive {}: {}", self.dir.display(), e);
            }
        }
    }
}

fn write_spike_set<W: Write>(spikes: &mut W, times: &mut W, set: &SpikeSet) -> io::Result<()> {
    for &value in set.waveforms.iter() {
        spikes.write_f32::<LittleEndian>(value)?;
    }
    for &time in set.times.iter() {
        times.write_f64::<LittleEndian>(time)?;
    }
    Ok(())
}

fn read_f64(path: &Path) -> Result<Vec<f64>> {
    let len = fs::metadata(path)?.len() as usize / 8;
    let mut reader = BufReader::new(File::open(path)?);
    let mut values = vec![0.0f64; len];
    reader.read_f64_into::<LittleEndian>(&mut values)?;
    Ok(values)
}

fn read_rows_f32(path: &Path, columns: usize) -> Result<Array2<f32>> {
    let len = fs::metadata(path)?.len() as usize / 4;
    let mut reader = BufReader::new(File::open(path)?);
    let mut values = vec![0.0f32; len];
    reader.read_f32_into::<LittleEndian>(&mut values)?;

    let rows = if columns == 0 { 0 } else { len / columns };
    values.truncate(rows * columns);
    Array2::from_shape_vec((rows, columns), values).map_err(|e| shape_error(path, e))
}

fn shape_error(path: &Path, error: ndarray::ShapeError) -> ExtractError {
    ExtractError::Store {
        path: path.to_path_buf(),
        source: io::Error::new(io::ErrorKind::InvalidData, error.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use tempfile::TempDir;

    fn result(seq: usize, positive: SpikeSet, negative: SpikeSet) -> BlockResult {
        BlockResult {
            seq,
            start: seq as u64 * 100,
            stop: (seq as u64 + 1) * 100,
            positive,
            negative,
            thresholds: Thresholds {
                noise: seq as f64,
                positive: 5.0,
                negative: -5.0,
            },
            anomalies: Vec::new(),
        }
    }

    #[test]
    fn test_append_and_load() {
        let dir = TempDir::new().unwrap();
        let mut archive = SpikeArchive::open("CSC1", dir.path(), 2).unwrap();

        let positive = SpikeSet {
            waveforms: array![[1.0, 2.0], [3.0, 4.0]],
            times: array![0.1, 0.2],
        };
        archive.append(&result(0, positive, SpikeSet::empty(2))).unwrap();
        let negative = SpikeSet {
            waveforms: array![[-1.0, -2.0]],
            times: array![0.3],
        };
        archive.append(&result(1, SpikeSet::empty(2), negative)).unwrap();
        archive.append(&result(2, SpikeSet::empty(2), SpikeSet::empty(2))).unwrap();

        let manifest = archive.close().unwrap();
        assert_eq!(manifest.positive, 2);
        assert_eq!(manifest.negative, 1);
        assert_eq!(manifest.blocks, 3);
        assert!(manifest.complete);

        let contents = SpikeArchive::load(dir.path().join("CSC1")).unwrap();
        assert_eq!(contents.positive.waveforms, array![[1.0f32, 2.0], [3.0, 4.0]]);
        assert_eq!(contents.positive.times.to_vec(), vec![0.1, 0.2]);
        assert_eq!(contents.negative.waveforms, array![[-1.0f32, -2.0]]);
        assert_eq!(contents.thresholds.shape(), &[3, 3]);
        assert_eq!(contents.thresholds[[2, 0]], 2.0);
        assert_eq!(contents.thresholds[[1, 2]], -5.0);
    }

    #[test]
    fn test_block_with_both_polarities() {
        let dir = TempDir::new().unwrap();
        let mut archive = SpikeArchive::open("CSC2", dir.path(), 2).unwrap();
        let block = result(
            0,
            SpikeSet {
                waveforms: array![[7.0, 8.0]],
                times: array![0.5],
            },
            SpikeSet {
                waveforms: array![[-7.0, -8.0], [-9.0, -10.0]],
                times: array![0.25, 0.75],
            },
        );
        assert_eq!(block.spikes(Polarity::Negative).len(), 2);
        archive.append(&block).unwrap();
        archive.close().unwrap();

        let contents = SpikeArchive::load(dir.path().join("CSC2")).unwrap();
        assert_eq!(contents.positive.times.to_vec(), vec![0.5]);
        assert_eq!(contents.negative.times.to_vec(), vec![0.25, 0.75]);
        assert_eq!(contents.negative.waveforms, array![[-7.0f32, -8.0], [-9.0, -10.0]]);
    }

    #[test]
    fn test_reopen_truncates() {
        let dir = TempDir::new().unwrap();
        let positive = SpikeSet {
            waveforms: array![[1.0, 2.0]],
            times: array![0.5],
        };
        let mut archive = SpikeArchive::open("ch", dir.path(), 2).unwrap();
        archive.append(&result(0, positive, SpikeSet::empty(2))).unwrap();
        archive.close().unwrap();

        let archive = SpikeArchive::open("ch", dir.path(), 2).unwrap();
        archive.close().unwrap();
        let contents = SpikeArchive::load(dir.path().join("ch")).unwrap();
        assert!(contents.positive.is_empty());
        assert_eq!(contents.thresholds.shape(), &[0, 3]);
    }

    #[test]
    fn test_drop_leaves_incomplete_manifest() {
        let dir = TempDir::new().unwrap();
        {
            let mut archive = SpikeArchive::open("ch", dir.path().join("nested"), 4).unwrap();
            archive.append(&result(0, SpikeSet::empty(4), SpikeSet::empty(4))).unwrap();
        }
        let contents = SpikeArchive::load(dir.path().join("nested").join("ch")).unwrap();
        assert!(!contents.manifest.complete);
        assert_eq!(contents.manifest.blocks, 1);
        assert_eq!(contents.thresholds.nrows(), 1);
    }
}
