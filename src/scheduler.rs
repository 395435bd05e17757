use log::{debug, error, info, warn};
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread;

use crate::config::ExtractConfig;
use crate::detector::SpikeDetector;
use crate::filter::BandpassFilter;
use crate::reader::RawChannelSource;
use crate::reference::ReferenceCombiner;
use crate::store::SpikeArchive;
use crate::types::*;

const PRINT_PROGRESS_STEP: usize = 10;

/// Splits `[start, stop)` into blocks of `block_size` samples.
///
/// A trailing remainder shorter than half a block is merged into the block
/// before it; a longer remainder becomes a block of its own.
pub fn partition(start: u64, stop: u64, block_size: u64) -> Vec<Block> {
    let mut blocks: Vec<Block> = Vec::new();
    if stop <= start || block_size == 0 {
        return blocks;
    }

    let mut block_start = start;
    while block_start < stop {
        let block_stop = (block_start + block_size).min(stop);
        blocks.push(Block {
            seq: blocks.len(),
            start: block_start,
            stop: block_stop,
        });
        block_start = block_stop;
    }

    if blocks.len() > 1 {
        let tail = blocks[blocks.len() - 1];
        if tail.len() * 2 < block_size {
            blocks.pop();
            if let Some(last) = blocks.last_mut() {
                last.stop = tail.stop;
            }
        }
    }

    blocks
}

/// Holds results that arrive out of order until every earlier one is in.
///
/// Slots are indexed by sequence number; `next` is the first sequence
/// number not yet released.
#[derive(Debug)]
pub struct ReorderBuffer<T> {
    slots: Vec<Option<T>>,
    next: usize,
}

impl<T> ReorderBuffer<T> {
    pub fn new(len: usize) -> Self {
        ReorderBuffer {
            slots: (0..len).map(|_| None).collect(),
            next: 0,
        }
    }

    /// Stores `item` and returns the longest run of items now ready, in order.
    ///
    /// Items with a sequence number already released or out of bounds are dropped.
    pub fn insert(&mut self, seq: usize, item: T) -> Vec<T> {
        if seq >= self.next && seq < self.slots.len() {
            self.slots[seq] = Some(item);
        }

        let mut ready = Vec::new();
        while self.next < self.slots.len() {
            match self.slots[self.next].take() {
                Some(item) => {
                    ready.push(item);
                    self.next += 1;
                }
                None => break,
            }
        }
        ready
    }

    /// First sequence number not yet released.
    pub fn next_expected(&self) -> usize {
        self.next
    }

    /// Number of items waiting for an earlier one.
    pub fn pending(&self) -> usize {
        self.slots[self.next..].iter().filter(|s| s.is_some()).count()
    }

    pub fn is_done(&self) -> bool {
        self.next == self.slots.len()
    }
}

/// Reads one block plus margins, filters it and runs detection.
///
/// This is the whole of a worker's job; it touches nothing shared except the
/// read-only sources behind `combiner`.
pub fn process_block(
    combiner: &ReferenceCombiner,
    filter: &BandpassFilter,
    detector: &SpikeDetector,
    block: &Block,
) -> Result<BlockResult> {
    let total = combiner.total_samples();
    if block.is_empty() || block.stop > total {
        return Err(ExtractError::OutOfRange {
            start: block.start,
            stop: block.stop,
            total,
        });
    }

    let margin = detector.margin();
    let lo = block.start.saturating_sub(margin);
    let hi = (block.stop + margin).min(total);

    let signal = combiner.combine(lo, hi)?;
    let filtered = filter.apply(&signal.values);
    let mut result = detector.detect(block, &signal, &filtered);

    if let Some(drift_us) = signal.timestep_drift_us {
        result.anomalies.push(Anomaly::TimestepMismatch { drift_us });
    }

    debug!(
        "Block {} [{}, {}): {} positive, {} negative",
        block.seq,
        block.start,
        block.stop,
        result.positive.len(),
        result.negative.len()
    );
    Ok(result)
}

enum BlockOutcome {
    Done(BlockResult),
    Failed(ExtractError),
    Skipped,
}

struct WorkerReport {
    channel: usize,
    seq: usize,
    outcome: BlockOutcome,
}

enum WriterCommand {
    Append { channel: usize, result: BlockResult },
    Close { channel: usize, complete: bool },
}

#[derive(Default)]
struct WriterTally {
    blocks_written: usize,
    positive: usize,
    negative: usize,
    error: Option<ExtractError>,
}

/// Per-channel bookkeeping on the dispatching thread.
struct ChannelRun {
    job_index: usize,
    name: String,
    combiner: Arc<ReferenceCombiner>,
    filter: Arc<BandpassFilter>,
    blocks: Vec<Block>,
    next_dispatch: usize,
    in_flight: usize,
    reorder: ReorderBuffer<BlockResult>,
    aborted: Arc<AtomicBool>,
    released: usize,
    percent_done: usize,
    anomalies: usize,
    error: Option<ExtractError>,
    closed: bool,
}

impl ChannelRun {
    fn can_dispatch(&self, window: usize) -> bool {
        !self.closed
            && !self.aborted.load(Ordering::SeqCst)
            && self.next_dispatch < self.blocks.len()
            && self.next_dispatch < self.reorder.next_expected() + window
    }

    fn is_finished(&self) -> bool {
        if self.aborted.load(Ordering::SeqCst) {
            self.in_flight == 0
        } else {
            self.reorder.is_done()
        }
    }

    fn log_progress(&mut self) {
        let total = self.blocks.len();
        let progress = (self.released as f64 / total as f64) * 100.0;
        while progress >= self.percent_done as f64 && self.percent_done < 100 {
            info!("{}: {}% done...", self.name, self.percent_done);
            self.percent_done += PRINT_PROGRESS_STEP;
        }
    }
}

/// Runs extraction jobs on a fixed-size worker pool.
///
/// One pool serves every channel of a run. Blocks are dispatched
/// round-robin across channels, at most `max_blocks_in_flight` unwritten
/// blocks per channel, and finished blocks are handed to a single writer
/// thread strictly in block order.
///
/// # Examples
///
/// ```no_run
/// use spike_extract::{ExtractConfig, Extractor, Job, SourceSpec};
///
/// let extractor = Extractor::new(ExtractConfig::default()).unwrap();
/// let jobs = vec![Job::new("CSC1", SourceSpec::record("CSC1.ncs"), "spikes")];
/// for report in extractor.run(&jobs).unwrap() {
///     println!("{}: {} positive, {} negative", report.name, report.positive, report.negative);
/// }
/// ```
pub struct Extractor {
    config: ExtractConfig,
    pool: ThreadPool,
    detector: Arc<SpikeDetector>,
}

impl Extractor {
    /// Validates the configuration and builds the worker pool.
    pub fn new(config: ExtractConfig) -> Result<Self> {
        config.validate()?;
        let pool = ThreadPoolBuilder::new()
            .num_threads(config.workers)
            .thread_name(|i| format!("spike-worker-{}", i))
            .build()?;
        let detector = Arc::new(SpikeDetector::new(config.detection.clone()));

        Ok(Extractor {
            config,
            pool,
            detector,
        })
    }

    pub fn config(&self) -> &ExtractConfig {
        &self.config
    }

    /// Extracts every job and returns one report per job, in job order.
    ///
    /// A channel that fails is reported through its `error` field and does
    /// not affect the others. `Err` is returned only for failures of the
    /// run itself.
    pub fn run(&self, jobs: &[Job]) -> Result<Vec<ChannelReport>> {
        let mut reports: Vec<Option<ChannelReport>> = (0..jobs.len()).map(|_| None).collect();
        let mut channels = Vec::new();
        let mut archives = Vec::new();

        for (index, job) in jobs.iter().enumerate() {
            match self.prepare(index, job) {
                Ok((run, archive)) => {
                    channels.push(run);
                    archives.push(archive);
                }
                Err(e) => {
                    error!("{}: not extracted: {}", job.name, e);
                    let mut report = ChannelReport::new(&job.name, 0);
                    report.error = Some(e);
                    reports[index] = Some(report);
                }
            }
        }

        for (index, report) in self.execute(channels, archives)? {
            reports[index] = Some(report);
        }

        Ok(reports.into_iter().flatten().collect())
    }

    /// Opens the sources and the archive for one job and partitions it.
    fn prepare(&self, job_index: usize, job: &Job) -> Result<(ChannelRun, SpikeArchive)> {
        let primary = Arc::new(RawChannelSource::open(&job.source)?);
        let reference = match &job.reference {
            Some(spec) => {
                info!("{} (re-referenced to {})", job.name, spec.path.display());
                Some(Arc::new(RawChannelSource::open(spec)?))
            }
            None => None,
        };
        let combiner = ReferenceCombiner::new(primary, reference);
        let filter = BandpassFilter::new(&self.config.filter, combiner.sample_rate())?;

        let total = combiner.total_samples();
        let start = job.start.unwrap_or(0);
        let stop = job.stop.map_or(total, |stop| stop.min(total));
        if start > stop {
            return Err(ExtractError::OutOfRange { start, stop, total });
        }

        let blocks = partition(start, stop, self.config.block_size);
        let archive = SpikeArchive::open(&job.name, &job.destination, self.config.detection.snippet_len)?;

        info!(
            "{}: samples {}..{} in {} block{}",
            job.name,
            start,
            stop,
            blocks.len(),
            if blocks.len() != 1 { "s" } else { "" }
        );

        Ok((
            ChannelRun {
                job_index,
                name: job.name.clone(),
                combiner: Arc::new(combiner),
                filter: Arc::new(filter),
                reorder: ReorderBuffer::new(blocks.len()),
                blocks,
                next_dispatch: 0,
                in_flight: 0,
                aborted: Arc::new(AtomicBool::new(false)),
                released: 0,
                percent_done: PRINT_PROGRESS_STEP,
                anomalies: 0,
                error: None,
                closed: false,
            },
            archive,
        ))
    }

    /// Dispatches all blocks of the prepared channels and collects their results.
    fn execute(
        &self,
        mut channels: Vec<ChannelRun>,
        archives: Vec<SpikeArchive>,
    ) -> Result<Vec<(usize, ChannelReport)>> {
        let (report_tx, report_rx) = mpsc::channel::<WorkerReport>();
        let (writer_tx, writer_rx) = mpsc::channel::<WriterCommand>();

        let abort_flags: Vec<Arc<AtomicBool>> = channels.iter().map(|c| Arc::clone(&c.aborted)).collect();
        let writer = thread::Builder::new()
            .name("spike-writer".into())
            .spawn(move || writer_loop(archives, writer_rx, abort_flags))?;

        let window = self.config.blocks_in_flight();
        let mut outstanding = 0usize;

        self.dispatch(&mut channels, &report_tx, window, &mut outstanding);
        for (channel, run) in channels.iter_mut().enumerate() {
            close_if_finished(channel, run, &writer_tx);
        }

        while outstanding > 0 {
            let report = match report_rx.recv() {
                Ok(report) => report,
                Err(_) => break,
            };
            outstanding -= 1;

            let run = &mut channels[report.channel];
            run.in_flight -= 1;
            self.collect(report.channel, run, report.seq, report.outcome, &writer_tx);
            close_if_finished(report.channel, run, &writer_tx);

            self.dispatch(&mut channels, &report_tx, window, &mut outstanding);
        }

        drop(writer_tx);
        let tallies = writer.join().map_err(|_| ExtractError::WorkerLost {
            channel: "spike-writer".into(),
        })?;

        Ok(channels
            .into_iter()
            .zip(tallies)
            .map(|(run, tally)| {
                let mut report = ChannelReport::new(&run.name, run.blocks.len());
                report.blocks_written = tally.blocks_written;
                report.positive = tally.positive;
                report.negative = tally.negative;
                report.anomalies = run.anomalies;
                report.error = run.error.or(tally.error);

                if report.is_complete() {
                    info!(
                        "{}: done, {} positive and {} negative spikes",
                        report.name, report.positive, report.negative
                    );
                }
                (run.job_index, report)
            })
            .collect())
    }

    /// Handles one worker report on the dispatching thread.
    fn collect(
        &self,
        channel: usize,
        run: &mut ChannelRun,
        seq: usize,
        outcome: BlockOutcome,
        writer_tx: &Sender<WriterCommand>,
    ) {
        if run.aborted.load(Ordering::SeqCst) {
            return;
        }

        match outcome {
            BlockOutcome::Done(result) => {
                for anomaly in &result.anomalies {
                    run.anomalies += 1;
                    match anomaly {
                        Anomaly::TimestepMismatch { drift_us } => warn!(
                            "{}: {}",
                            run.name,
                            ExtractError::TimestepMismatch {
                                path: run.combiner.primary().path().to_path_buf(),
                                start: result.start,
                                stop: result.stop,
                                drift_us: *drift_us,
                            }
                        ),
                        _ => warn!("{}: block [{}, {}): {}", run.name, result.start, result.stop, anomaly),
                    }
                }

                for ready in run.reorder.insert(seq, result) {
                    run.released += 1;
                    if writer_tx
                        .send(WriterCommand::Append {
                            channel,
                            result: ready,
                        })
                        .is_err()
                    {
                        run.error.get_or_insert(ExtractError::WorkerLost {
                            channel: run.name.clone(),
                        });
                        run.aborted.store(true, Ordering::SeqCst);
                        return;
                    }
                }
                run.log_progress();
            }
            BlockOutcome::Failed(e) => {
                let block = run.blocks[seq];
                error!(
                    "{}: block {} [{}, {}) failed, stopping after {} of {} blocks: {}",
                    run.name,
                    seq,
                    block.start,
                    block.stop,
                    run.released,
                    run.blocks.len(),
                    e
                );
                run.aborted.store(true, Ordering::SeqCst);
                run.error = Some(e);
            }
            BlockOutcome::Skipped => {}
        }
    }

    /// Hands out blocks round-robin until every channel is at its window limit.
    fn dispatch(
        &self,
        channels: &mut [ChannelRun],
        report_tx: &Sender<WorkerReport>,
        window: usize,
        outstanding: &mut usize,
    ) {
        loop {
            let mut progressed = false;
            for (index, run) in channels.iter_mut().enumerate() {
                if !run.can_dispatch(window) {
                    continue;
                }
                let block = run.blocks[run.next_dispatch];
                self.spawn_block(index, run, block, report_tx.clone());
                run.next_dispatch += 1;
                run.in_flight += 1;
                *outstanding += 1;
                progressed = true;
            }
            if !progressed {
                break;
            }
        }
    }

    fn spawn_block(&self, channel: usize, run: &ChannelRun, block: Block, tx: Sender<WorkerReport>) {
        let combiner = Arc::clone(&run.combiner);
        let filter = Arc::clone(&run.filter);
        let detector = Arc::clone(&self.detector);
        let aborted = Arc::clone(&run.aborted);
        let name = run.name.clone();

        self.pool.spawn(move || {
            let outcome = if aborted.load(Ordering::SeqCst) {
                BlockOutcome::Skipped
            } else {
                match panic::catch_unwind(AssertUnwindSafe(|| {
                    process_block(&combiner, &filter, &detector, &block)
                })) {
                    Ok(Ok(result)) => BlockOutcome::Done(result),
                    Ok(Err(e)) => BlockOutcome::Failed(e),
                    Err(_) => BlockOutcome::Failed(ExtractError::WorkerLost { channel: name }),
                }
            };
            let _ = tx.send(WorkerReport {
                channel,
                seq: block.seq,
                outcome,
            });
        });
    }
}

/// Sends the final close for a channel once nothing of it is outstanding.
///
/// `channel` indexes both the channel list and the writer's archives.
fn close_if_finished(channel: usize, run: &mut ChannelRun, writer_tx: &Sender<WriterCommand>) {
    if run.closed || !run.is_finished() {
        return;
    }
    run.closed = true;
    let complete = !run.aborted.load(Ordering::SeqCst);
    if writer_tx
        .send(WriterCommand::Close {
            channel,
            complete,
        })
        .is_err()
    {
        run.error.get_or_insert(ExtractError::WorkerLost {
            channel: run.name.clone(),
        });
    }
}

/// Owns every archive of the run and applies commands in arrival order.
fn writer_loop(
    archives: Vec<SpikeArchive>,
    commands: Receiver<WriterCommand>,
    abort_flags: Vec<Arc<AtomicBool>>,
) -> Vec<WriterTally> {
    let mut tallies: Vec<WriterTally> = archives.iter().map(|_| WriterTally::default()).collect();
    let mut slots: Vec<Option<SpikeArchive>> = archives.into_iter().map(Some).collect();

    for command in commands {
        match command {
            WriterCommand::Append { channel, result } => {
                let Some(archive) = slots[channel].as_mut() else {
                    continue;
                };
                match archive.append(&result) {
                    Ok(()) => {
                        let tally = &mut tallies[channel];
                        tally.blocks_written += 1;
                        tally.positive += result.positive.len();
                        tally.negative += result.negative.len();
                    }
                    Err(e) => {
                        error!("Archive write failed, stopping channel: {}", e);
                        abort_flags[channel].store(true, Ordering::SeqCst);
                        tallies[channel].error = Some(e);
                        if let Some(archive) = slots[channel].take() {
                            if let Err(e) = archive.close_partial() {
                                warn!("Failed to close archive: {}", e);
                            }
                        }
                    }
                }
            }
            WriterCommand::Close { channel, complete } => {
                if let Some(archive) = slots[channel].take() {
                    let closed = if complete {
                        archive.close()
                    } else {
                        archive.close_partial()
                    };
                    match closed {
                        Ok(manifest) => debug!(
                            "Closed archive for {} ({} blocks)",
                            manifest.channel, manifest.blocks
                        ),
                        Err(e) => {
                            tallies[channel].error.get_or_insert(e);
                        }
                    }
                }
            }
        }
    }

    tallies
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FilterConfig;
    use crate::store::SpikeArchive;
    use crate::writer::write_flat_file;
    use tempfile::TempDir;

    fn covered(blocks: &[Block]) -> u64 {
        blocks.iter().map(|b| b.len()).sum()
    }

    #[test]
    fn test_partition_exact_multiple() {
        let blocks = partition(0, 30_000, 10_000);
        assert_eq!(blocks.len(), 3);
        assert_eq!(blocks[2], Block { seq: 2, start: 20_000, stop: 30_000 });
    }

    #[test]
    fn test_partition_merges_short_tail() {
        let blocks = partition(0, 34_999, 10_000);
        assert_eq!(blocks.len(), 3);
        assert_eq!(blocks[2], Block { seq: 2, start: 20_000, stop: 34_999 });
        assert_eq!(covered(&blocks), 34_999);
    }

    #[test]
    fn test_partition_keeps_long_tail() {
        let blocks = partition(0, 35_000, 10_000);
        assert_eq!(blocks.len(), 4);
        assert_eq!(blocks[3], Block { seq: 3, start: 30_000, stop: 35_000 });
    }

    #[test]
    fn test_partition_is_contiguous() {
        let blocks = partition(1234, 987_654, 10_000);
        assert_eq!(blocks.first().map(|b| b.start), Some(1234));
        assert_eq!(blocks.last().map(|b| b.stop), Some(987_654));
        for (i, pair) in blocks.windows(2).enumerate() {
            assert_eq!(pair[0].stop, pair[1].start);
            assert_eq!(pair[0].seq, i);
        }
        assert_eq!(covered(&blocks), 987_654 - 1234);
    }

    #[test]
    fn test_partition_small_and_empty_ranges() {
        assert_eq!(partition(0, 3000, 10_000), vec![Block { seq: 0, start: 0, stop: 3000 }]);
        assert!(partition(500, 500, 10_000).is_empty());
        assert!(partition(600, 500, 10_000).is_empty());
    }

    #[test]
    fn test_reorder_buffer_releases_in_order() {
        let mut buffer = ReorderBuffer::new(4);
        assert!(buffer.insert(2, 'c').is_empty());
        assert!(buffer.insert(1, 'b').is_empty());
        assert_eq!(buffer.pending(), 2);
        assert_eq!(buffer.insert(0, 'a'), vec!['a', 'b', 'c']);
        assert_eq!(buffer.next_expected(), 3);
        assert!(!buffer.is_done());
        assert_eq!(buffer.insert(3, 'd'), vec!['d']);
        assert!(buffer.is_done());
    }

    #[test]
    fn test_reorder_buffer_ignores_stale_items() {
        let mut buffer = ReorderBuffer::new(2);
        assert_eq!(buffer.insert(0, 1), vec![1]);
        assert!(buffer.insert(0, 99).is_empty());
        assert!(buffer.insert(7, 99).is_empty());
        assert_eq!(buffer.insert(1, 2), vec![2]);
    }

    #[test]
    fn test_empty_reorder_buffer_is_done() {
        assert!(ReorderBuffer::<u8>::new(0).is_done());
    }

    fn single_worker() -> Extractor {
        let config = ExtractConfig {
            workers: 1,
            block_size: 1000,
            filter: FilterConfig::disabled(),
            ..ExtractConfig::default()
        };
        Extractor::new(config).unwrap()
    }

    #[test]
    fn test_failed_block_leaves_partial_archive() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("ch.i16");
        let samples: Vec<i16> = (0..5000).map(|i| if i % 2 == 0 { 10 } else { -10 }).collect();
        write_flat_file(&source, &samples).unwrap();

        let extractor = single_worker();
        let job = Job::new("ch", SourceSpec::flat(&source, 20000.0), dir.path().join("out"));
        let (mut run, archive) = extractor.prepare(0, &job).unwrap();
        assert_eq!(run.blocks.len(), 5);

        // a block past the end of the channel
        run.blocks.push(Block { seq: 5, start: 5000, stop: 6000 });
        run.reorder = ReorderBuffer::new(run.blocks.len());

        let reports = extractor.execute(vec![run], vec![archive]).unwrap();
        let (index, report) = &reports[0];
        assert_eq!(*index, 0);
        assert!(matches!(report.error, Some(ExtractError::OutOfRange { total: 5000, .. })));
        assert_eq!(report.blocks_written, 5);
        assert!(!report.is_complete());

        let contents = SpikeArchive::load(dir.path().join("out").join("ch")).unwrap();
        assert!(!contents.manifest.complete);
        assert_eq!(contents.manifest.blocks, 5);
        assert_eq!(contents.thresholds.nrows(), 5);
    }

    #[test]
    fn test_process_block_rejects_out_of_range() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("ch.i16");
        write_flat_file(&source, &[1, -1, 1, -1]).unwrap();

        let primary = Arc::new(RawChannelSource::open(&SourceSpec::flat(&source, 20000.0)).unwrap());
        let combiner = ReferenceCombiner::new(primary, None);
        let detector = SpikeDetector::new(Default::default());
        let block = Block { seq: 0, start: 2, stop: 10 };

        assert!(matches!(
            process_block(&combiner, &BandpassFilter::passthrough(), &detector, &block),
            Err(ExtractError::OutOfRange { total: 4, .. })
        ));
    }
}
