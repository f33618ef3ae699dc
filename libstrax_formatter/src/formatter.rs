use bit_set::BitSet;
use fxhash::FxHashMap;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use super::channel_map::ChannelMap;
use super::chunk_store::ChunkStore;
use super::chunk_writer::{ChunkWriter, FlushOutcome};
use super::clock::ClockTracker;
use super::config::Config;
use super::decoder::PacketDecoder;
use super::error::{FormatterError, QueueError};
use super::fragment::Fragment;
use super::packet::{BoardInfo, RawPacket};
use super::packet_queue::PacketQueue;
use super::stats::{ChannelStats, FormatterStats, ProcessingSummary};

/// Failed write attempts per chunk index, reported when the formatter closes
pub type FailureCounts = BTreeMap<i64, u32>;

/// What the formatter knows about one board
#[derive(Debug)]
struct BoardState {
    info: BoardInfo,
    clock: ClockTracker,
    /// Latest absolute time seen from this board
    last_time: Option<i64>,
    last_packet: Instant,
    channels: BitSet,
}

impl BoardState {
    fn new(info: BoardInfo, now: Instant) -> Self {
        Self {
            info,
            clock: ClockTracker::new(),
            last_time: None,
            last_packet: now,
            channels: BitSet::new(),
        }
    }

    fn advance(&mut self, time: i64) {
        self.last_time = Some(self.last_time.map_or(time, |last| last.max(time)));
    }
}

/// StraxProcessor is the single threaded core of the formatter.
///
/// It owns every board clock, the chunk store and the writer, so nothing in it needs a
/// lock. The formatter thread drives it; it can also be driven directly.
#[derive(Debug)]
pub struct StraxProcessor {
    decoder: PacketDecoder,
    store: ChunkStore,
    writer: ChunkWriter,
    boards: FxHashMap<u16, BoardState>,
    stats: Arc<FormatterStats>,
    buffer_num_chunks: i64,
    warn_if_chunk_older_than: i64,
    deadtime_threshold: Duration,
    summary: ProcessingSummary,
}

impl StraxProcessor {
    pub fn new(config: &Config, stats: Arc<FormatterStats>) -> Result<Self, FormatterError> {
        config.validate()?;
        let channel_map =
            ChannelMap::new(config.channel_map_path.as_deref(), config.channels_per_board)?;
        let mut store = ChunkStore::new(config.full_chunk_length(), config.chunk_overlap_ns);
        for channel in channel_map.mapped_channels() {
            store.register_channel(channel);
        }

        Ok(Self {
            decoder: PacketDecoder::new(config.fragment_payload_bytes, channel_map),
            store,
            writer: ChunkWriter::new(config),
            boards: FxHashMap::default(),
            stats,
            buffer_num_chunks: config.buffer_num_chunks,
            warn_if_chunk_older_than: config.warn_if_chunk_older_than,
            deadtime_threshold: config.deadtime_threshold(),
            summary: ProcessingSummary::default(),
        })
    }

    pub fn process_packet(&mut self, packet: RawPacket) {
        self.process_packet_at(packet, Instant::now())
    }

    /// Decode a packet and file its fragments into the chunk store.
    ///
    /// `now` is the arrival time used for stale board detection.
    pub fn process_packet_at(&mut self, packet: RawPacket, now: Instant) {
        let board_id = packet.board.id;
        let board = self.boards.entry(board_id).or_insert_with(|| {
            spdlog::info!("First packet from board {}", board_id);
            if let Err(e) = self.decoder.channel_map().check_board(board_id) {
                spdlog::error!("{}", e);
            }
            BoardState::new(packet.board, now)
        });
        board.last_packet = now;

        let start = Instant::now();
        let decoded = self.decoder.decode(&packet, &mut board.clock);
        self.summary.decode_time += start.elapsed();
        self.summary
            .record_packet(packet.size_bytes(), decoded.events, &decoded.event_fragments);
        self.summary.skipped_words += decoded.skipped_words as u64;
        self.summary.unmapped_readouts += decoded.unmapped_readouts as u64;
        if let Some(e) = &decoded.error {
            spdlog::warn!("Discarding rest of packet from board {}: {}", board_id, e);
            *self.summary.decode_failures.entry(board_id).or_default() += 1;
        }
        if decoded.board_fail_events > 0 {
            *self.summary.board_fail_events.entry(board_id).or_default() +=
                decoded.board_fail_events as u64;
        }
        if let Some(time) = decoded.max_time {
            board.advance(time);
        }

        let mut accepted = Vec::with_capacity(decoded.fragments.len());
        let mut new_channels = Vec::new();
        for fragment in decoded.fragments {
            let channel = fragment.channel();
            let bytes = fragment.len();
            if let Ok(c) = usize::try_from(channel) {
                board.channels.insert(c);
            }
            let known = self.store.is_known(channel);
            match self.store.add_fragment(fragment) {
                Ok(()) => {
                    accepted.push((channel, bytes));
                    if !known {
                        new_channels.push(channel);
                    }
                }
                Err(e) => {
                    self.summary.late_fragments += 1;
                    spdlog::error!("Board {}: {}", board_id, e);
                }
            }
        }
        // Chunks already on disk need a file for channels that only showed up now
        if self.store.next_index() > 0 {
            for channel in new_channels {
                self.writer.backfill_channel(channel, self.store.next_index());
            }
        }
        self.summary.fragments += accepted.len() as u64;
        self.stats.record_fragments(&accepted);
        self.stats.set_output_bytes(self.store.buffered_bytes());
    }

    /// Smallest last known time over all boards. None while any board has no time yet.
    fn min_board_time(&self) -> Option<i64> {
        self.boards.values().map(|b| b.last_time).min().flatten()
    }

    /// Insert deadtime markers for boards that have gone quiet.
    ///
    /// A board with no packet for longer than the threshold, lagging behind the newest
    /// time of any board, gets a marker on each of its channels at that newest time. Its
    /// last known time moves up to the marker, which lets waiting chunks complete.
    pub fn check_stale_boards(&mut self, now: Instant) {
        let Some(newest) = self.boards.values().filter_map(|b| b.last_time).max() else {
            return;
        };
        for board in self.boards.values_mut() {
            if now.saturating_duration_since(board.last_packet) < self.deadtime_threshold {
                continue;
            }
            if board.last_time.is_some_and(|time| time >= newest) {
                continue;
            }

            let mut markers = 0;
            for channel in board.channels.iter() {
                let marker =
                    Fragment::deadtime_marker(newest, channel as i16, board.info.sample_width_ns);
                match self.store.add_fragment(marker) {
                    Ok(()) => markers += 1,
                    Err(e) => {
                        self.summary.late_fragments += 1;
                        spdlog::error!("Deadtime marker for board {}: {}", board.info.id, e);
                    }
                }
            }
            spdlog::warn!(
                "Board {} has sent nothing for {:?}, inserted {} deadtime markers at {} ns",
                board.info.id,
                now.saturating_duration_since(board.last_packet),
                markers,
                newest
            );
            board.last_time = Some(newest);
            board.last_packet = now;
            self.summary.deadtime_markers += markers;
        }
        self.stats.set_output_bytes(self.store.buffered_bytes());
    }

    /// Write every chunk that is complete or has fallen out of the lookahead window.
    ///
    /// Does nothing, and touches nothing on disk, when no chunk qualifies. A chunk written
    /// more than `warn_if_chunk_older_than` indices behind the newest one is logged.
    pub fn write_out_chunks(&mut self) {
        let Some(target) = self
            .store
            .flush_target(self.min_board_time(), self.buffer_num_chunks)
        else {
            return;
        };
        while self.store.next_index() <= target {
            let index = self.store.next_index();
            if let Some(newest) = self.store.newest_index() {
                if newest - index > self.warn_if_chunk_older_than {
                    self.summary.old_chunks += 1;
                    spdlog::warn!(
                        "Writing chunk {} while chunk {} is already buffered",
                        index,
                        newest
                    );
                }
            }
            self.flush_next();
        }
        self.stats.set_output_bytes(self.store.buffered_bytes());
    }

    /// Write everything still buffered, complete or not.
    ///
    /// Flushing the last chunk leaves its overlap behind as the pre region of the index after
    /// it, so the last index is looked up again after every chunk.
    pub fn flush_all(&mut self) {
        while let Some(last) = self.store.last_index() {
            if self.store.next_index() > last {
                break;
            }
            self.flush_next();
        }
        self.stats.set_output_bytes(self.store.buffered_bytes());
    }

    fn flush_next(&mut self) {
        let payload = self.store.take_next();
        let channels = self.store.known_channels();
        match self.writer.flush(payload, &channels) {
            FlushOutcome::Written(bytes) => self.summary.record_chunk(bytes),
            FlushOutcome::Failed(_) => self.summary.chunks_failed += 1,
        }
        self.summary.compression_time = self.writer.compression_time();
    }

    /// Flush all chunks, mark the output as finished and report the failures
    pub fn finish(mut self) -> FailureCounts {
        self.flush_all();
        if let Err(e) = self.writer.write_end_marker() {
            spdlog::error!("Could not write the end marker: {}", e);
        }
        for (id, board) in self.boards.iter() {
            if board.clock.anomalies() > 0 {
                spdlog::warn!(
                    "Board {} repeated its clock value {} times",
                    id,
                    board.clock.anomalies()
                );
            }
        }
        self.summary.log();
        self.writer.into_failures()
    }

    pub fn clock(&self, board_id: u16) -> Option<&ClockTracker> {
        self.boards.get(&board_id).map(|b| &b.clock)
    }

    pub fn summary(&self) -> &ProcessingSummary {
        &self.summary
    }

    pub fn failures(&self) -> &FailureCounts {
        self.writer.failures()
    }

    pub fn buffered_bytes(&self) -> usize {
        self.store.buffered_bytes()
    }
}

#[derive(Debug)]
struct SharedState {
    queue: PacketQueue,
    stats: Arc<FormatterStats>,
    active: AtomicBool,
}

/// The main loop of the formatter thread.
///
/// Waits on the queue with a timeout so that stale boards and complete chunks are
/// handled even when no data arrives. After the queue closes every pending packet is
/// processed and all chunks are flushed before returning.
fn run_formatter(
    shared: Arc<SharedState>,
    mut processor: StraxProcessor,
    poll_timeout: Duration,
) -> FailureCounts {
    spdlog::info!("Formatter thread started");
    while shared.active.load(Ordering::Acquire) {
        let drained = shared.queue.drain(poll_timeout);
        for packet in drained.packets {
            processor.process_packet(packet);
        }
        processor.check_stale_boards(Instant::now());
        processor.write_out_chunks();
        if drained.closed {
            break;
        }
    }

    loop {
        let drained = shared.queue.drain(Duration::ZERO);
        if drained.packets.is_empty() {
            break;
        }
        for packet in drained.packets {
            processor.process_packet(packet);
        }
    }
    spdlog::info!("Formatter thread flushing remaining chunks");
    processor.finish()
}

/// StraxFormatter reformats raw digitizer packets into strax chunks on its own thread.
///
/// Readout threads hand packets over with [`StraxFormatter::submit`]; the buffer gauges
/// let them throttle themselves, the formatter never blocks or drops their data.
/// [`StraxFormatter::close`] drains and writes everything and returns the per chunk
/// write failures.
#[derive(Debug)]
pub struct StraxFormatter {
    shared: Arc<SharedState>,
    worker: Option<JoinHandle<FailureCounts>>,
}

impl StraxFormatter {
    /// Validate the config and start the formatter thread
    pub fn new(config: Config) -> Result<Self, FormatterError> {
        let stats = Arc::new(FormatterStats::new());
        let processor = StraxProcessor::new(&config, stats.clone())?;
        let shared = Arc::new(SharedState {
            queue: PacketQueue::new(),
            stats,
            active: AtomicBool::new(true),
        });

        let worker_shared = shared.clone();
        let poll_timeout = config.poll_timeout();
        let worker = std::thread::Builder::new()
            .name(String::from("strax_formatter"))
            .spawn(move || run_formatter(worker_shared, processor, poll_timeout))?;
        spdlog::info!(
            "StraxFormatter writing {} compressed chunks to {}",
            config.compressor.name(),
            config.host_directory().to_string_lossy()
        );

        Ok(Self {
            shared,
            worker: Some(worker),
        })
    }

    /// Hand a batch of packets from a board to the formatter
    pub fn submit(&self, board_id: u16, packets: Vec<RawPacket>) -> Result<(), QueueError> {
        self.shared.queue.submit(board_id, packets)
    }

    /// Bytes waiting in the input queue and bytes buffered in unwritten chunks
    pub fn buffer_sizes(&self) -> (i64, i64) {
        (
            self.shared.queue.input_bytes(),
            self.shared.stats.output_bytes(),
        )
    }

    pub fn per_channel_stats(&self) -> BTreeMap<i16, ChannelStats> {
        self.shared.stats.per_channel()
    }

    /// Bytes per channel since the last call
    pub fn take_channel_rates(&self) -> BTreeMap<i16, u64> {
        self.shared.stats.take_rates()
    }

    pub fn is_active(&self) -> bool {
        self.shared.active.load(Ordering::Acquire)
    }

    /// Stop accepting packets, write everything out and return the failed write attempts
    /// per chunk
    pub fn close(mut self) -> Result<FailureCounts, FormatterError> {
        self.stop()
    }

    fn stop(&mut self) -> Result<FailureCounts, FormatterError> {
        self.shared.queue.close();
        self.shared.active.store(false, Ordering::Release);
        match self.worker.take() {
            Some(handle) => handle.join().map_err(|_| FormatterError::WorkerPanic),
            None => Ok(FailureCounts::new()),
        }
    }
}

impl Drop for StraxFormatter {
    fn drop(&mut self) {
        if self.worker.is_some() {
            spdlog::warn!("StraxFormatter dropped without close, flushing anyway");
            if let Err(e) = self.stop() {
                spdlog::error!("{}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk_writer::read_chunk_file;
    use crate::compressor::Compressor;
    use crate::constants::{EVENT_HEADER_MARKER, EVENT_MARKER_SHIFT};
    use crate::packet::WordBuffer;
    use std::path::Path;

    // 10 us chunks with 1 us overlap, 4 samples per fragment
    fn config(output: &Path) -> Config {
        Config {
            output_path: output.to_path_buf(),
            hostname: String::from("test"),
            chunk_length_ns: 10_000,
            chunk_overlap_ns: 1_000,
            fragment_payload_bytes: 8,
            buffer_num_chunks: 100,
            compressor: Compressor::None,
            write_retries: 0,
            retry_delay_ms: 0,
            deadtime_threshold_ms: 5_000,
            ..Default::default()
        }
    }

    /// A packet with one event reading channels 0 and 1 at `ticks`
    fn packet(board: u16, ticks: u32) -> RawPacket {
        let words = vec![
            (EVENT_HEADER_MARKER << EVENT_MARKER_SHIFT) | 12,
            0b11,
            0,
            ticks,
            4,
            ticks,
            0x0001_0002,
            0x0003_0004,
            4,
            ticks,
            0x0005_0006,
            0x0007_0008,
        ];
        RawPacket::new(BoardInfo::new(board), WordBuffer::from_words(&words), ticks)
    }

    fn processor(output: &Path) -> StraxProcessor {
        StraxProcessor::new(&config(output), Arc::new(FormatterStats::new())).unwrap()
    }

    #[test]
    fn test_nothing_written_until_complete() {
        let dir = tempfile::tempdir().unwrap();
        let mut processor = processor(dir.path());
        processor.process_packet(packet(0, 100));
        processor.process_packet(packet(1, 150));
        for _ in 0..3 {
            processor.write_out_chunks();
        }
        assert!(!dir.path().join("test").exists());
        let summary = processor.summary();
        assert_eq!(summary.fragments, 4);
        assert_eq!(summary.events_per_packet, BTreeMap::from([(1, 2)]));
        assert_eq!(summary.fragments_per_event, BTreeMap::from([(2, 2)]));
        // 12 words, 48 bytes
        assert_eq!(summary.packet_sizes, BTreeMap::from([(5, 2)]));
        assert!(processor.buffered_bytes() > 0);
    }

    #[test]
    fn test_chunk_written_once_every_board_moved_on() {
        let dir = tempfile::tempdir().unwrap();
        let mut processor = processor(dir.path());
        processor.process_packet(packet(0, 100));
        processor.process_packet(packet(1, 150));
        processor.process_packet(packet(0, 1_300));
        processor.write_out_chunks();
        // board 1 still sits in chunk 0
        assert!(!dir.path().join("test").join("000000").exists());

        processor.process_packet(packet(1, 1_250));
        processor.write_out_chunks();
        let chunk = dir.path().join("test").join("000000");
        assert!(chunk.is_dir());
        let fragments = read_chunk_file(&chunk.join("0"), Compressor::None).unwrap();
        assert_eq!(fragments.len(), 1);
        assert_eq!(fragments[0].time(), 1_000);
        // channels of board 1 start at 8
        assert!(chunk.join("9").exists());
        assert!(!dir.path().join("test").join("000001").exists());
        // four uncompressed 32 byte files
        assert_eq!(processor.summary().bytes_per_chunk, BTreeMap::from([(7, 1)]));
        assert_eq!(processor.summary().old_chunks, 0);
    }

    #[test]
    fn test_repeated_clock_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let mut processor = processor(dir.path());
        processor.process_packet(packet(0, 100));
        processor.process_packet(packet(0, 100));
        assert_eq!(processor.clock(0).unwrap().anomalies(), 1);
        assert!(processor.clock(1).is_none());
    }

    #[test]
    fn test_stale_board_gets_deadtime_markers() {
        let dir = tempfile::tempdir().unwrap();
        let mut processor = processor(dir.path());
        let start = Instant::now();
        let later = start + Duration::from_secs(10);
        processor.process_packet_at(packet(0, 100), start);
        processor.process_packet_at(packet(1, 150), start);
        processor.process_packet_at(packet(1, 2_500), later);

        // board 1 is recent, board 0 has been quiet for 10 s
        processor.check_stale_boards(later);
        assert_eq!(processor.summary().deadtime_markers, 2);
        // a second check right away changes nothing
        processor.check_stale_boards(later);
        assert_eq!(processor.summary().deadtime_markers, 2);

        // both boards now reach 25 us, so chunk 0 and 1 are complete
        processor.write_out_chunks();
        let host = dir.path().join("test");
        assert!(host.join("000000").is_dir());
        assert!(host.join("000001").is_dir());
        assert!(!host.join("000002").exists());

        let failures = processor.finish();
        assert!(failures.is_empty());
        let markers = read_chunk_file(&host.join("000002").join("0"), Compressor::None).unwrap();
        assert_eq!(markers.len(), 1);
        assert!(markers[0].is_deadtime_marker());
        assert_eq!(markers[0].time(), 25_000);
        assert!(host.join("THE_END").exists());
    }

    #[test]
    fn test_late_fragments_are_counted() {
        let dir = tempfile::tempdir().unwrap();
        let mut processor = StraxProcessor::new(
            &Config {
                buffer_num_chunks: 1,
                ..config(dir.path())
            },
            Arc::new(FormatterStats::new()),
        )
        .unwrap();
        processor.process_packet(packet(0, 100));
        processor.process_packet(packet(1, 5_000));
        // chunk 4 is three chunks ahead of chunk 0, force out chunks 0 to 2
        processor.write_out_chunks();
        assert!(dir.path().join("test").join("000002").is_dir());

        processor.process_packet(packet(0, 200));
        assert_eq!(processor.summary().late_fragments, 2);
    }

    #[test]
    fn test_old_chunks_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        let mut processor = StraxProcessor::new(
            &Config {
                buffer_num_chunks: 1,
                warn_if_chunk_older_than: 1,
                ..config(dir.path())
            },
            Arc::new(FormatterStats::new()),
        )
        .unwrap();
        processor.process_packet(packet(0, 100));
        processor.process_packet(packet(1, 5_000));
        // chunks 0 to 2 are forced out while chunk 4 is the newest
        processor.write_out_chunks();
        assert_eq!(processor.summary().chunks_written, 3);
        assert_eq!(processor.summary().old_chunks, 3);
    }

    #[test]
    fn test_flush_all_writes_trailing_pre_region() {
        let dir = tempfile::tempdir().unwrap();
        let mut processor = processor(dir.path());
        // 10 us, inside the overlap region of chunk 0 and the last data of the run
        processor.process_packet(packet(0, 1_000));
        processor.flush_all();

        let host = dir.path().join("test");
        let owned = read_chunk_file(&host.join("000000").join("0"), Compressor::None).unwrap();
        assert_eq!(owned.len(), 1);
        let pre = read_chunk_file(&host.join("000001").join("0_pre"), Compressor::None).unwrap();
        assert_eq!(pre, owned);
        assert!(read_chunk_file(&host.join("000001").join("0"), Compressor::None)
            .unwrap()
            .is_empty());
        assert_eq!(processor.buffered_bytes(), 0);
        assert_eq!(processor.summary().chunks_written, 2);
    }

    #[test]
    fn test_late_channel_is_backfilled() {
        let dir = tempfile::tempdir().unwrap();
        let mut processor = StraxProcessor::new(
            &Config {
                buffer_num_chunks: 1,
                ..config(dir.path())
            },
            Arc::new(FormatterStats::new()),
        )
        .unwrap();
        processor.process_packet(packet(0, 100));
        processor.process_packet(packet(0, 5_000));
        processor.write_out_chunks();
        let host = dir.path().join("test");
        assert!(host.join("000003").is_dir());
        assert!(!host.join("000000").join("8").exists());

        // board 1 turns up in chunk 4
        processor.process_packet(packet(1, 5_100));
        for index in 0..4 {
            let chunk = host.join(format!("{index:06}"));
            for channel in ["8", "9"] {
                let fragments = read_chunk_file(&chunk.join(channel), Compressor::None).unwrap();
                assert!(fragments.is_empty());
            }
        }
        let first = read_chunk_file(&host.join("000000").join("0"), Compressor::None).unwrap();
        assert_eq!(first.len(), 1);
    }

    #[test]
    fn test_threaded_formatter_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let formatter = StraxFormatter::new(Config {
            poll_timeout_ms: 5,
            ..config(dir.path())
        })
        .unwrap();
        formatter
            .submit(0, vec![packet(0, 100), packet(0, 1_200)])
            .unwrap();
        let failures = formatter.close().unwrap();
        assert!(failures.is_empty());

        let host = dir.path().join("test");
        let first = read_chunk_file(&host.join("000000").join("1"), Compressor::None).unwrap();
        assert_eq!(first.len(), 1);
        let second = read_chunk_file(&host.join("000001").join("1"), Compressor::None).unwrap();
        assert_eq!(second[0].time(), 12_000);
    }
}
