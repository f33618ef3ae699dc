use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use fxhash::FxHashMap;
use parking_lot::Mutex;

/// Fragments and bytes written for one channel
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelStats {
    pub fragments: u64,
    pub bytes: u64,
}

#[derive(Debug, Default)]
struct ChannelCounters {
    totals: BTreeMap<i16, ChannelStats>,
    since_last_take: BTreeMap<i16, u64>,
}

/// Telemetry shared between the formatter thread and whoever is watching it.
///
/// Channel counters live behind their own lock so that reading them never stalls the
/// packet queue; the output buffer gauge is a plain atomic.
#[derive(Debug, Default)]
pub struct FormatterStats {
    channels: Mutex<ChannelCounters>,
    output_bytes: AtomicI64,
}

impl FormatterStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a batch of fragments accepted into the chunk store, as (channel, bytes)
    pub fn record_fragments(&self, fragments: &[(i16, usize)]) {
        if fragments.is_empty() {
            return;
        }
        let mut counters = self.channels.lock();
        for (channel, bytes) in fragments {
            let total = counters.totals.entry(*channel).or_default();
            total.fragments += 1;
            total.bytes += *bytes as u64;
            *counters.since_last_take.entry(*channel).or_default() += *bytes as u64;
        }
    }

    /// Cumulative counters per channel
    pub fn per_channel(&self) -> BTreeMap<i16, ChannelStats> {
        self.channels.lock().totals.clone()
    }

    /// Bytes per channel since the previous call; resets the counters
    pub fn take_rates(&self) -> BTreeMap<i16, u64> {
        std::mem::take(&mut self.channels.lock().since_last_take)
    }

    pub fn set_output_bytes(&self, bytes: usize) {
        self.output_bytes.store(bytes as i64, Ordering::Relaxed);
    }

    pub fn output_bytes(&self) -> i64 {
        self.output_bytes.load(Ordering::Relaxed)
    }
}

/// Power of two bucket of a byte size, `floor(log2(bytes))`, 0 for empty
pub fn size_bucket(bytes: u64) -> u32 {
    bytes.checked_ilog2().unwrap_or(0)
}

/// Counters kept by the formatter thread alone and reported when it finishes
#[derive(Debug, Clone, Default)]
pub struct ProcessingSummary {
    pub bytes_processed: u64,
    pub packets: u64,
    pub events: u64,
    pub fragments: u64,
    pub deadtime_markers: u64,
    pub late_fragments: u64,
    pub skipped_words: u64,
    pub unmapped_readouts: u64,
    pub decode_failures: FxHashMap<u16, u64>,
    pub board_fail_events: FxHashMap<u16, u64>,
    pub chunks_written: u64,
    pub chunks_failed: u64,
    pub bytes_written: u64,
    /// Chunks written while the newest chunk was too far ahead
    pub old_chunks: u64,
    pub decode_time: Duration,
    pub compression_time: Duration,
    pub fragments_per_event: BTreeMap<usize, u64>,
    pub events_per_packet: BTreeMap<usize, u64>,
    /// Packets by size bucket, see [`size_bucket`]
    pub packet_sizes: BTreeMap<u32, u64>,
    /// Written chunks by on disk size bucket
    pub bytes_per_chunk: BTreeMap<u32, u64>,
}

impl ProcessingSummary {
    pub fn record_packet(&mut self, bytes: usize, events: usize, event_fragments: &[usize]) {
        self.bytes_processed += bytes as u64;
        self.packets += 1;
        self.events += events as u64;
        *self.packet_sizes.entry(size_bucket(bytes as u64)).or_default() += 1;
        *self.events_per_packet.entry(events).or_default() += 1;
        for count in event_fragments {
            *self.fragments_per_event.entry(*count).or_default() += 1;
        }
    }

    pub fn record_chunk(&mut self, bytes: u64) {
        self.chunks_written += 1;
        self.bytes_written += bytes;
        *self.bytes_per_chunk.entry(size_bucket(bytes)).or_default() += 1;
    }

    /// Log the summary, one line per quantity
    pub fn log(&self) {
        spdlog::info!(
            "Processed {} in {} packets ({} events, {} fragments)",
            human_bytes::human_bytes(self.bytes_processed as f64),
            self.packets,
            self.events,
            self.fragments
        );
        spdlog::info!(
            "Wrote {} chunks with {} on disk; {} chunks failed",
            self.chunks_written,
            human_bytes::human_bytes(self.bytes_written as f64),
            self.chunks_failed
        );
        spdlog::info!(
            "Spent {:?} decoding and {:?} compressing",
            self.decode_time,
            self.compression_time
        );
        if self.old_chunks > 0 {
            spdlog::warn!(
                "{} chunks were written long after newer data arrived",
                self.old_chunks
            );
        }
        if self.deadtime_markers > 0 {
            spdlog::info!("Inserted {} deadtime markers", self.deadtime_markers);
        }
        if self.late_fragments > 0 {
            spdlog::error!(
                "{} fragments arrived after their chunk was written and were not saved",
                self.late_fragments
            );
        }
        if self.skipped_words > 0 || self.unmapped_readouts > 0 {
            spdlog::warn!(
                "Skipped {} words outside events and {} readouts of unmapped channels",
                self.skipped_words,
                self.unmapped_readouts
            );
        }
        for (board, count) in &self.decode_failures {
            spdlog::warn!("Board {} had {} packets with decode errors", board, count);
        }
        for (board, count) in &self.board_fail_events {
            spdlog::warn!("Board {} flagged {} events as failed", board, count);
        }
        spdlog::debug!("Fragments per event: {:?}", self.fragments_per_event);
        spdlog::debug!("Events per packet: {:?}", self.events_per_packet);
        spdlog::debug!("Packet sizes (log2 bytes): {:?}", self.packet_sizes);
        spdlog::debug!("Chunk sizes (log2 bytes): {:?}", self.bytes_per_chunk);
    }
}
