use super::constants::{
    CLOCK_HIGH_THRESHOLD, CLOCK_LOW_THRESHOLD, CLOCK_ROLLOVER_TICKS, CLOCK_TICK_NS,
};

/// ClockTracker counts the rollovers of a board's 31-bit trigger time tag.
///
/// The digitizer clock counts 10 ns ticks and wraps roughly every 21 s. Packets from a
/// board arrive in order, but channels within them are quasi-independent, so a time
/// smaller than the previous one is not necessarily a rollover. A rollover is only
/// accepted once the clock has been seen in the middle (LOW..HIGH) and then late (>= HIGH)
/// part of an epoch, and the new time is early (< LOW).
///
/// One tracker exists per board and is only ever touched by the thread decoding that
/// board's packets.
#[derive(Debug, Clone)]
pub struct ClockTracker {
    last_time: u32,
    epoch_count: i64,
    seen_low: bool,
    seen_high: bool,
    anomalies: u64,
}

impl Default for ClockTracker {
    fn default() -> Self {
        Self {
            last_time: 0,
            epoch_count: 0,
            seen_low: true, // a run starts early in the first epoch
            seen_high: false,
            anomalies: 0,
        }
    }
}

impl ClockTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve the epoch a raw timestamp belongs to, updating the rollover state.
    ///
    /// A late time seen while the tracker still believes it is early in the epoch is a
    /// straggler from the previous epoch; it returns `epoch_count - 1` and leaves the state
    /// untouched.
    pub fn resolve(&mut self, timestamp: u32) -> i64 {
        if timestamp > self.last_time {
            if timestamp >= CLOCK_HIGH_THRESHOLD && self.seen_low {
                self.epoch_count - 1
            } else if timestamp >= CLOCK_LOW_THRESHOLD && self.seen_low {
                self.seen_low = false;
                self.last_time = timestamp;
                self.epoch_count
            } else if timestamp >= CLOCK_HIGH_THRESHOLD {
                self.seen_high = true;
                self.last_time = timestamp;
                self.epoch_count
            } else {
                self.last_time = timestamp;
                self.epoch_count
            }
        } else if timestamp < self.last_time {
            if timestamp < CLOCK_LOW_THRESHOLD && !self.seen_low && self.seen_high {
                self.seen_low = true;
                self.seen_high = false;
                self.last_time = timestamp;
                self.epoch_count += 1;
                spdlog::debug!(
                    "Clock rollover to epoch {} at raw time {}",
                    self.epoch_count,
                    timestamp
                );
            }
            // Anything else is jitter within the epoch
            self.epoch_count
        } else {
            self.anomalies += 1;
            spdlog::warn!(
                "Something odd in the clock counter. t_new: {} last time: {} seen high: {} seen low: {}",
                timestamp,
                self.last_time,
                self.seen_high,
                self.seen_low
            );
            self.epoch_count
        }
    }

    pub fn epoch_count(&self) -> i64 {
        self.epoch_count
    }

    pub fn last_time(&self) -> u32 {
        self.last_time
    }

    /// Number of repeated timestamps reported so far
    pub fn anomalies(&self) -> u64 {
        self.anomalies
    }
}

/// Epoch of a channel time relative to the packet it was read with.
///
/// A packet can straddle a rollover, so a channel may sit one epoch before or after the
/// packet's header time.
pub fn channel_epoch(packet_epoch: i64, header_time: u32, channel_time: u32) -> i64 {
    if channel_time >= CLOCK_HIGH_THRESHOLD && header_time < CLOCK_LOW_THRESHOLD {
        packet_epoch - 1
    } else if channel_time < CLOCK_LOW_THRESHOLD && header_time >= CLOCK_HIGH_THRESHOLD {
        packet_epoch + 1
    } else {
        packet_epoch
    }
}

/// Absolute time in ns of a raw clock value within an epoch
pub fn absolute_time_ns(epoch: i64, raw_time: u32) -> i64 {
    epoch * CLOCK_ROLLOVER_TICKS * CLOCK_TICK_NS + raw_time as i64 * CLOCK_TICK_NS
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolve_all(tracker: &mut ClockTracker, times: &[u32]) -> Vec<i64> {
        times.iter().map(|t| tracker.resolve(*t)).collect()
    }

    #[test]
    fn test_rollover_sequence() {
        let mut tracker = ClockTracker::new();
        let epochs = resolve_all(
            &mut tracker,
            &[0, 600_000_000, 1_600_000_000, 100_000_000],
        );
        assert_eq!(epochs, vec![0, 0, 0, 1]);
        assert_eq!(tracker.epoch_count(), 1);
        assert_eq!(tracker.last_time(), 100_000_000);
    }

    #[test]
    fn test_repeated_timestamp_is_anomaly() {
        let mut tracker = ClockTracker::new();
        assert_eq!(tracker.resolve(700_000_000), 0);
        assert_eq!(tracker.resolve(700_000_000), 0);
        assert_eq!(tracker.anomalies(), 1);
        assert_eq!(tracker.last_time(), 700_000_000);
    }

    #[test]
    fn test_late_straggler_does_not_mutate() {
        let mut tracker = ClockTracker::new();
        resolve_all(&mut tracker, &[600_000_000, 1_600_000_000, 100_000_000]);
        assert_eq!(tracker.epoch_count(), 1);
        // a straggler from the previous epoch
        assert_eq!(tracker.resolve(1_900_000_000), 0);
        assert_eq!(tracker.epoch_count(), 1);
        assert_eq!(tracker.last_time(), 100_000_000);
        // and normal progress continues
        assert_eq!(tracker.resolve(200_000_000), 1);
        assert_eq!(tracker.last_time(), 200_000_000);
    }

    #[test]
    fn test_jitter_is_not_rollover() {
        let mut tracker = ClockTracker::new();
        resolve_all(&mut tracker, &[600_000_000, 800_000_000]);
        // smaller, but the clock never reached the late part of the epoch
        assert_eq!(tracker.resolve(100_000_000), 0);
        assert_eq!(tracker.last_time(), 800_000_000);
        resolve_all(&mut tracker, &[1_600_000_000]);
        // smaller, but not early in the epoch
        assert_eq!(tracker.resolve(1_000_000_000), 0);
        assert_eq!(tracker.epoch_count(), 0);
    }

    #[test]
    fn test_epochs_never_decrease_beyond_lookback() {
        // walk the clock through several epochs in coarse steps with some jitter
        let mut tracker = ClockTracker::new();
        let mut raw: u64 = 0;
        let mut seed: u64 = 12345;
        let mut highest = 0;
        for _ in 0..5000 {
            seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            let step = (seed >> 40) % 60_000_000;
            raw = (raw + step) % (CLOCK_ROLLOVER_TICKS as u64);
            let jitter = (seed >> 20) % 1000;
            let t = raw.saturating_sub(jitter) as u32;
            let before = tracker.epoch_count();
            let epoch = tracker.resolve(t);
            if epoch < before {
                assert_eq!(epoch, before - 1);
                assert_eq!(tracker.epoch_count(), before);
            } else {
                assert!(epoch >= highest);
                highest = epoch;
            }
        }
        assert!(tracker.epoch_count() >= 2);
    }

    #[test]
    fn test_channel_epoch() {
        assert_eq!(channel_epoch(3, 100, 1_800_000_000), 2);
        assert_eq!(channel_epoch(3, 1_800_000_000, 100), 4);
        assert_eq!(channel_epoch(3, 900_000_000, 950_000_000), 3);
    }

    #[test]
    fn test_absolute_time() {
        assert_eq!(absolute_time_ns(0, 5), 50);
        assert_eq!(absolute_time_ns(1, 0), 21_474_836_480);
    }
}
