//! Infers how far a byte copy has got from the destination's I/O counters.
//!
//! `dd` gives no usable progress on its own, so the writer samples the
//! cumulative sectors-written counter of the target device instead. The
//! counter is device-wide and may run ahead of the copy (write-behind,
//! journaling), so every derived figure is clamped to the source size and
//! never moves backwards.
use std::time::{Duration, Instant};

/// sysfs reports sectors in 512-byte units irrespective of the device's
/// logical block size.
pub const STAT_SECTOR_BYTES: u64 = 512;

/// Minimum wall time between two transfer-rate updates.
pub const RATE_WINDOW: Duration = Duration::from_millis(250);

/// Zero-based index of "sectors written" in `/sys/block/<dev>/stat`.
const SECTORS_WRITTEN_FIELD: usize = 6;

/// Extracts the sectors-written counter from the contents of a sysfs `stat`
/// file. Short or malformed content yields `None`.
pub fn parse_sectors_written(stat: &str) -> Option<u64> {
    stat.split_whitespace()
        .nth(SECTORS_WRITTEN_FIELD)
        .and_then(|field| field.parse::<u64>().ok())
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct WriteProgress {
    pub bytes_written: u64,
    pub total_bytes: u64,
    /// Rolling transfer rate in bytes per second.
    pub bytes_per_sec: f64,
}

impl WriteProgress {
    pub fn fraction(&self) -> f64 {
        if self.total_bytes == 0 {
            0.0
        } else {
            self.bytes_written as f64 / self.total_bytes as f64
        }
    }
}

/// Turns successive counter samples into monotonic [`WriteProgress`] values.
#[derive(Debug)]
pub struct ProgressSampler {
    baseline: u64,
    unit: u64,
    total: u64,
    last_bytes: u64,
    rate: f64,
    rate_bytes: u64,
    rate_at: Instant,
}

impl ProgressSampler {
    /// `baseline` is the counter read before the copy started; a missing
    /// baseline is treated as zero.
    pub fn new(baseline: Option<u64>, unit: u64, total: u64, now: Instant) -> Self {
        Self {
            baseline: baseline.unwrap_or(0),
            unit,
            total,
            last_bytes: 0,
            rate: 0.0,
            rate_bytes: 0,
            rate_at: now,
        }
    }

    /// Folds in a new counter reading. An unreadable counter (`None`) counts
    /// as no progress since the previous sample.
    pub fn sample(&mut self, sectors: Option<u64>, now: Instant) -> WriteProgress {
        let bytes = sectors
            .map(|s| {
                s.saturating_sub(self.baseline)
                    .saturating_mul(self.unit)
                    .min(self.total)
            })
            .unwrap_or(self.last_bytes)
            .max(self.last_bytes);

        let elapsed = now.saturating_duration_since(self.rate_at);
        if elapsed >= RATE_WINDOW && bytes > self.rate_bytes {
            self.rate = (bytes - self.rate_bytes) as f64 / elapsed.as_secs_f64();
            self.rate_bytes = bytes;
            self.rate_at = now;
        }

        self.last_bytes = bytes;
        self.current()
    }

    /// Snaps to the full source size once the copy has been flushed.
    pub fn finish(&mut self) -> WriteProgress {
        self.last_bytes = self.total;
        self.current()
    }

    fn current(&self) -> WriteProgress {
        WriteProgress {
            bytes_written: self.last_bytes,
            total_bytes: self.total,
            bytes_per_sec: self.rate,
        }
    }
}
