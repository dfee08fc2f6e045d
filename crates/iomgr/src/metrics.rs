//! Counters, gauges and size histograms for the manager and the AIO driver.
//!
//! Everything is a relaxed `AtomicU64` — L1-hot on the update path, read
//! only by scrapers. The text dump follows the OpenMetrics exposition
//! format so a collector can scrape it as-is.

use std::sync::atomic::{AtomicU64, Ordering};

use iomgr_core::Direction;

/// Size histogram with exponential-of-two buckets: boundaries sit at
/// powers of two, bucket `i` (i >= 2) counts samples in
/// `(2^(i-2), 2^(i-1)]`, bucket 0 counts zero-sized samples.
pub struct Histogram {
    buckets: [AtomicU64; Histogram::NUM_BUCKETS],
}

impl Histogram {
    const NUM_BUCKETS: usize = 33;

    pub fn new() -> Self {
        const ZERO: AtomicU64 = AtomicU64::new(0);
        Histogram {
            buckets: [ZERO; Self::NUM_BUCKETS],
        }
    }

    fn bucket_of(value: u64) -> usize {
        if value == 0 {
            return 0;
        }
        let idx = 64 - (value - 1).leading_zeros() as usize + 1;
        idx.min(Self::NUM_BUCKETS - 1)
    }

    pub fn record(&self, value: u64) {
        self.buckets[Self::bucket_of(value)].fetch_add(1, Ordering::Relaxed);
    }

    pub fn bucket_count(&self, idx: usize) -> u64 {
        self.buckets[idx].load(Ordering::Relaxed)
    }

    pub fn total(&self) -> u64 {
        self.buckets.iter().map(|b| b.load(Ordering::Relaxed)).sum()
    }
}

impl Default for Histogram {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-thread gauges, updated only by the owning thread.
pub struct ThreadMetrics {
    pub io_count: AtomicU64,
    pub msg_recvd_count: AtomicU64,
    pub rescheduled_in: AtomicU64,
    pub rescheduled_out: AtomicU64,
}

impl ThreadMetrics {
    pub fn new() -> Self {
        ThreadMetrics {
            io_count: AtomicU64::new(0),
            msg_recvd_count: AtomicU64::new(0),
            rescheduled_in: AtomicU64::new(0),
            rescheduled_out: AtomicU64::new(0),
        }
    }
}

impl Default for ThreadMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Counters and histograms for one AIO drive interface.
pub struct AioDriveMetrics {
    pub spurious_events: AtomicU64,
    pub completion_errors: AtomicU64,
    pub read_submission_errors: AtomicU64,
    pub write_submission_errors: AtomicU64,
    pub force_sync_io_empty_iocb: AtomicU64,
    pub force_sync_io_eagain: AtomicU64,
    pub async_read_count: AtomicU64,
    pub async_write_count: AtomicU64,
    pub sync_read_count: AtomicU64,
    pub sync_write_count: AtomicU64,
    pub read_io_sizes: Histogram,
    pub write_io_sizes: Histogram,
}

impl AioDriveMetrics {
    pub fn new() -> Self {
        AioDriveMetrics {
            spurious_events: AtomicU64::new(0),
            completion_errors: AtomicU64::new(0),
            read_submission_errors: AtomicU64::new(0),
            write_submission_errors: AtomicU64::new(0),
            force_sync_io_empty_iocb: AtomicU64::new(0),
            force_sync_io_eagain: AtomicU64::new(0),
            async_read_count: AtomicU64::new(0),
            async_write_count: AtomicU64::new(0),
            sync_read_count: AtomicU64::new(0),
            sync_write_count: AtomicU64::new(0),
            read_io_sizes: Histogram::new(),
            write_io_sizes: Histogram::new(),
        }
    }

    pub fn bump_submission_error(&self, dir: Direction) {
        match dir {
            Direction::Read => &self.read_submission_errors,
            Direction::Write => &self.write_submission_errors,
        }
        .fetch_add(1, Ordering::Relaxed);
    }

    pub fn bump_async(&self, dir: Direction) {
        match dir {
            Direction::Read => &self.async_read_count,
            Direction::Write => &self.async_write_count,
        }
        .fetch_add(1, Ordering::Relaxed);
    }

    pub fn bump_sync(&self, dir: Direction) {
        match dir {
            Direction::Read => &self.sync_read_count,
            Direction::Write => &self.sync_write_count,
        }
        .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_io_size(&self, dir: Direction, size: u64) {
        match dir {
            Direction::Read => &self.read_io_sizes,
            Direction::Write => &self.write_io_sizes,
        }
        .record(size);
    }

    /// Dump counters in OpenMetrics/Prometheus exposition format.
    pub fn dump_prometheus(&self) -> String {
        let c = |a: &AtomicU64| a.load(Ordering::Relaxed);
        let mut out = String::from(
            "# HELP iomgr_aio_total AIO drive interface counters\n\
             # TYPE iomgr_aio_total counter\n",
        );
        let rows: [(&str, &str, u64); 10] = [
            ("spurious_events", "", c(&self.spurious_events)),
            ("completion_errors", "", c(&self.completion_errors)),
            ("io_submission_errors", "read", c(&self.read_submission_errors)),
            ("io_submission_errors", "write", c(&self.write_submission_errors)),
            ("force_sync_io_empty_iocb", "", c(&self.force_sync_io_empty_iocb)),
            ("force_sync_io_eagain", "", c(&self.force_sync_io_eagain)),
            ("async_io_count", "read", c(&self.async_read_count)),
            ("async_io_count", "write", c(&self.async_write_count)),
            ("sync_io_count", "read", c(&self.sync_read_count)),
            ("sync_io_count", "write", c(&self.sync_write_count)),
        ];
        for (name, dir, value) in rows {
            if dir.is_empty() {
                out.push_str(&format!("iomgr_aio_total{{counter=\"{}\"}} {}\n", name, value));
            } else {
                out.push_str(&format!(
                    "iomgr_aio_total{{counter=\"{}\",io_direction=\"{}\"}} {}\n",
                    name, dir, value
                ));
            }
        }
        out
    }
}

impl Default for AioDriveMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn histogram_buckets_are_powers_of_two() {
        assert_eq!(Histogram::bucket_of(0), 0);
        assert_eq!(Histogram::bucket_of(1), 1);
        assert_eq!(Histogram::bucket_of(2), 2);
        assert_eq!(Histogram::bucket_of(3), 3);
        assert_eq!(Histogram::bucket_of(4), 3);
        assert_eq!(Histogram::bucket_of(5), 4);
        assert_eq!(Histogram::bucket_of(4096), 13);
        assert_eq!(Histogram::bucket_of(4097), 14);
    }

    #[test]
    fn histogram_records_and_totals() {
        let h = Histogram::new();
        h.record(4096);
        h.record(4096);
        h.record(100);
        assert_eq!(h.bucket_count(13), 2);
        assert_eq!(h.total(), 3);
    }

    #[test]
    fn drive_metrics_by_direction() {
        let m = AioDriveMetrics::new();
        m.bump_async(Direction::Write);
        m.bump_async(Direction::Write);
        m.bump_async(Direction::Read);
        m.bump_sync(Direction::Read);
        m.bump_submission_error(Direction::Write);
        assert_eq!(m.async_write_count.load(Ordering::Relaxed), 2);
        assert_eq!(m.async_read_count.load(Ordering::Relaxed), 1);
        assert_eq!(m.sync_read_count.load(Ordering::Relaxed), 1);
        assert_eq!(m.write_submission_errors.load(Ordering::Relaxed), 1);

        let dump = m.dump_prometheus();
        assert!(dump.contains("io_direction=\"write\"} 2"));
        assert!(dump.contains("# TYPE iomgr_aio_total counter"));
    }
}
