//! Per-connection traffic counters.

use std::sync::atomic::{AtomicU64, Ordering};

// ---------------------------------------------------------------------------
// ConnectionStats
// ---------------------------------------------------------------------------

/// Live counters bumped by the send path.
///
/// Atomics so the counters can be read from any thread without taking the
/// connection's send lock.
#[derive(Debug, Default)]
pub struct ConnectionStats {
    /// Bytes written to the socket (post-compression).
    pub bytes_sent: AtomicU64,
    /// Packet bytes handed to the send path (pre-compression).
    pub bytes_sent_raw: AtomicU64,
    /// Socket writes, each one packet or one collated packet.
    pub writes: AtomicU64,
    /// Packets handed to the send path.
    pub packets: AtomicU64,
    /// Collated packets flushed.
    pub collated_flushes: AtomicU64,
    /// Failed socket writes.
    pub send_failures: AtomicU64,
}

impl ConnectionStats {
    /// Create zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one packet entering the send path.
    pub fn record_packet(&self, raw_bytes: u64) {
        self.bytes_sent_raw.fetch_add(raw_bytes, Ordering::Relaxed);
        self.packets.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a successful socket write.
    pub fn record_write(&self, wire_bytes: u64) {
        self.bytes_sent.fetch_add(wire_bytes, Ordering::Relaxed);
        self.writes.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a collated packet flush.
    pub fn record_flush(&self) {
        self.collated_flushes.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a failed socket write.
    pub fn record_failure(&self) {
        self.send_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy of the counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_sent_raw: self.bytes_sent_raw.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            packets: self.packets.load(Ordering::Relaxed),
            collated_flushes: self.collated_flushes.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
        }
    }

    /// Snapshot and reset all counters (swap with 0).
    pub fn snapshot_and_reset(&self) -> StatsSnapshot {
        StatsSnapshot {
            bytes_sent: self.bytes_sent.swap(0, Ordering::Relaxed),
            bytes_sent_raw: self.bytes_sent_raw.swap(0, Ordering::Relaxed),
            writes: self.writes.swap(0, Ordering::Relaxed),
            packets: self.packets.swap(0, Ordering::Relaxed),
            collated_flushes: self.collated_flushes.swap(0, Ordering::Relaxed),
            send_failures: self.send_failures.swap(0, Ordering::Relaxed),
        }
    }
}

// ---------------------------------------------------------------------------
// StatsSnapshot
// ---------------------------------------------------------------------------

/// Copy of [`ConnectionStats`] at one instant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub bytes_sent: u64,
    pub bytes_sent_raw: u64,
    pub writes: u64,
    pub packets: u64,
    pub collated_flushes: u64,
    pub send_failures: u64,
}

impl StatsSnapshot {
    /// Wire bytes per raw byte; below 1.0 when compression helps.
    pub fn compression_ratio(&self) -> f64 {
        if self.bytes_sent_raw == 0 {
            return 1.0;
        }
        self.bytes_sent as f64 / self.bytes_sent_raw as f64
    }

    /// Add another snapshot's counts to this one.
    pub fn accumulate(&mut self, other: &StatsSnapshot) {
        self.bytes_sent += other.bytes_sent;
        self.bytes_sent_raw += other.bytes_sent_raw;
        self.writes += other.writes;
        self.packets += other.packets;
        self.collated_flushes += other.collated_flushes;
        self.send_failures += other.send_failures;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let stats = ConnectionStats::new();
        stats.record_packet(100);
        stats.record_packet(50);
        stats.record_write(80);
        stats.record_flush();
        let snap = stats.snapshot();
        assert_eq!(snap.packets, 2);
        assert_eq!(snap.bytes_sent_raw, 150);
        assert_eq!(snap.bytes_sent, 80);
        assert_eq!(snap.writes, 1);
        assert_eq!(snap.collated_flushes, 1);
    }

    #[test]
    fn test_snapshot_and_reset_zeroes() {
        let stats = ConnectionStats::new();
        stats.record_write(10);
        stats.record_failure();
        let first = stats.snapshot_and_reset();
        assert_eq!(first.bytes_sent, 10);
        assert_eq!(first.send_failures, 1);
        assert_eq!(stats.snapshot(), StatsSnapshot::default());
    }

    #[test]
    fn test_compression_ratio() {
        let snap = StatsSnapshot {
            bytes_sent: 50,
            bytes_sent_raw: 200,
            ..Default::default()
        };
        assert_eq!(snap.compression_ratio(), 0.25);
        assert_eq!(StatsSnapshot::default().compression_ratio(), 1.0);
    }

    #[test]
    fn test_accumulate_totals() {
        let mut total = StatsSnapshot::default();
        let one = StatsSnapshot {
            bytes_sent: 5,
            packets: 1,
            ..Default::default()
        };
        total.accumulate(&one);
        total.accumulate(&one);
        assert_eq!(total.bytes_sent, 10);
        assert_eq!(total.packets, 2);
    }
}
