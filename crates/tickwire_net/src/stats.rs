//! # Statistics
//!
//! Lock-free counters owned by each component and shared through `Arc`.
//!
//! ## Design
//!
//! - Writers only ever `fetch_add` with relaxed ordering
//! - Readers take a [`StatsSnapshot`], a plain `Copy` value
//! - `reset` zeroes a block; counters are otherwise monotonic
//!
//! A snapshot taken while traffic is flowing may mix counters from slightly
//! different instants. That is fine for reporting.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[inline]
fn add(counter: &AtomicU64, n: u64) {
    counter.fetch_add(n, Ordering::Relaxed);
}

#[inline]
fn load(counter: &AtomicU64) -> u64 {
    counter.load(Ordering::Relaxed)
}

fn nanos(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX)
}

fn kb(bytes: u64) -> u64 {
    bytes / 1024
}

// =============================================================================
// Compression
// =============================================================================

/// Compression counters.
#[derive(Debug, Default)]
pub struct CompressionStats {
    bytes_before: AtomicU64,
    bytes_after: AtomicU64,
    packets: AtomicU64,
    skipped: AtomicU64,
    compress_nanos: AtomicU64,
    decompressed_packets: AtomicU64,
    decompressed_bytes: AtomicU64,
    decompress_nanos: AtomicU64,
    fallbacks: AtomicU64,
    failures: AtomicU64,
}

impl CompressionStats {
    /// Creates zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_compressed(&self, before: usize, after: usize, elapsed: Duration) {
        add(&self.bytes_before, before as u64);
        add(&self.bytes_after, after as u64);
        add(&self.packets, 1);
        add(&self.compress_nanos, nanos(elapsed));
    }

    pub(crate) fn record_skipped(&self) {
        add(&self.skipped, 1);
    }

    pub(crate) fn record_decompressed(&self, output: usize, elapsed: Duration) {
        add(&self.decompressed_packets, 1);
        add(&self.decompressed_bytes, output as u64);
        add(&self.decompress_nanos, nanos(elapsed));
    }

    pub(crate) fn record_fallback(&self) {
        add(&self.fallbacks, 1);
    }

    pub(crate) fn record_failure(&self) {
        add(&self.failures, 1);
    }

    /// Copies the current values.
    #[must_use]
    pub fn snapshot(&self) -> CompressionSnapshot {
        CompressionSnapshot {
            bytes_before: load(&self.bytes_before),
            bytes_after: load(&self.bytes_after),
            packets_compressed: load(&self.packets),
            packets_skipped: load(&self.skipped),
            compress_nanos: load(&self.compress_nanos),
            packets_decompressed: load(&self.decompressed_packets),
            bytes_decompressed: load(&self.decompressed_bytes),
            decompress_nanos: load(&self.decompress_nanos),
            engine_fallbacks: load(&self.fallbacks),
            engine_failures: load(&self.failures),
        }
    }

    /// Zeroes every counter.
    pub fn reset(&self) {
        for counter in [
            &self.bytes_before,
            &self.bytes_after,
            &self.packets,
            &self.skipped,
            &self.compress_nanos,
            &self.decompressed_packets,
            &self.decompressed_bytes,
            &self.decompress_nanos,
            &self.fallbacks,
            &self.failures,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

/// Point-in-time compression counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CompressionSnapshot {
    /// Input bytes of packets that were compressed.
    pub bytes_before: u64,
    /// Output bytes of those packets.
    pub bytes_after: u64,
    /// Packets sent compressed.
    pub packets_compressed: u64,
    /// Packets that went out raw while compression was enabled, for any
    /// reason, including those under the threshold.
    pub packets_skipped: u64,
    /// Time spent compressing.
    pub compress_nanos: u64,
    /// Packets decompressed.
    pub packets_decompressed: u64,
    /// Bytes produced by decompression.
    pub bytes_decompressed: u64,
    /// Time spent decompressing.
    pub decompress_nanos: u64,
    /// Accelerated-engine failures retried on baseline.
    pub engine_fallbacks: u64,
    /// Attempts where every engine failed.
    pub engine_failures: u64,
}

impl CompressionSnapshot {
    /// Output over input for compressed packets (1.0 when nothing compressed).
    #[must_use]
    pub fn ratio(&self) -> f64 {
        if self.bytes_before == 0 {
            1.0
        } else {
            self.bytes_after as f64 / self.bytes_before as f64
        }
    }

    /// Bytes kept off the wire.
    #[must_use]
    pub const fn bytes_saved(&self) -> u64 {
        self.bytes_before.saturating_sub(self.bytes_after)
    }

    /// Mean compression time per compressed packet, in milliseconds.
    #[must_use]
    pub fn avg_compress_ms(&self) -> f64 {
        if self.packets_compressed == 0 {
            0.0
        } else {
            self.compress_nanos as f64 / (self.packets_compressed as f64 * 1_000_000.0)
        }
    }
}

impl fmt::Display for CompressionSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.packets_compressed == 0 {
            return write!(f, "No packets compressed yet ({} skipped)", self.packets_skipped);
        }
        write!(
            f,
            "Compressed {} packets ({} skipped), {} KB → {} KB ({:.1}% reduction, saved {:.1} KB, avg {:.2} ms/packet)",
            self.packets_compressed,
            self.packets_skipped,
            kb(self.bytes_before),
            kb(self.bytes_after),
            (1.0 - self.ratio()) * 100.0,
            self.bytes_saved() as f64 / 1024.0,
            self.avg_compress_ms(),
        )
    }
}

// =============================================================================
// Duplicate filter
// =============================================================================

/// Duplicate filter counters.
#[derive(Debug, Default)]
pub struct DuplicateStats {
    checked: AtomicU64,
    filtered: AtomicU64,
    resyncs: AtomicU64,
    cache_clears: AtomicU64,
    cache_entries: AtomicU64,
}

impl DuplicateStats {
    /// Creates zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_checked(&self) {
        add(&self.checked, 1);
    }

    pub(crate) fn record_filtered(&self) {
        add(&self.filtered, 1);
    }

    pub(crate) fn record_resync(&self) {
        add(&self.resyncs, 1);
    }

    pub(crate) fn record_cache_clear(&self) {
        add(&self.cache_clears, 1);
    }

    pub(crate) fn set_cache_entries(&self, entries: usize) {
        self.cache_entries.store(entries as u64, Ordering::Relaxed);
    }

    /// Copies the current values.
    #[must_use]
    pub fn snapshot(&self) -> DuplicateSnapshot {
        DuplicateSnapshot {
            checked: load(&self.checked),
            filtered: load(&self.filtered),
            resyncs: load(&self.resyncs),
            cache_clears: load(&self.cache_clears),
            cache_entries: load(&self.cache_entries),
        }
    }

    /// Zeroes every counter.
    pub fn reset(&self) {
        for counter in [
            &self.checked,
            &self.filtered,
            &self.resyncs,
            &self.cache_clears,
            &self.cache_entries,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

/// Point-in-time duplicate filter counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DuplicateSnapshot {
    /// Messages seen while filtering was enabled.
    pub checked: u64,
    /// Messages suppressed.
    pub filtered: u64,
    /// Duplicates forced through after a long run.
    pub resyncs: u64,
    /// Whole-cache clears.
    pub cache_clears: u64,
    /// Cache keys at the last update.
    pub cache_entries: u64,
}

impl DuplicateSnapshot {
    /// Share of checked messages that were suppressed, in percent.
    #[must_use]
    pub fn filtered_percent(&self) -> f64 {
        if self.checked == 0 {
            0.0
        } else {
            self.filtered as f64 * 100.0 / self.checked as f64
        }
    }
}

impl fmt::Display for DuplicateSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Duplicate packets: {}/{} ({:.1}%) filtered, {} resyncs, cache size: {}",
            self.filtered,
            self.checked,
            self.filtered_percent(),
            self.resyncs,
            self.cache_entries,
        )
    }
}

// =============================================================================
// Batching
// =============================================================================

/// Batching and transport counters.
#[derive(Debug, Default)]
pub struct BatchStats {
    packets_sent: AtomicU64,
    bytes_sent: AtomicU64,
    packets_received: AtomicU64,
    bytes_received: AtomicU64,
    packets_batched: AtomicU64,
    flushes: AtomicU64,
    batches: AtomicU64,
    largest_batch: AtomicU64,
    write_errors: AtomicU64,
}

impl BatchStats {
    /// Creates zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_sent(&self, bytes: usize) {
        add(&self.packets_sent, 1);
        add(&self.bytes_sent, bytes as u64);
    }

    /// Records an inbound packet. Called by the receive side.
    pub fn record_received(&self, bytes: usize) {
        add(&self.packets_received, 1);
        add(&self.bytes_received, bytes as u64);
    }

    pub(crate) fn record_batched(&self) {
        add(&self.packets_batched, 1);
    }

    pub(crate) fn record_flush(&self) {
        add(&self.flushes, 1);
    }

    pub(crate) fn record_batch(&self, size: usize) {
        add(&self.batches, 1);
        self.largest_batch.fetch_max(size as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_write_error(&self) {
        add(&self.write_errors, 1);
    }

    /// Copies the current values.
    #[must_use]
    pub fn snapshot(&self) -> BatchSnapshot {
        BatchSnapshot {
            packets_sent: load(&self.packets_sent),
            bytes_sent: load(&self.bytes_sent),
            packets_received: load(&self.packets_received),
            bytes_received: load(&self.bytes_received),
            packets_batched: load(&self.packets_batched),
            flushes: load(&self.flushes),
            batches: load(&self.batches),
            largest_batch: load(&self.largest_batch),
            write_errors: load(&self.write_errors),
        }
    }

    /// Zeroes every counter.
    pub fn reset(&self) {
        for counter in [
            &self.packets_sent,
            &self.bytes_sent,
            &self.packets_received,
            &self.bytes_received,
            &self.packets_batched,
            &self.flushes,
            &self.batches,
            &self.largest_batch,
            &self.write_errors,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

/// Point-in-time batching counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BatchSnapshot {
    /// Payloads written to transports.
    pub packets_sent: u64,
    /// Bytes written to transports.
    pub bytes_sent: u64,
    /// Packets received.
    pub packets_received: u64,
    /// Bytes received.
    pub bytes_received: u64,
    /// Payloads that waited in a queue instead of going out immediately.
    pub packets_batched: u64,
    /// Transport flushes issued.
    pub flushes: u64,
    /// Non-empty drains.
    pub batches: u64,
    /// Largest single drain.
    pub largest_batch: u64,
    /// Failed writes or flushes.
    pub write_errors: u64,
}

impl BatchSnapshot {
    /// Mean payloads per flush.
    #[must_use]
    pub fn packets_per_flush(&self) -> f64 {
        if self.flushes == 0 {
            0.0
        } else {
            self.packets_sent as f64 / self.flushes as f64
        }
    }
}

impl fmt::Display for BatchSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Sent: {} packets ({} KB), Received: {} packets ({} KB), Batched: {} packets, Flushes: {} ({:.1} packets/flush)",
            self.packets_sent,
            kb(self.bytes_sent),
            self.packets_received,
            kb(self.bytes_received),
            self.packets_batched,
            self.flushes,
            self.packets_per_flush(),
        )
    }
}

// =============================================================================
// Aggregator
// =============================================================================

/// Read-only view over every component's counters.
#[derive(Clone, Debug, Default)]
pub struct StatsAggregator {
    compression: Arc<CompressionStats>,
    duplicates: Arc<DuplicateStats>,
    batching: Arc<BatchStats>,
}

impl StatsAggregator {
    /// Wraps the components' stat blocks.
    #[must_use]
    pub fn new(
        compression: Arc<CompressionStats>,
        duplicates: Arc<DuplicateStats>,
        batching: Arc<BatchStats>,
    ) -> Self {
        Self {
            compression,
            duplicates,
            batching,
        }
    }

    /// Copies every counter.
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            compression: self.compression.snapshot(),
            duplicates: self.duplicates.snapshot(),
            batching: self.batching.snapshot(),
        }
    }

    /// Zeroes every counter.
    pub fn reset_all(&self) {
        self.compression.reset();
        self.duplicates.reset();
        self.batching.reset();
    }
}

/// Every component's counters at one point in time.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Compression counters.
    pub compression: CompressionSnapshot,
    /// Duplicate filter counters.
    pub duplicates: DuplicateSnapshot,
    /// Batching counters.
    pub batching: BatchSnapshot,
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.compression)?;
        writeln!(f, "{}", self.duplicates)?;
        write!(f, "{}", self.batching)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compression_report() {
        let stats = CompressionStats::new();
        assert_eq!(stats.snapshot().to_string(), "No packets compressed yet (0 skipped)");

        stats.record_compressed(4096, 1024, Duration::from_millis(2));
        stats.record_compressed(4096, 1024, Duration::from_millis(2));
        stats.record_skipped();

        let snap = stats.snapshot();
        assert_eq!(snap.bytes_saved(), 6144);
        assert!((snap.ratio() - 0.25).abs() < f64::EPSILON);
        assert_eq!(
            snap.to_string(),
            "Compressed 2 packets (1 skipped), 8 KB → 2 KB (75.0% reduction, saved 6.0 KB, avg 2.00 ms/packet)"
        );
    }

    #[test]
    fn test_duplicate_report() {
        let stats = DuplicateStats::new();
        for _ in 0..4 {
            stats.record_checked();
        }
        stats.record_filtered();
        stats.set_cache_entries(3);

        assert_eq!(
            stats.snapshot().to_string(),
            "Duplicate packets: 1/4 (25.0%) filtered, 0 resyncs, cache size: 3"
        );
    }

    #[test]
    fn test_largest_batch_is_max() {
        let stats = BatchStats::new();
        stats.record_batch(3);
        stats.record_batch(9);
        stats.record_batch(4);
        assert_eq!(stats.snapshot().largest_batch, 9);
        assert_eq!(stats.snapshot().batches, 3);
    }

    #[test]
    fn test_reset_all_zeroes_everything() {
        let aggregator = StatsAggregator::default();
        let compression = Arc::clone(&aggregator.compression);
        compression.record_compressed(10, 5, Duration::from_micros(1));
        compression.record_fallback();
        aggregator.duplicates.record_checked();
        aggregator.batching.record_sent(100);
        aggregator.batching.record_received(50);

        assert_ne!(aggregator.snapshot(), StatsSnapshot::default());
        aggregator.reset_all();
        assert_eq!(aggregator.snapshot(), StatsSnapshot::default());
    }
}
