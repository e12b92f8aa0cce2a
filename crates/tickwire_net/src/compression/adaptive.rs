//! Adaptive compression threshold.
//!
//! Packets just over the threshold are the ones most likely to waste a
//! compression attempt. When such an attempt fails to shrink the packet the
//! threshold steps up by an eighth; every attempt that halves its input lets
//! it decay by a sixteenth back toward the configured minimum.
//!
//! The threshold never goes below the configured minimum, so a receiver
//! validating declared sizes against that minimum always accepts our frames.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::MAX_ADAPTIVE_THRESHOLD;

/// Effective minimum size for compression.
#[derive(Debug)]
pub struct AdaptiveThreshold {
    floor: u32,
    ceiling: u32,
    enabled: bool,
    current: AtomicU32,
}

impl AdaptiveThreshold {
    /// Creates a threshold starting at `floor`.
    ///
    /// When `enabled` is false it stays at `floor` forever.
    #[must_use]
    pub fn new(floor: u32, enabled: bool) -> Self {
        Self {
            floor,
            ceiling: floor.max(MAX_ADAPTIVE_THRESHOLD),
            enabled,
            current: AtomicU32::new(floor),
        }
    }

    /// Current threshold.
    #[inline]
    #[must_use]
    pub fn current(&self) -> u32 {
        self.current.load(Ordering::Relaxed)
    }

    /// Configured minimum.
    #[inline]
    #[must_use]
    pub const fn floor(&self) -> u32 {
        self.floor
    }

    /// Records one compression attempt.
    ///
    /// `compressed_len` is `None` when the attempt did not shrink the input.
    pub fn record(&self, input_len: usize, compressed_len: Option<usize>) {
        if !self.enabled {
            return;
        }
        let threshold = self.current();

        match compressed_len {
            None if input_len < threshold as usize * 2 => {
                let raised = threshold
                    .saturating_add((threshold / 8).max(1))
                    .min(self.ceiling);
                if raised != threshold {
                    self.store(threshold, raised);
                    tracing::trace!(from = threshold, to = raised, "compression threshold raised");
                }
            }
            Some(out) if out * 2 <= input_len && threshold > self.floor => {
                let lowered = threshold
                    .saturating_sub((threshold / 16).max(1))
                    .max(self.floor);
                self.store(threshold, lowered);
                tracing::trace!(from = threshold, to = lowered, "compression threshold lowered");
            }
            _ => {}
        }
    }

    /// Returns to the configured minimum.
    pub fn reset(&self) {
        self.current.store(self.floor, Ordering::Relaxed);
    }

    fn store(&self, seen: u32, next: u32) {
        // Lost races only mean one adjustment is skipped.
        let _ = self
            .current
            .compare_exchange(seen, next, Ordering::Relaxed, Ordering::Relaxed);
    }
}
