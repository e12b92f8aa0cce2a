//! # Duplicate Filter
//!
//! Drops state-sync messages identical to the previous one of their type.
//!
//! ## Algorithm
//!
//! Per cache key, with `now` in milliseconds:
//!
//! ```text
//! now - last_seen > timeout ─► new window: record hash, pass
//! hash == last_hash        ─► run += 1
//!                              run > max_consecutive ─► resync: reset run, pass
//!                              otherwise             ─► suppress
//! hash != last_hash        ─► record hash, reset run, pass
//! (always) last_seen = now
//! ```
//!
//! So at most `max_consecutive` messages in a row are dropped, and identical
//! messages further apart than the timeout always pass.
//!
//! ## Scope
//!
//! With [`SuppressionScope::Global`] the key is the message type alone: an
//! update sent to one connection can suppress the same update to another.
//! [`SuppressionScope::PerDestination`] keys by `(type, destination)`.
//!
//! ## Bounds
//!
//! Every 1000 checks the cache size is compared to `max_cache_entries` and
//! the whole cache is dropped if it is over. The only cost of a clear is that
//! the next message of each type passes.

pub mod category;
pub mod fingerprint;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

pub use category::MessageCategory;
pub use fingerprint::{fingerprint, rolling_hash, Fingerprint, FingerprintError};

use crate::config::TickwireConfig;
use crate::stats::DuplicateStats;
use crate::transport::ConnectionId;

/// Checks between cache size inspections.
pub const CLEANUP_INTERVAL: u64 = 1000;

/// Cache key granularity.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuppressionScope {
    /// One entry per message type, shared by all destinations.
    #[default]
    Global,
    /// One entry per message type and destination.
    PerDestination,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
struct CacheKey {
    message_type: &'static str,
    destination: Option<ConnectionId>,
}

#[derive(Clone, Copy, Debug)]
struct CacheEntry {
    last_hash: i32,
    consecutive_duplicates: u32,
    last_seen_at_ms: i64,
}

/// Outcome of one check against a cache entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Verdict {
    Pass,
    Suppress,
    Resync,
}

impl CacheEntry {
    fn new(hash: i32, now_ms: i64) -> Self {
        Self {
            last_hash: hash,
            consecutive_duplicates: 0,
            last_seen_at_ms: now_ms,
        }
    }

    fn check_and_update(&mut self, hash: i32, now_ms: i64, timeout_ms: i64, max_consecutive: u32) -> Verdict {
        let verdict = if now_ms.saturating_sub(self.last_seen_at_ms) > timeout_ms {
            self.last_hash = hash;
            self.consecutive_duplicates = 0;
            Verdict::Pass
        } else if hash == self.last_hash {
            self.consecutive_duplicates += 1;
            if self.consecutive_duplicates > max_consecutive {
                self.consecutive_duplicates = 0;
                Verdict::Resync
            } else {
                Verdict::Suppress
            }
        } else {
            self.last_hash = hash;
            self.consecutive_duplicates = 0;
            Verdict::Pass
        };
        self.last_seen_at_ms = now_ms;
        verdict
    }
}

/// Per-type "last seen" cache deciding which messages to drop.
pub struct DuplicateFilter {
    enabled: bool,
    timeout_ms: i64,
    max_consecutive: u32,
    filter_position: bool,
    filter_chunk: bool,
    filter_entity: bool,
    scope: SuppressionScope,
    excluded_types: Vec<String>,
    max_cache_entries: usize,
    cache: DashMap<CacheKey, CacheEntry>,
    cleanup_counter: AtomicU64,
    epoch: Instant,
    stats: Arc<DuplicateStats>,
}

impl DuplicateFilter {
    /// Builds a filter from configuration.
    #[must_use]
    pub fn new(config: &TickwireConfig) -> Self {
        Self {
            enabled: config.enable_duplicate_filtering,
            timeout_ms: i64::try_from(config.duplicate_timeout_ms).unwrap_or(i64::MAX),
            max_consecutive: config.max_consecutive_duplicates,
            filter_position: config.filter_position_packets,
            filter_chunk: config.filter_chunk_packets,
            filter_entity: config.filter_entity_packets,
            scope: config.suppression_scope,
            excluded_types: config.excluded_types.clone(),
            max_cache_entries: config.max_cache_entries,
            cache: DashMap::new(),
            cleanup_counter: AtomicU64::new(0),
            epoch: Instant::now(),
            stats: Arc::new(DuplicateStats::new()),
        }
    }

    /// Milliseconds on the filter's monotonic clock.
    #[must_use]
    pub fn now_ms(&self) -> i64 {
        i64::try_from(self.epoch.elapsed().as_millis()).unwrap_or(i64::MAX)
    }

    /// Decides whether `message` to `destination` should be dropped.
    pub fn should_suppress<M: Fingerprint + ?Sized>(&self, message: &M, destination: ConnectionId) -> bool {
        self.should_suppress_at(message, destination, self.now_ms())
    }

    /// [`should_suppress`](Self::should_suppress) at an explicit time.
    pub fn should_suppress_at<M: Fingerprint + ?Sized>(
        &self,
        message: &M,
        destination: ConnectionId,
        now_ms: i64,
    ) -> bool {
        if !self.enabled {
            return false;
        }
        let message_type = message.message_type();
        if !self.should_filter_type(message_type) {
            self.stats.record_checked();
            return false;
        }
        self.check(message_type, fingerprint(message), destination, now_ms)
    }

    /// Lower-level check for callers that hash messages themselves.
    pub fn should_suppress_hash(
        &self,
        message_type: &'static str,
        hash: i32,
        destination: ConnectionId,
        now_ms: i64,
    ) -> bool {
        if !self.enabled {
            return false;
        }
        if !self.should_filter_type(message_type) {
            self.stats.record_checked();
            return false;
        }
        self.check(message_type, hash, destination, now_ms)
    }

    /// Returns true if messages of this type are subject to filtering.
    #[must_use]
    pub fn should_filter_type(&self, message_type: &str) -> bool {
        match MessageCategory::classify(message_type) {
            MessageCategory::Position => self.filter_position,
            MessageCategory::Chunk => self.filter_chunk,
            MessageCategory::Entity => self.filter_entity,
            MessageCategory::Other => {
                let short = category::short_name(message_type);
                !self
                    .excluded_types
                    .iter()
                    .any(|excluded| excluded == message_type || excluded == short)
            }
        }
    }

    fn check(&self, message_type: &'static str, hash: i32, destination: ConnectionId, now_ms: i64) -> bool {
        self.stats.record_checked();

        let key = CacheKey {
            message_type,
            destination: match self.scope {
                SuppressionScope::Global => None,
                SuppressionScope::PerDestination => Some(destination),
            },
        };

        // The entry guard holds a shard lock; it must be gone before the
        // cache size is read below.
        let (verdict, inserted) = match self.cache.entry(key) {
            Entry::Occupied(mut occupied) => (
                occupied
                    .get_mut()
                    .check_and_update(hash, now_ms, self.timeout_ms, self.max_consecutive),
                false,
            ),
            Entry::Vacant(vacant) => {
                vacant.insert(CacheEntry::new(hash, now_ms));
                (Verdict::Pass, true)
            }
        };

        match verdict {
            Verdict::Suppress => {
                self.stats.record_filtered();
                tracing::trace!(message_type, "filtered duplicate message");
            }
            Verdict::Resync => {
                self.stats.record_resync();
                tracing::trace!(message_type, "duplicate run limit hit, forcing resync");
            }
            Verdict::Pass => {}
        }

        if inserted {
            self.stats.set_cache_entries(self.cache.len());
        }
        self.cleanup_if_needed();

        verdict == Verdict::Suppress
    }

    fn cleanup_if_needed(&self) {
        let count = self.cleanup_counter.fetch_add(1, Ordering::Relaxed) + 1;
        if count % CLEANUP_INTERVAL != 0 {
            return;
        }
        let entries = self.cache.len();
        if entries > self.max_cache_entries {
            self.cache.clear();
            self.stats.record_cache_clear();
            self.stats.set_cache_entries(0);
            tracing::debug!(entries, max = self.max_cache_entries, "cleared duplicate cache");
        }
    }

    /// Active scope.
    #[must_use]
    pub const fn scope(&self) -> SuppressionScope {
        self.scope
    }

    /// Returns true if filtering is switched on.
    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Number of cache keys.
    #[must_use]
    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    /// Shared counters.
    #[must_use]
    pub fn stats(&self) -> Arc<DuplicateStats> {
        Arc::clone(&self.stats)
    }

    /// Clears the counters, the cache and the cleanup counter.
    pub fn reset(&self) {
        self.stats.reset();
        self.cache.clear();
        self.cleanup_counter.store(0, Ordering::Relaxed);
    }
}

impl std::fmt::Debug for DuplicateFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DuplicateFilter")
            .field("enabled", &self.enabled)
            .field("timeout_ms", &self.timeout_ms)
            .field("max_consecutive", &self.max_consecutive)
            .field("scope", &self.scope)
            .field("cache_len", &self.cache.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const POSITION: &str = "PlayerPositionUpdate";
    const CHUNK: &str = "ChunkData";
    const A: ConnectionId = ConnectionId(1);
    const B: ConnectionId = ConnectionId(2);

    fn filter() -> DuplicateFilter {
        DuplicateFilter::new(&TickwireConfig::default())
    }

    #[test]
    fn test_first_message_passes() {
        let filter = filter();
        assert!(!filter.should_suppress_hash(POSITION, 0, A, 0));
    }

    #[test]
    fn test_run_limit_forces_resync() {
        let filter = filter();
        let mut verdicts = Vec::new();
        for t in 0..10 {
            verdicts.push(filter.should_suppress_hash(POSITION, 42, A, t * 10));
        }
        // First passes, three suppressed, fourth duplicate forced through.
        assert_eq!(
            verdicts,
            vec![false, true, true, true, false, true, true, true, false, true]
        );
        let stats = filter.stats().snapshot();
        assert_eq!(stats.filtered, 7);
        assert_eq!(stats.resyncs, 2);
        assert_eq!(stats.checked, 10);
    }

    #[test]
    fn test_timeout_expiry() {
        let filter = filter();
        assert!(!filter.should_suppress_hash(POSITION, 7, A, 0));
        assert!(filter.should_suppress_hash(POSITION, 7, A, 500));
        // last_seen moved to 500; 1001 is past the window.
        assert!(!filter.should_suppress_hash(POSITION, 7, A, 1001));
        assert!(filter.should_suppress_hash(POSITION, 7, A, 1002));
    }

    #[test]
    fn test_extreme_timestamps_do_not_overflow() {
        let filter = filter();
        assert!(!filter.should_suppress_hash(POSITION, 7, A, i64::MIN));
        assert!(!filter.should_suppress_hash(POSITION, 7, A, i64::MAX));
        // A clock that jumps backwards stays inside the window.
        assert!(filter.should_suppress_hash(POSITION, 7, A, i64::MIN));
    }

    #[test]
    fn test_changed_hash_passes_and_resets_run() {
        let filter = filter();
        assert!(!filter.should_suppress_hash(POSITION, 1, A, 0));
        assert!(filter.should_suppress_hash(POSITION, 1, A, 1));
        assert!(!filter.should_suppress_hash(POSITION, 2, A, 2));
        assert!(filter.should_suppress_hash(POSITION, 2, A, 3));
    }

    #[test]
    fn test_global_scope_shares_entries() {
        let filter = filter();
        assert!(!filter.should_suppress_hash(CHUNK, 9, A, 0));
        // Same update to a different connection is dropped.
        assert!(filter.should_suppress_hash(CHUNK, 9, B, 1));
    }

    #[test]
    fn test_per_destination_scope() {
        let filter = DuplicateFilter::new(&TickwireConfig {
            suppression_scope: SuppressionScope::PerDestination,
            ..TickwireConfig::default()
        });
        assert!(!filter.should_suppress_hash(CHUNK, 9, A, 0));
        assert!(!filter.should_suppress_hash(CHUNK, 9, B, 1));
        assert!(filter.should_suppress_hash(CHUNK, 9, A, 2));
        assert_eq!(filter.cache_len(), 2);
    }

    #[test]
    fn test_category_toggles_and_exclusions() {
        let filter = DuplicateFilter::new(&TickwireConfig {
            filter_chunk_packets: false,
            excluded_types: vec!["KeepAlive".into()],
            ..TickwireConfig::default()
        });
        assert!(!filter.should_filter_type("BlockUpdate"));
        assert!(filter.should_filter_type("SetEntityMotion"));
        assert!(!filter.should_filter_type("net::KeepAlive"));
        assert!(filter.should_filter_type("ChatMessage"));

        for t in 0..5 {
            assert!(!filter.should_suppress_hash("BlockUpdate", 1, A, t));
            assert!(!filter.should_suppress_hash("net::KeepAlive", 1, A, t));
        }
        assert_eq!(filter.cache_len(), 0);
    }

    #[test]
    fn test_disabled_never_suppresses() {
        let filter = DuplicateFilter::new(&TickwireConfig {
            enable_duplicate_filtering: false,
            ..TickwireConfig::default()
        });
        for t in 0..5 {
            assert!(!filter.should_suppress_hash(POSITION, 1, A, t));
        }
        assert_eq!(filter.stats().snapshot().checked, 0);
    }

    #[test]
    fn test_cache_cleared_when_over_bound() {
        let filter = DuplicateFilter::new(&TickwireConfig {
            max_cache_entries: 10,
            suppression_scope: SuppressionScope::PerDestination,
            ..TickwireConfig::default()
        });
        for i in 0..999u32 {
            filter.should_suppress_hash(POSITION, 1, ConnectionId(i), 0);
        }
        assert_eq!(filter.cache_len(), 999);
        filter.should_suppress_hash(POSITION, 1, ConnectionId(5000), 0);
        assert_eq!(filter.cache_len(), 0);
        assert_eq!(filter.stats().snapshot().cache_clears, 1);
    }

    #[test]
    fn test_reset() {
        let filter = filter();
        filter.should_suppress_hash(POSITION, 1, A, 0);
        filter.should_suppress_hash(POSITION, 1, A, 1);
        filter.reset();
        assert_eq!(filter.cache_len(), 0);
        assert_eq!(filter.stats().snapshot(), crate::stats::DuplicateSnapshot::default());
        // Entry is gone, so the next one passes.
        assert!(!filter.should_suppress_hash(POSITION, 1, A, 2));
    }

    struct MoveUpdate {
        entity: u32,
        x: i16,
    }

    impl Fingerprint for MoveUpdate {
        fn write_fingerprint(&self, out: &mut Vec<u8>) -> Result<(), FingerprintError> {
            out.extend_from_slice(&self.entity.to_le_bytes());
            out.extend_from_slice(&self.x.to_le_bytes());
            Ok(())
        }
    }

    #[test]
    fn test_messages_through_fingerprint() {
        let filter = filter();
        let now = 100;
        assert!(!filter.should_suppress_at(&MoveUpdate { entity: 1, x: 5 }, A, now));
        assert!(filter.should_suppress_at(&MoveUpdate { entity: 1, x: 5 }, A, now + 1));
        assert!(!filter.should_suppress_at(&MoveUpdate { entity: 1, x: 6 }, A, now + 2));
    }
}
