//! # Compression Manager
//!
//! Decides whether a payload is compressed, by which engine, and what happens
//! when an engine fails.
//!
//! ## Policy
//!
//! ```text
//! payload ─► disabled or len < threshold ─────────────────────► raw (declared 0)
//!        └─► engine (thread-local) ─► not smaller ────────────► raw (declared 0)
//!                                 ├─► error (accelerated) ─► baseline ─► ...
//!                                 └─► smaller ────────────────► compressed (declared len)
//! ```
//!
//! A send never fails because of compression: the worst case is a raw frame.
//!
//! ## Engine Lifecycle
//!
//! Engines are never shared between threads. Each thread lazily builds its
//! own, keyed by manager, on first use. The manager keeps a registry of every
//! thread's slot, so [`CompressionManager::shutdown`] closes all of them at
//! once, whichever thread calls it. A thread that exits closes its own.

use std::borrow::Cow;
use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use parking_lot::Mutex;

use super::accelerated::AcceleratedEngine;
use super::adaptive::AdaptiveThreshold;
use super::baseline::BaselineEngine;
use super::engine::{CompressionEngine, CompressionFormat, EngineKind, EngineSelection};
use crate::config::TickwireConfig;
use crate::error::{EngineError, TickwireError, TickwireResult};
use crate::protocol::frame::encode_frame;
use crate::protocol::varint;
use crate::stats::CompressionStats;
use crate::MAX_UNCOMPRESSED_SIZE;

#[cfg(feature = "stats-logging")]
const STATS_LOG_INTERVAL: u64 = 10_000;

static NEXT_MANAGER_ID: AtomicU64 = AtomicU64::new(1);

/// Result of [`CompressionManager::compress`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Compressed<'a> {
    /// Original length, or 0 when `payload` is the unchanged input.
    pub declared_length: u32,
    /// Bytes to put after the header.
    pub payload: Cow<'a, [u8]>,
}

impl Compressed<'_> {
    /// Returns true if the payload was compressed.
    #[inline]
    #[must_use]
    pub const fn is_compressed(&self) -> bool {
        self.declared_length != 0
    }

    /// Writes the frame (`varint(declared_length) || payload`).
    pub fn write_frame(&self, out: &mut Vec<u8>) {
        encode_frame(self.declared_length, &self.payload, out);
    }
}

// =============================================================================
// Thread-local engines
// =============================================================================

#[derive(Default)]
struct EngineSlot {
    baseline: Option<BaselineEngine>,
    accelerated: Option<AcceleratedEngine>,
}

impl Drop for EngineSlot {
    fn drop(&mut self) {
        if let Some(engine) = self.baseline.as_mut() {
            engine.close();
        }
        if let Some(engine) = self.accelerated.as_mut() {
            engine.close();
        }
    }
}

/// One thread's engines for one manager. `None` once released.
type SharedSlot = Arc<Mutex<Option<EngineSlot>>>;

/// Thread-local handle on a slot; releases the engines at thread exit.
struct LocalSlot(SharedSlot);

impl LocalSlot {
    fn is_live(&self) -> bool {
        self.0.lock().is_some()
    }
}

impl Drop for LocalSlot {
    fn drop(&mut self) {
        drop(self.0.lock().take());
    }
}

thread_local! {
    static ENGINES: RefCell<HashMap<u64, LocalSlot>> = RefCell::new(HashMap::new());
}

fn accelerated_available() -> bool {
    static AVAILABLE: OnceLock<bool> = OnceLock::new();
    *AVAILABLE.get_or_init(AcceleratedEngine::probe)
}

/// Resolves a selection to a concrete engine.
fn resolve_engine(selection: EngineSelection, use_native: bool, available: bool) -> EngineKind {
    let usable = available && use_native;
    match selection {
        EngineSelection::Auto if usable => EngineKind::Accelerated,
        EngineSelection::Auto | EngineSelection::Baseline => EngineKind::Baseline,
        EngineSelection::Accelerated if usable => EngineKind::Accelerated,
        EngineSelection::Accelerated => {
            tracing::warn!(
                available,
                use_native,
                "accelerated compression engine requested but not usable, falling back to baseline"
            );
            EngineKind::Baseline
        }
    }
}

// =============================================================================
// Manager
// =============================================================================

/// Compression policy, engines and statistics.
pub struct CompressionManager {
    id: u64,
    retired: AtomicBool,
    // Every thread's slot for this manager.
    slots: Mutex<Vec<SharedSlot>>,
    enabled: bool,
    engine: EngineKind,
    format: CompressionFormat,
    level: u32,
    advanced_level: u32,
    validate: bool,
    threshold: AdaptiveThreshold,
    stats: Arc<CompressionStats>,
}

impl CompressionManager {
    /// Builds a manager from configuration.
    ///
    /// # Errors
    ///
    /// [`TickwireError::InvalidConfig`] for out-of-range levels.
    pub fn new(config: &TickwireConfig) -> TickwireResult<Self> {
        Self::with_availability(config, accelerated_available())
    }

    /// Builds a manager with an explicit answer to "is the accelerated
    /// engine usable in this process".
    ///
    /// # Errors
    ///
    /// [`TickwireError::InvalidConfig`] for out-of-range levels.
    pub fn with_availability(config: &TickwireConfig, accelerated_available: bool) -> TickwireResult<Self> {
        let invalid = |e: EngineError| TickwireError::InvalidConfig(e.to_string());
        BaselineEngine::new(config.compression_level).map_err(invalid)?;
        AcceleratedEngine::new(config.advanced_compression_level).map_err(invalid)?;

        let engine = resolve_engine(
            config.compression_engine,
            config.use_native_compression,
            accelerated_available,
        );
        let manager = Self {
            id: NEXT_MANAGER_ID.fetch_add(1, Ordering::Relaxed),
            retired: AtomicBool::new(false),
            slots: Mutex::new(Vec::new()),
            enabled: config.enable_compression,
            engine,
            format: config.compression_format,
            level: config.compression_level,
            advanced_level: config.advanced_compression_level,
            validate: config.validate_decompressed_size,
            threshold: AdaptiveThreshold::new(
                config.min_packet_size_to_compress,
                config.enable_adaptive_compression,
            ),
            stats: Arc::new(CompressionStats::new()),
        };

        tracing::info!(
            engine = manager.implementation_name(),
            format = %manager.format,
            level = manager.active_level(),
            adaptive = config.enable_adaptive_compression,
            threshold = config.min_packet_size_to_compress,
            enabled = manager.enabled,
            "compression manager ready"
        );
        Ok(manager)
    }

    /// Engine that `Auto` (or an explicit selection) resolved to.
    #[inline]
    #[must_use]
    pub const fn active_engine(&self) -> EngineKind {
        self.engine
    }

    /// Name of the library behind the active engine.
    #[must_use]
    pub const fn implementation_name(&self) -> &'static str {
        match self.engine {
            EngineKind::Baseline => "flate2",
            EngineKind::Accelerated => "lz4_flex",
        }
    }

    /// Level of the active engine.
    #[must_use]
    pub const fn active_level(&self) -> u32 {
        match self.engine {
            EngineKind::Baseline => self.level,
            EngineKind::Accelerated => self.advanced_level,
        }
    }

    /// Container format for the baseline engine.
    #[inline]
    #[must_use]
    pub const fn format(&self) -> CompressionFormat {
        self.format
    }

    /// Returns true if outbound compression is switched on.
    #[inline]
    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Current effective threshold (may float above the minimum).
    #[inline]
    #[must_use]
    pub fn threshold(&self) -> u32 {
        self.threshold.current()
    }

    /// Configured minimum; the bound inbound frames are validated against.
    #[inline]
    #[must_use]
    pub const fn min_threshold(&self) -> u32 {
        self.threshold.floor()
    }

    /// Returns true if inbound declared sizes are validated.
    #[inline]
    #[must_use]
    pub const fn validates_decompressed_size(&self) -> bool {
        self.validate
    }

    /// Shared counters.
    #[must_use]
    pub fn stats(&self) -> Arc<CompressionStats> {
        Arc::clone(&self.stats)
    }

    /// Returns true once [`shutdown`](Self::shutdown) has run.
    #[inline]
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }

    /// Compresses `input` if it is worth it.
    ///
    /// Never fails: any engine problem results in the input going out raw.
    /// Inputs over [`MAX_UNCOMPRESSED_SIZE`] also come back raw; callers
    /// framing for the wire reject them first.
    pub fn compress<'a>(&self, input: &'a [u8]) -> Compressed<'a> {
        let raw = Compressed {
            declared_length: 0,
            payload: Cow::Borrowed(input),
        };
        if !self.enabled || self.is_shut_down() {
            return raw;
        }
        if input.len() < self.threshold.current() as usize || input.len() > MAX_UNCOMPRESSED_SIZE {
            self.stats.record_skipped();
            return raw;
        }

        let start = Instant::now();
        let attempt = match self.try_compress(self.engine, input) {
            Err(e) if self.engine == EngineKind::Accelerated => {
                tracing::debug!(error = %e, "accelerated compression failed, retrying on baseline");
                self.stats.record_fallback();
                self.try_compress(EngineKind::Baseline, input)
            }
            other => other,
        };

        match attempt {
            Ok(Some(data)) => {
                self.stats.record_compressed(input.len(), data.len(), start.elapsed());
                self.threshold.record(input.len(), Some(data.len()));
                tracing::trace!(before = input.len(), after = data.len(), "compressed payload");
                self.maybe_log_stats();
                Compressed {
                    declared_length: input.len() as u32,
                    payload: Cow::Owned(data),
                }
            }
            Ok(None) => {
                self.stats.record_skipped();
                self.threshold.record(input.len(), None);
                raw
            }
            Err(e) => {
                tracing::debug!(error = %e, len = input.len(), "compression failed, sending raw");
                self.stats.record_failure();
                self.stats.record_skipped();
                raw
            }
        }
    }

    /// Decompresses a payload whose frame declared `known_size`.
    ///
    /// # Errors
    ///
    /// [`TickwireError::DeclaredOverCap`] for sizes over the hard cap and
    /// [`TickwireError::Decompression`] when every engine fails or the
    /// manager has been shut down.
    pub fn decompress(&self, input: &[u8], known_size: usize) -> TickwireResult<Vec<u8>> {
        if self.is_shut_down() {
            return Err(EngineError::Closed { engine: self.engine.name() }.into());
        }
        if known_size > MAX_UNCOMPRESSED_SIZE {
            return Err(TickwireError::DeclaredOverCap {
                declared: u32::try_from(known_size).unwrap_or(u32::MAX),
                max: MAX_UNCOMPRESSED_SIZE as u32,
            });
        }

        let start = Instant::now();
        let result = match self.try_decompress(self.engine, input, known_size) {
            Err(e) if self.engine == EngineKind::Accelerated => {
                tracing::debug!(error = %e, "accelerated decompression failed, retrying on baseline");
                self.stats.record_fallback();
                self.try_decompress(EngineKind::Baseline, input, known_size)
            }
            other => other,
        };

        match result {
            Ok(output) => {
                self.stats.record_decompressed(output.len(), start.elapsed());
                Ok(output)
            }
            Err(e) => {
                self.stats.record_failure();
                Err(e.into())
            }
        }
    }

    /// Retires the manager and closes the engines of every thread.
    ///
    /// Waits for calls already inside an engine to finish. Afterwards
    /// `compress` passes everything through raw and `decompress` fails.
    /// Idempotent.
    pub fn shutdown(&self) {
        if self.retired.swap(true, Ordering::AcqRel) {
            return;
        }
        let slots = std::mem::take(&mut *self.slots.lock());
        let released = slots.iter().filter_map(|slot| slot.lock().take()).count();
        let _ = ENGINES.try_with(|local| local.borrow_mut().remove(&self.id));
        tracing::info!(id = self.id, released, "compression manager shut down");
    }

    /// Registers a slot for the calling thread. `None` once shut down.
    fn register_slot(&self) -> Option<SharedSlot> {
        let mut slots = self.slots.lock();
        // Checked under the registry lock that shutdown takes after retiring.
        if self.is_shut_down() {
            return None;
        }
        // Drop entries whose thread has exited.
        slots.retain(|slot| Arc::strong_count(slot) > 1);
        let slot: SharedSlot = Arc::new(Mutex::new(Some(EngineSlot::default())));
        slots.push(Arc::clone(&slot));
        Some(slot)
    }

    fn try_compress(&self, kind: EngineKind, input: &[u8]) -> Result<Option<Vec<u8>>, EngineError> {
        let format = self.format;
        self.with_engine(kind, |engine| {
            let bound = engine.compress_bound(input.len(), format);
            let bound = usize::try_from(bound).map_err(|_| EngineError::BoundTooLarge { bound })?;
            let mut output = vec![0u8; bound];
            let written = engine.compress(input, &mut output, format)?;
            // The compressed frame must come out smaller than the raw one.
            let header = varint::byte_len(input.len() as u32);
            if written == 0 || written + header > input.len() {
                return Ok(None);
            }
            output.truncate(written);
            Ok(Some(output))
        })
    }

    fn try_decompress(&self, kind: EngineKind, input: &[u8], known_size: usize) -> Result<Vec<u8>, EngineError> {
        let format = self.format;
        self.with_engine(kind, |engine| {
            let mut output = vec![0u8; known_size];
            engine.decompress(input, &mut output, format, Some(known_size))?;
            Ok(output)
        })
    }

    /// Runs `f` with this thread's engine of `kind`, building it if needed.
    fn with_engine<R>(
        &self,
        kind: EngineKind,
        f: impl FnOnce(&mut dyn CompressionEngine) -> Result<R, EngineError>,
    ) -> Result<R, EngineError> {
        let unavailable = EngineError::Unavailable { engine: kind.name() };
        let closed = EngineError::Closed { engine: kind.name() };
        ENGINES
            .try_with(|local| {
                let mut local = local.borrow_mut();
                if self.is_shut_down() {
                    local.remove(&self.id);
                    return Err(closed);
                }
                if !local.contains_key(&self.id) {
                    // New slot: forget slots released by retired managers.
                    local.retain(|_, slot| slot.is_live());
                    let Some(slot) = self.register_slot() else {
                        return Err(closed);
                    };
                    local.insert(self.id, LocalSlot(slot));
                }
                let shared = match local.get(&self.id) {
                    Some(slot) => Arc::clone(&slot.0),
                    None => return Err(unavailable),
                };
                drop(local);

                let mut guard = shared.lock();
                // Released by a concurrent shutdown.
                let Some(slot) = guard.as_mut() else {
                    return Err(closed);
                };

                let engine: &mut dyn CompressionEngine = match kind {
                    EngineKind::Baseline => {
                        if slot.baseline.is_none() {
                            slot.baseline = Some(BaselineEngine::new(self.level)?);
                        }
                        match slot.baseline.as_mut() {
                            Some(engine) => engine,
                            None => return Err(unavailable),
                        }
                    }
                    EngineKind::Accelerated => {
                        if slot.accelerated.is_none() {
                            slot.accelerated = Some(AcceleratedEngine::new(self.advanced_level)?);
                        }
                        match slot.accelerated.as_mut() {
                            Some(engine) => engine,
                            None => return Err(unavailable),
                        }
                    }
                };
                f(engine)
            })
            .unwrap_or_else(|_| Err(EngineError::Unavailable { engine: kind.name() }))
    }

    #[cfg(feature = "stats-logging")]
    fn maybe_log_stats(&self) {
        let snapshot = self.stats.snapshot();
        if snapshot.packets_compressed % STATS_LOG_INTERVAL == 0 {
            tracing::debug!(threshold = self.threshold.current(), "{snapshot}");
        }
    }

    #[cfg(not(feature = "stats-logging"))]
    #[inline]
    fn maybe_log_stats(&self) {}
}

impl Drop for CompressionManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for CompressionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompressionManager")
            .field("id", &self.id)
            .field("engine", &self.engine)
            .field("format", &self.format)
            .field("enabled", &self.enabled)
            .field("threshold", &self.threshold.current())
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

/// Number of live engine slots on the calling thread.
#[cfg(test)]
pub(crate) fn thread_slot_count() -> usize {
    ENGINES.with(|local| local.borrow().values().filter(|slot| slot.is_live()).count())
}

#[cfg(test)]
impl CompressionManager {
    /// Slots of any thread still holding engines.
    fn live_slot_count(&self) -> usize {
        self.slots.lock().iter().filter(|slot| slot.lock().is_some()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> TickwireConfig {
        TickwireConfig {
            enable_adaptive_compression: false,
            ..TickwireConfig::default()
        }
    }

    fn compressible(len: usize) -> Vec<u8> {
        b"entity 42 moved to (10.5, 64.0, -3.25) yaw 90 pitch 0; "
            .iter()
            .copied()
            .cycle()
            .take(len)
            .collect()
    }

    fn noise(len: usize) -> Vec<u8> {
        let mut state = 0x9E37_79B9u32;
        (0..len)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 17;
                state ^= state << 5;
                state as u8
            })
            .collect()
    }

    #[test]
    fn test_engine_resolution() {
        use EngineSelection::{Accelerated, Auto, Baseline};
        assert_eq!(resolve_engine(Auto, true, true), EngineKind::Accelerated);
        assert_eq!(resolve_engine(Auto, false, true), EngineKind::Baseline);
        assert_eq!(resolve_engine(Auto, true, false), EngineKind::Baseline);
        assert_eq!(resolve_engine(Baseline, true, true), EngineKind::Baseline);
        assert_eq!(resolve_engine(Accelerated, true, true), EngineKind::Accelerated);
        assert_eq!(resolve_engine(Accelerated, true, false), EngineKind::Baseline);
        assert_eq!(resolve_engine(Accelerated, false, true), EngineKind::Baseline);
    }

    #[test]
    fn test_below_threshold_is_raw() {
        let manager = CompressionManager::new(&config()).unwrap();
        let input = compressible(255);
        let out = manager.compress(&input);
        assert!(!out.is_compressed());
        assert!(matches!(out.payload, Cow::Borrowed(_)));
        assert_eq!(manager.stats().snapshot().packets_skipped, 1);
    }

    #[test]
    fn test_disabled_is_raw() {
        let manager = CompressionManager::new(&TickwireConfig {
            enable_compression: false,
            ..config()
        })
        .unwrap();
        let input = compressible(4096);
        assert!(!manager.compress(&input).is_compressed());
    }

    #[test]
    fn test_round_trip_both_engines() {
        for selection in [EngineSelection::Baseline, EngineSelection::Accelerated] {
            let manager = CompressionManager::with_availability(
                &TickwireConfig {
                    compression_engine: selection,
                    ..config()
                },
                true,
            )
            .unwrap();
            let input = compressible(4096);
            let out = manager.compress(&input);
            assert!(out.is_compressed(), "{selection:?}");
            assert_eq!(out.declared_length, 4096);
            assert!(out.payload.len() < input.len());

            let restored = manager.decompress(&out.payload, out.declared_length as usize).unwrap();
            assert_eq!(restored, input);
        }
    }

    #[test]
    fn test_incompressible_goes_raw() {
        let manager = CompressionManager::new(&config()).unwrap();
        let input = noise(2048);
        let out = manager.compress(&input);
        assert!(!out.is_compressed());
        assert_eq!(out.payload.as_ref(), input.as_slice());
    }

    #[test]
    fn test_accelerated_decompress_falls_back_to_baseline() {
        let sender = CompressionManager::with_availability(
            &TickwireConfig {
                compression_engine: EngineSelection::Baseline,
                ..config()
            },
            true,
        )
        .unwrap();
        let receiver = CompressionManager::with_availability(
            &TickwireConfig {
                compression_engine: EngineSelection::Accelerated,
                ..config()
            },
            true,
        )
        .unwrap();
        assert_eq!(receiver.active_engine(), EngineKind::Accelerated);

        let input = compressible(8192);
        let out = sender.compress(&input);
        let restored = receiver.decompress(&out.payload, input.len()).unwrap();
        assert_eq!(restored, input);
        assert_eq!(receiver.stats().snapshot().engine_fallbacks, 1);
    }

    #[test]
    fn test_decompress_wrong_size_fails() {
        let manager = CompressionManager::new(&config()).unwrap();
        let input = compressible(4096);
        let out = manager.compress(&input);
        let err = manager.decompress(&out.payload, 4000).unwrap_err();
        assert!(matches!(err, TickwireError::Decompression(_)));
        assert!(err.is_protocol_violation());
    }

    #[test]
    fn test_decompress_over_cap() {
        let manager = CompressionManager::new(&config()).unwrap();
        assert!(matches!(
            manager.decompress(&[1, 2, 3], MAX_UNCOMPRESSED_SIZE + 1),
            Err(TickwireError::DeclaredOverCap { .. })
        ));
    }

    #[test]
    fn test_shutdown_releases_engines() {
        let manager = CompressionManager::new(&config()).unwrap();
        let before = thread_slot_count();
        let input = compressible(4096);
        assert!(manager.compress(&input).is_compressed());
        assert_eq!(thread_slot_count(), before + 1);

        manager.shutdown();
        manager.shutdown();
        assert_eq!(thread_slot_count(), before);
        assert!(!manager.compress(&input).is_compressed());
        assert!(manager.decompress(&[0], 10).is_err());
    }

    #[test]
    fn test_shutdown_releases_other_threads_engines() {
        let manager = Arc::new(CompressionManager::new(&config()).unwrap());
        let input = compressible(4096);
        let (compressed_tx, compressed_rx) = crossbeam_channel::bounded::<()>(0);
        let (shut_down_tx, shut_down_rx) = crossbeam_channel::bounded::<()>(0);

        let worker = {
            let manager = Arc::clone(&manager);
            let input = input.clone();
            std::thread::spawn(move || {
                assert!(manager.compress(&input).is_compressed());
                compressed_tx.send(()).unwrap();
                shut_down_rx.recv().unwrap();
                // Released without this thread touching any manager again.
                thread_slot_count()
            })
        };

        compressed_rx.recv().unwrap();
        assert_eq!(manager.live_slot_count(), 1);
        manager.shutdown();
        assert_eq!(manager.live_slot_count(), 0);

        shut_down_tx.send(()).unwrap();
        assert_eq!(worker.join().unwrap(), 0);
        assert!(!manager.compress(&input).is_compressed());
    }

    #[test]
    fn test_exited_thread_releases_its_engines() {
        let manager = Arc::new(CompressionManager::new(&config()).unwrap());
        let input = compressible(4096);
        {
            let manager = Arc::clone(&manager);
            let input = input.clone();
            std::thread::spawn(move || manager.compress(&input).is_compressed())
                .join()
                .unwrap();
        }
        assert_eq!(manager.live_slot_count(), 0);

        // The next registration prunes the dead thread's entry.
        assert!(manager.compress(&input).is_compressed());
        assert_eq!(manager.slots.lock().len(), 1);
    }

    #[test]
    fn test_stats_track_compression() {
        let manager = CompressionManager::new(&config()).unwrap();
        let input = compressible(4096);
        let _ = manager.compress(&input);
        let _ = manager.compress(&input[..100]);

        let snap = manager.stats().snapshot();
        assert_eq!(snap.packets_compressed, 1);
        assert_eq!(snap.bytes_before, 4096);
        assert!(snap.bytes_after < 4096);
        assert_eq!(snap.packets_skipped, 1);
    }

    #[test]
    fn test_frame_never_larger_than_raw_frame() {
        let manager = CompressionManager::new(&config()).unwrap();
        for input in [compressible(300), noise(300), compressible(70_000), noise(70_000)] {
            let mut frame = Vec::new();
            manager.compress(&input).write_frame(&mut frame);
            assert!(frame.len() <= input.len() + 1);
        }
    }
}
