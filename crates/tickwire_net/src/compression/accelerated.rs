//! # Accelerated Engine
//!
//! LZ4 block codec via `lz4_flex`. Much faster than DEFLATE at a worse
//! ratio, which is the right trade for per-tick packets.
//!
//! The block format carries no container, so the configured
//! [`CompressionFormat`] is ignored and both peers must run this engine.
//! Blocks also carry no length, which is why decompression needs the
//! declared size from the frame header.

use lz4_flex::block;

use super::engine::{check_known_size, CompressionEngine, CompressionFormat, EngineKind};
use crate::error::EngineError;

const NAME: &str = "accelerated";

/// Highest accepted level.
pub const MAX_LEVEL: u32 = 12;

/// LZ4 block engine.
#[derive(Debug)]
pub struct AcceleratedEngine {
    level: u32,
    closed: bool,
}

impl AcceleratedEngine {
    /// Creates an engine.
    ///
    /// The block codec has a single speed setting; `level` (0-12) is
    /// validated and reported but does not change the output.
    ///
    /// # Errors
    ///
    /// [`EngineError::InvalidLevel`] outside 0-12.
    pub fn new(level: u32) -> Result<Self, EngineError> {
        if level > MAX_LEVEL {
            return Err(EngineError::InvalidLevel {
                engine: NAME,
                level,
                min: 0,
                max: MAX_LEVEL,
            });
        }
        Ok(Self { level, closed: false })
    }

    /// Configured level.
    #[must_use]
    pub const fn level(&self) -> u32 {
        self.level
    }

    /// Runs a small round trip to confirm the codec works in this process.
    #[must_use]
    pub fn probe() -> bool {
        let input = [0x5Au8; 256];
        let mut engine = match Self::new(0) {
            Ok(engine) => engine,
            Err(_) => return false,
        };
        let bound = engine.compress_bound(input.len(), CompressionFormat::default()) as usize;
        let mut compressed = vec![0u8; bound];
        let n = match engine.compress(&input, &mut compressed, CompressionFormat::default()) {
            Ok(n) if n > 0 => n,
            _ => return false,
        };
        let mut restored = [0u8; 256];
        matches!(
            engine.decompress(&compressed[..n], &mut restored, CompressionFormat::default(), Some(256)),
            Ok(256)
        ) && restored == input
    }

    fn ensure_open(&self) -> Result<(), EngineError> {
        if self.closed {
            Err(EngineError::Closed { engine: NAME })
        } else {
            Ok(())
        }
    }
}

impl CompressionEngine for AcceleratedEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Accelerated
    }

    fn compress_bound(&self, max_input_size: usize, _format: CompressionFormat) -> u64 {
        // At least lz4_flex's own bound, in u64 so it cannot wrap.
        let len = max_input_size as u64;
        16 + 4 + len * 110 / 100 + 1
    }

    fn compress(
        &mut self,
        input: &[u8],
        output: &mut [u8],
        _format: CompressionFormat,
    ) -> Result<usize, EngineError> {
        self.ensure_open()?;
        // The block codec only fails on an undersized output.
        Ok(block::compress_into(input, output).unwrap_or(0))
    }

    fn decompress(
        &mut self,
        input: &[u8],
        output: &mut [u8],
        _format: CompressionFormat,
        known_size: Option<usize>,
    ) -> Result<usize, EngineError> {
        self.ensure_open()?;
        let written = block::decompress_into(input, output).map_err(|e| EngineError::Decompress {
            engine: NAME,
            reason: e.to_string(),
        })?;
        check_known_size(EngineKind::Accelerated, written, known_size)
    }

    fn close(&mut self) {
        self.closed = true;
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}
