//! Engine trait and the shared enums around it.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// DEFLATE container used by the baseline engine.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionFormat {
    /// Raw DEFLATE, no header or checksum.
    Deflate,
    /// Zlib: 2-byte header, Adler-32 trailer.
    #[default]
    Zlib,
    /// Gzip: 10-byte header, CRC-32 and size trailer.
    Gzip,
}

impl CompressionFormat {
    /// Header plus trailer bytes the container adds around the DEFLATE body.
    #[must_use]
    pub const fn wrapper_overhead(self) -> u64 {
        match self {
            Self::Deflate => 0,
            Self::Zlib => 6,
            Self::Gzip => 18,
        }
    }

    /// Lowercase name, as written in config files.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Deflate => "deflate",
            Self::Zlib => "zlib",
            Self::Gzip => "gzip",
        }
    }
}

impl fmt::Display for CompressionFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which engine the configuration asks for.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineSelection {
    /// Accelerated when available and permitted, baseline otherwise.
    #[default]
    Auto,
    /// Always the baseline engine.
    Baseline,
    /// The accelerated engine; falls back to baseline if unavailable.
    Accelerated,
}

/// A concrete engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EngineKind {
    /// DEFLATE family via flate2.
    Baseline,
    /// LZ4 block codec.
    Accelerated,
}

impl EngineKind {
    /// Engine name used in logs and errors.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Baseline => "baseline",
            Self::Accelerated => "accelerated",
        }
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A buffer-to-buffer compressor.
///
/// Instances own their codec state and are used from one thread only; the
/// manager keeps one per thread. Once [`close`](Self::close) has been called
/// every other method fails with [`EngineError::Closed`].
pub trait CompressionEngine {
    /// Which engine this is.
    fn kind(&self) -> EngineKind;

    /// Worst-case output size for `max_input_size` input bytes.
    ///
    /// Returned as u64 so a bound past the address space can be detected
    /// rather than wrapped.
    fn compress_bound(&self, max_input_size: usize, format: CompressionFormat) -> u64;

    /// Compresses `input` into `output`.
    ///
    /// Returns the number of bytes written, or `Ok(0)` if `output` was too
    /// small to hold the result.
    ///
    /// # Errors
    ///
    /// Codec failure or a closed engine.
    fn compress(
        &mut self,
        input: &[u8],
        output: &mut [u8],
        format: CompressionFormat,
    ) -> Result<usize, EngineError>;

    /// Decompresses `input` into `output`.
    ///
    /// With `known_size` set, anything other than exactly that many output
    /// bytes is an error.
    ///
    /// # Errors
    ///
    /// Corrupt input, a size mismatch, or a closed engine.
    fn decompress(
        &mut self,
        input: &[u8],
        output: &mut [u8],
        format: CompressionFormat,
        known_size: Option<usize>,
    ) -> Result<usize, EngineError>;

    /// Releases codec state. Idempotent.
    fn close(&mut self);

    /// Returns true once closed.
    fn is_closed(&self) -> bool;
}

/// Checks a decompressed length against the expected size.
pub(crate) fn check_known_size(
    engine: EngineKind,
    written: usize,
    known_size: Option<usize>,
) -> Result<usize, EngineError> {
    match known_size {
        Some(expected) if expected != written => Err(EngineError::Decompress {
            engine: engine.name(),
            reason: format!("expected {expected} bytes, got {written}"),
        }),
        _ => Ok(written),
    }
}
