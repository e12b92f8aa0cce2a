//! # Error Types
//!
//! Everything that can go wrong between the message layer and the socket.
//!
//! Two families matter to the host:
//!
//! - **Protocol violations** are fatal for the offending connection only.
//!   The host must translate them into a connection close.
//! - **Engine failures** never reach the host on the send path; the
//!   compression manager retries on the baseline engine. They only surface
//!   from `decompress` once every engine has been tried.

use thiserror::Error;

/// Errors produced by a single compression engine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// The engine has already been closed.
    #[error("{engine} engine already closed")]
    Closed {
        /// Engine name.
        engine: &'static str,
    },

    /// The worst-case output bound does not fit in addressable memory.
    #[error("compress bound of {bound} bytes exceeds addressable memory")]
    BoundTooLarge {
        /// Bound reported by the engine.
        bound: u64,
    },

    /// Compression level outside the engine's supported range.
    #[error("invalid compression level {level} for {engine} (supported {min}..={max})")]
    InvalidLevel {
        /// Engine name.
        engine: &'static str,
        /// Requested level.
        level: u32,
        /// Lowest supported level.
        min: u32,
        /// Highest supported level.
        max: u32,
    },

    /// The underlying codec failed to compress.
    #[error("{engine} compression failed: {reason}")]
    Compress {
        /// Engine name.
        engine: &'static str,
        /// Codec message.
        reason: String,
    },

    /// The input is corrupt or does not decode to the expected size.
    #[error("{engine} decompression failed: {reason}")]
    Decompress {
        /// Engine name.
        engine: &'static str,
        /// Codec message.
        reason: String,
    },

    /// The engine is not available in this process.
    #[error("{engine} engine unavailable")]
    Unavailable {
        /// Engine name.
        engine: &'static str,
    },
}

/// Errors that can occur in the pipeline.
#[derive(Error, Debug)]
pub enum TickwireError {
    /// A varint ran past its maximum byte length without terminating.
    #[error("varint too big")]
    VarintTooBig,

    /// A frame ended inside its length header.
    #[error("truncated frame header")]
    TruncatedHeader,

    /// A frame declared a length that can never be valid.
    #[error("bad packet length: {0}")]
    BadLength(u64),

    /// A compressed frame declared an original size below the threshold.
    #[error("badly compressed packet - size of {declared} is below threshold of {threshold}")]
    DeclaredBelowThreshold {
        /// Declared uncompressed size.
        declared: u32,
        /// Active compression threshold.
        threshold: u32,
    },

    /// A frame declared an original size above the hard cap.
    #[error("badly compressed packet - size of {declared} is larger than maximum of {max}")]
    DeclaredOverCap {
        /// Declared uncompressed size.
        declared: u32,
        /// Hard cap.
        max: u32,
    },

    /// A raw payload larger than the hard cap.
    #[error("payload of {len} bytes exceeds maximum of {max}")]
    PayloadTooLarge {
        /// Payload length.
        len: usize,
        /// Hard cap.
        max: usize,
    },

    /// Every engine failed to decompress the payload.
    #[error("decompression failed: {0}")]
    Decompression(#[from] EngineError),

    /// The connection is not registered with the batcher.
    #[error("unknown connection {0}")]
    UnknownConnection(u32),

    /// The transport failed a write or flush.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl TickwireError {
    /// Returns true if this error means the peer violated the wire protocol.
    ///
    /// The host closes the offending connection; nothing else is affected.
    #[must_use]
    pub const fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            Self::VarintTooBig
                | Self::TruncatedHeader
                | Self::BadLength(_)
                | Self::DeclaredBelowThreshold { .. }
                | Self::DeclaredOverCap { .. }
                | Self::PayloadTooLarge { .. }
                | Self::Decompression(_)
        )
    }
}

/// Result type for pipeline operations.
pub type TickwireResult<T> = Result<T, TickwireError>;
