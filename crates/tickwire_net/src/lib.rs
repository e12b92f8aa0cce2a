//! # TICKWIRE Net - The Hot Path
//!
//! Everything between a game server's framed message pipeline and the socket.
//!
//! ## Architecture
//!
//! - **Protocol**: 1-5 byte varint framing for the compression frame and
//!   the outer length prefix
//! - **Filter**: drops repeated state-sync messages, bounded by a timeout and
//!   a forced resync every few duplicates
//! - **Compression**: two pluggable engines (flate2 baseline, lz4_flex
//!   accelerated) with fallback and an adaptive size threshold
//! - **Batching**: per-connection queues, many writes per flush, one shared
//!   timer that wakes each connection's flush thread when its delay expires
//!
//! ## Wire Format
//!
//! ```text
//! [varint21 packet_len][varint declared_length][payload]
//!                       0       => raw
//!                       nonzero => compressed, inflates to declared_length
//! ```
//!
//! Both peers must run the same engine: the frame does not say which one
//! produced the payload.
//!
//! ## Example
//!
//! ```rust,ignore
//! use tickwire_net::{ConnectionId, Direction, StreamTransport, Tickwire, TickwireConfig};
//!
//! let tickwire = Tickwire::new(&TickwireConfig::from_file("tickwire.toml")?)?;
//! let transport = StreamTransport::tcp(stream)?;
//! let (outbound, mut inbound) =
//!     tickwire.connect(ConnectionId(1), Box::new(transport), Direction::Server)?;
//!
//! outbound.send(&update, &encoded)?;
//! for message in inbound.receive(&bytes_from_socket)? {
//!     dispatch(message);
//! }
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![deny(clippy::perf)]

pub mod batch;
pub mod compression;
pub mod config;
pub mod error;
pub mod filter;
pub mod pipeline;
pub mod protocol;
pub mod stats;
pub mod transport;

// Re-exports for convenience
pub use batch::{BatchPolicy, BulkScope, OutboundBatcher, SendHandle, SendOutcome};
pub use compression::{
    CompressionEngine, CompressionFormat, CompressionManager, EngineKind, EngineSelection,
};
pub use config::TickwireConfig;
pub use error::{TickwireError, TickwireResult};
pub use filter::{DuplicateFilter, Fingerprint, FingerprintError, SuppressionScope};
pub use pipeline::{InboundPipeline, OutboundPipeline, Tickwire};
pub use protocol::{Frame, LengthDelimitedSplitter};
pub use stats::{StatsAggregator, StatsSnapshot};
pub use transport::{ConnectionId, Direction, MemoryTransport, StreamTransport, Transport};

/// Largest payload that is compressed or accepted after decompression (8 MiB).
pub const MAX_UNCOMPRESSED_SIZE: usize = 8 * 1024 * 1024;

/// Ceiling for the adaptive compression threshold.
///
/// Raised thresholds never pass this, unless the configured minimum is
/// itself higher.
pub const MAX_ADAPTIVE_THRESHOLD: u32 = 8192;
