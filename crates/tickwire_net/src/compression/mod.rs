//! # Compression
//!
//! Pluggable engines behind one manager.
//!
//! ## Engines
//!
//! | Engine      | Library    | Formats               | Notes                       |
//! |-------------|------------|-----------------------|-----------------------------|
//! | baseline    | `flate2`   | deflate, zlib, gzip   | always available, fallback  |
//! | accelerated | `lz4_flex` | LZ4 block             | faster, both peers must use |
//!
//! Selection is made once at startup (`auto` prefers accelerated). Every
//! accelerated failure is retried on baseline for that one call.

pub mod accelerated;
pub mod adaptive;
pub mod baseline;
pub mod engine;
pub mod manager;

pub use accelerated::AcceleratedEngine;
pub use adaptive::AdaptiveThreshold;
pub use baseline::BaselineEngine;
pub use engine::{CompressionEngine, CompressionFormat, EngineKind, EngineSelection};
pub use manager::{Compressed, CompressionManager};
