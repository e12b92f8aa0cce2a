//! # Wire Protocol
//!
//! Length prefixes and the compression frame header.
//!
//! ## Frame Structure
//!
//! ```text
//! ┌──────────────────────────────┬───────────────────────────────┐
//! │ declared_length (varint 1-5) │ payload                       │
//! ├──────────────────────────────┼───────────────────────────────┤
//! │ 0                            │ raw bytes                     │
//! │ N (threshold ..= 8 MiB)      │ compressed, inflates to N     │
//! └──────────────────────────────┴───────────────────────────────┘
//! ```
//!
//! ## Design Philosophy
//!
//! - The header is a varint because almost every value fits in one byte
//! - A protocol violation is fatal for one connection, never the process
//! - Nothing here allocates except the splitter's carry-over buffer

pub mod frame;
pub mod varint;

pub use frame::{
    encode_frame, encode_length_delimited, parse_frame, Frame, LengthDelimitedSplitter,
    MAX_OUTER_FRAME_LEN,
};
pub use varint::{DecodeState, VarintDecoder, VarintRead, MAX_VARINT_LEN};
