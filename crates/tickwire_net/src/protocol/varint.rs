//! # Varint Codec
//!
//! 32-bit unsigned integers in a 1-5 byte continuation-bit format.
//! Seven value bits per byte, least significant group first, high bit set
//! when another byte follows.
//!
//! ```text
//! 300 = 0b10_0101100
//!
//! ┌──────────┬──────────┐
//! │ 1 0101100│ 0 0000010│
//! └──────────┴──────────┘
//!   more       last
//! ```
//!
//! ## Hot Path
//!
//! Every frame on the wire starts with one of these. Nearly all frame
//! lengths and header fields fit in one or two bytes, so those get
//! closed-form encodings; three to five byte values take the general loop.

use crate::error::{TickwireError, TickwireResult};

/// Maximum encoded length of a u32.
pub const MAX_VARINT_LEN: usize = 5;

/// Encoded length indexed by `leading_zeros(value)`.
const BYTE_LENGTHS: [u8; 33] = {
    let mut table = [0u8; 33];
    let mut lz = 0;
    while lz < 32 {
        let bits = 32 - lz;
        table[lz] = ((bits + 6) / 7) as u8;
        lz += 1;
    }
    // Zero still costs one byte.
    table[32] = 1;
    table
};

/// Returns the number of bytes `value` occupies when encoded.
///
/// Computed from the bit length, no encoding performed.
#[inline]
#[must_use]
pub const fn byte_len(value: u32) -> usize {
    BYTE_LENGTHS[value.leading_zeros() as usize] as usize
}

/// Returns the largest value that fits in `bytes` encoded bytes.
#[must_use]
pub const fn max_value_for_len(bytes: usize) -> u32 {
    match bytes {
        0 => 0,
        1..=4 => (1u32 << (bytes * 7)) - 1,
        _ => u32::MAX,
    }
}

/// Encodes `value` into a stack buffer.
///
/// Returns the buffer and the number of bytes used.
#[inline]
#[must_use]
pub fn encode_to_array(value: u32) -> ([u8; MAX_VARINT_LEN], usize) {
    let mut buf = [0u8; MAX_VARINT_LEN];

    if value & (u32::MAX << 7) == 0 {
        buf[0] = value as u8;
        return (buf, 1);
    }

    if value & (u32::MAX << 14) == 0 {
        let word = (((value & 0x7F) | 0x80) << 8) | (value >> 7);
        buf[..2].copy_from_slice(&(word as u16).to_be_bytes());
        return (buf, 2);
    }

    let mut remaining = value;
    let mut len = 0;
    while remaining >= 0x80 {
        buf[len] = (remaining as u8 & 0x7F) | 0x80;
        remaining >>= 7;
        len += 1;
    }
    buf[len] = remaining as u8;
    (buf, len + 1)
}

/// Appends the encoding of `value` to `out`.
#[inline]
pub fn encode(value: u32, out: &mut Vec<u8>) {
    let (buf, len) = encode_to_array(value);
    out.extend_from_slice(&buf[..len]);
}

/// Outcome of decoding a varint from a complete-or-partial buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VarintRead {
    /// A full varint was decoded.
    Complete {
        /// Decoded value.
        value: u32,
        /// Bytes consumed.
        len: usize,
    },
    /// The buffer ended before the terminating byte. Not an error.
    Incomplete,
}

/// Decodes a varint from the start of `input`.
///
/// # Errors
///
/// Returns [`TickwireError::VarintTooBig`] if five bytes pass without a
/// terminator, or the fifth byte carries bits that do not fit in a u32.
#[inline]
pub fn decode(input: &[u8]) -> TickwireResult<VarintRead> {
    let Some(&first) = input.first() else {
        return Ok(VarintRead::Incomplete);
    };
    if first & 0x80 == 0 {
        return Ok(VarintRead::Complete { value: u32::from(first), len: 1 });
    }

    let Some(&second) = input.get(1) else {
        return Ok(VarintRead::Incomplete);
    };
    if second & 0x80 == 0 {
        let value = u32::from(first & 0x7F) | (u32::from(second) << 7);
        return Ok(VarintRead::Complete { value, len: 2 });
    }

    decode_slow(input)
}

fn decode_slow(input: &[u8]) -> TickwireResult<VarintRead> {
    let mut value = 0u32;
    for (i, &byte) in input.iter().enumerate().take(MAX_VARINT_LEN) {
        let bits = u32::from(byte & 0x7F);
        if i == MAX_VARINT_LEN - 1 && bits > 0x0F {
            return Err(TickwireError::VarintTooBig);
        }
        value |= bits << (i * 7);
        if byte & 0x80 == 0 {
            return Ok(VarintRead::Complete { value, len: i + 1 });
        }
    }
    if input.len() >= MAX_VARINT_LEN {
        Err(TickwireError::VarintTooBig)
    } else {
        Ok(VarintRead::Incomplete)
    }
}

/// Terminal state of the byte-at-a-time decoder.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DecodeState {
    /// Input ran out before a terminator; feed more bytes.
    TooShort,
    /// A value was assembled.
    Success,
    /// Too many bytes without a terminator. Fatal for the connection.
    TooBig,
    /// Leading zero bytes (keepalive padding). Skip them and keep scanning.
    RunOfZeroes,
}

/// Byte-at-a-time varint decoder.
///
/// Used by the inbound length splitter, which scans a buffer until the
/// decoder stops asking for bytes. Unlike [`decode`], a leading zero byte is
/// not the value zero: it starts a run of padding.
#[derive(Clone, Debug)]
pub struct VarintDecoder {
    value: u32,
    bytes_read: usize,
    zeroes: usize,
    max_bytes: usize,
    state: DecodeState,
}

impl VarintDecoder {
    /// Creates a decoder accepting up to five bytes.
    #[must_use]
    pub const fn new() -> Self {
        Self::with_max_bytes(MAX_VARINT_LEN)
    }

    /// Creates a decoder accepting at most `max_bytes` (1-5) bytes.
    #[must_use]
    pub const fn with_max_bytes(max_bytes: usize) -> Self {
        let max_bytes = if max_bytes == 0 {
            1
        } else if max_bytes > MAX_VARINT_LEN {
            MAX_VARINT_LEN
        } else {
            max_bytes
        };
        Self {
            value: 0,
            bytes_read: 0,
            zeroes: 0,
            max_bytes,
            state: DecodeState::TooShort,
        }
    }

    /// Processes one byte. Returns true if the decoder wants another.
    pub fn process(&mut self, byte: u8) -> bool {
        if byte == 0 && self.bytes_read == 0 {
            self.state = DecodeState::RunOfZeroes;
            self.zeroes += 1;
            return true;
        }
        if self.state == DecodeState::RunOfZeroes {
            return false;
        }
        if self.bytes_read == self.max_bytes {
            self.state = DecodeState::TooBig;
            return false;
        }

        let shift = self.bytes_read * 7;
        let bits = u32::from(byte & 0x7F);
        if shift == 28 && bits > 0x0F {
            self.state = DecodeState::TooBig;
            return false;
        }
        self.value |= bits << shift;
        self.bytes_read += 1;

        if byte & 0x80 == 0 {
            self.state = DecodeState::Success;
            return false;
        }
        true
    }

    /// Feeds bytes until the decoder stops.
    ///
    /// Returns the index of the byte that stopped it, or `None` if the
    /// input was exhausted first.
    pub fn feed(&mut self, input: &[u8]) -> Option<usize> {
        input.iter().position(|&b| !self.process(b))
    }

    /// Current state.
    #[inline]
    #[must_use]
    pub const fn state(&self) -> DecodeState {
        self.state
    }

    /// Decoded value (meaningful in [`DecodeState::Success`]).
    #[inline]
    #[must_use]
    pub const fn value(&self) -> u32 {
        self.value
    }

    /// Value bytes consumed, excluding skipped zeroes.
    #[inline]
    #[must_use]
    pub const fn bytes_read(&self) -> usize {
        self.bytes_read
    }

    /// Leading zero bytes seen.
    #[inline]
    #[must_use]
    pub const fn zeroes(&self) -> usize {
        self.zeroes
    }

    /// Resets for the next varint.
    pub fn reset(&mut self) {
        self.value = 0;
        self.bytes_read = 0;
        self.zeroes = 0;
        self.state = DecodeState::TooShort;
    }
}

impl Default for VarintDecoder {
    fn default() -> Self {
        Self::new()
    }
}
