//! # Frames
//!
//! Two layers of framing sit on every connection:
//!
//! ```text
//! TCP stream ─► [varint21 len][ packet ][varint21 len][ packet ] ...
//!                              │
//!                              ▼
//!               [varint declared_length][ payload ]
//!                 0        => payload is raw
//!                 nonzero  => payload is compressed, inflates to exactly
//!                             declared_length bytes
//! ```
//!
//! The outer layer is split by [`LengthDelimitedSplitter`]. The inner
//! compression frame is read with [`parse_frame`] and written with
//! [`encode_frame`].

use super::varint::{self, DecodeState, VarintDecoder, VarintRead};
use crate::error::{TickwireError, TickwireResult};
use crate::MAX_UNCOMPRESSED_SIZE;

/// Maximum bytes in an outer length prefix.
pub const OUTER_PREFIX_MAX_BYTES: usize = 3;

/// Largest packet the outer prefix can describe (21 bits).
pub const MAX_OUTER_FRAME_LEN: usize = varint::max_value_for_len(OUTER_PREFIX_MAX_BYTES) as usize;

/// A parsed compression frame, borrowing its payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Frame<'a> {
    /// Original length, or 0 when the payload is raw.
    pub declared_length: u32,
    /// Bytes following the header.
    pub payload: &'a [u8],
}

impl Frame<'_> {
    /// Returns true if the payload must be decompressed.
    #[inline]
    #[must_use]
    pub const fn is_compressed(&self) -> bool {
        self.declared_length != 0
    }
}

/// Writes `varint(declared_length) || payload` to `out`.
pub fn encode_frame(declared_length: u32, payload: &[u8], out: &mut Vec<u8>) {
    out.reserve(varint::byte_len(declared_length) + payload.len());
    varint::encode(declared_length, out);
    out.extend_from_slice(payload);
}

/// Reads a compression frame.
///
/// Returns `Ok(None)` for an empty packet. The declared length is always
/// checked against the hard cap; with `validate` set a nonzero declared
/// length below `threshold` is rejected too.
///
/// # Errors
///
/// Every error is a protocol violation.
pub fn parse_frame(input: &[u8], threshold: u32, validate: bool) -> TickwireResult<Option<Frame<'_>>> {
    if input.is_empty() {
        return Ok(None);
    }

    let (declared_length, header_len) = match varint::decode(input)? {
        VarintRead::Complete { value, len } => (value, len),
        VarintRead::Incomplete => return Err(TickwireError::TruncatedHeader),
    };
    let payload = &input[header_len..];

    if declared_length == 0 {
        if payload.len() > MAX_UNCOMPRESSED_SIZE {
            return Err(TickwireError::PayloadTooLarge {
                len: payload.len(),
                max: MAX_UNCOMPRESSED_SIZE,
            });
        }
    } else {
        if validate && declared_length < threshold {
            return Err(TickwireError::DeclaredBelowThreshold {
                declared: declared_length,
                threshold,
            });
        }
        if declared_length as usize > MAX_UNCOMPRESSED_SIZE {
            return Err(TickwireError::DeclaredOverCap {
                declared: declared_length,
                max: MAX_UNCOMPRESSED_SIZE as u32,
            });
        }
    }

    Ok(Some(Frame { declared_length, payload }))
}

/// Writes the outer length prefix and the packet.
///
/// # Errors
///
/// Returns [`TickwireError::PayloadTooLarge`] if the packet does not fit a
/// three-byte prefix.
pub fn encode_length_delimited(packet: &[u8], out: &mut Vec<u8>) -> TickwireResult<()> {
    if packet.len() > MAX_OUTER_FRAME_LEN {
        return Err(TickwireError::PayloadTooLarge {
            len: packet.len(),
            max: MAX_OUTER_FRAME_LEN,
        });
    }
    let len = packet.len() as u32;
    out.reserve(varint::byte_len(len) + packet.len());
    varint::encode(len, out);
    out.extend_from_slice(packet);
    Ok(())
}

/// Splits an inbound byte stream into packets.
///
/// Input may arrive in arbitrary pieces; partial packets are buffered until
/// the rest shows up. Zero padding between packets is skipped.
#[derive(Debug)]
pub struct LengthDelimitedSplitter {
    buffer: Vec<u8>,
    max_packet_len: usize,
}

impl LengthDelimitedSplitter {
    /// Creates a splitter rejecting packets over `max_packet_len`.
    #[must_use]
    pub fn new(max_packet_len: usize) -> Self {
        Self {
            buffer: Vec::new(),
            max_packet_len: max_packet_len.min(MAX_OUTER_FRAME_LEN),
        }
    }

    /// Bytes held back waiting for the rest of a packet.
    #[inline]
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Appends `input` and pushes every complete packet to `out`, in order.
    ///
    /// # Errors
    ///
    /// [`TickwireError::VarintTooBig`] for a prefix over three bytes and
    /// [`TickwireError::BadLength`] for a length over the cap. Both are fatal
    /// for the connection; the splitter should be dropped.
    pub fn push(&mut self, input: &[u8], out: &mut Vec<Vec<u8>>) -> TickwireResult<()> {
        self.buffer.extend_from_slice(input);

        let mut cursor = 0;
        let result = loop {
            if cursor == self.buffer.len() {
                break Ok(());
            }

            let mut decoder = VarintDecoder::with_max_bytes(OUTER_PREFIX_MAX_BYTES);
            let Some(stop) = decoder.feed(&self.buffer[cursor..]) else {
                if decoder.state() == DecodeState::RunOfZeroes {
                    cursor = self.buffer.len();
                }
                break Ok(());
            };

            match decoder.state() {
                DecodeState::RunOfZeroes => cursor += stop,
                DecodeState::TooBig => break Err(TickwireError::VarintTooBig),
                DecodeState::Success => {
                    let len = decoder.value() as usize;
                    let header = stop + 1;
                    if len == 0 {
                        cursor += header;
                        continue;
                    }
                    if len > self.max_packet_len {
                        break Err(TickwireError::BadLength(len as u64));
                    }
                    let start = cursor + header;
                    if self.buffer.len() - start < len {
                        break Ok(());
                    }
                    out.push(self.buffer[start..start + len].to_vec());
                    cursor = start + len;
                }
                DecodeState::TooShort => break Ok(()),
            }
        };

        self.buffer.drain(..cursor);
        result
    }
}

impl Default for LengthDelimitedSplitter {
    fn default() -> Self {
        Self::new(MAX_OUTER_FRAME_LEN)
    }
}
