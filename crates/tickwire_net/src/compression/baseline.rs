//! # Baseline Engine
//!
//! DEFLATE through flate2. Always available, and the fallback for every
//! accelerated-engine failure.
//!
//! One compressor and one decompressor context per container family are
//! kept and reset between calls, so a warm engine does not reallocate zlib
//! state.

use std::io::Read;

use flate2::{Compress, Compression, Crc, Decompress, FlushCompress, FlushDecompress, Status};

use super::engine::{check_known_size, CompressionEngine, CompressionFormat, EngineKind};
use crate::error::EngineError;

const NAME: &str = "baseline";

/// Highest DEFLATE level.
pub const MAX_LEVEL: u32 = 9;

const GZIP_HEADER: [u8; 10] = [0x1f, 0x8b, 0x08, 0, 0, 0, 0, 0, 0, 0xff];
const GZIP_TRAILER_LEN: usize = 8;

/// DEFLATE engine.
pub struct BaselineEngine {
    level: u32,
    raw: Option<Compress>,
    zlib: Option<Compress>,
    raw_inflate: Option<Decompress>,
    zlib_inflate: Option<Decompress>,
    closed: bool,
}

impl BaselineEngine {
    /// Creates an engine at `level` (0-9).
    ///
    /// # Errors
    ///
    /// [`EngineError::InvalidLevel`] outside 0-9.
    pub fn new(level: u32) -> Result<Self, EngineError> {
        if level > MAX_LEVEL {
            return Err(EngineError::InvalidLevel {
                engine: NAME,
                level,
                min: 0,
                max: MAX_LEVEL,
            });
        }
        Ok(Self {
            level,
            raw: None,
            zlib: None,
            raw_inflate: None,
            zlib_inflate: None,
            closed: false,
        })
    }

    /// Configured level.
    #[must_use]
    pub const fn level(&self) -> u32 {
        self.level
    }

    fn ensure_open(&self) -> Result<(), EngineError> {
        if self.closed {
            Err(EngineError::Closed { engine: NAME })
        } else {
            Ok(())
        }
    }

    fn deflater(&mut self, zlib_header: bool) -> &mut Compress {
        let level = Compression::new(self.level);
        let slot = if zlib_header { &mut self.zlib } else { &mut self.raw };
        slot.get_or_insert_with(|| Compress::new(level, zlib_header))
    }

    fn inflater(&mut self, zlib_header: bool) -> &mut Decompress {
        let slot = if zlib_header {
            &mut self.zlib_inflate
        } else {
            &mut self.raw_inflate
        };
        slot.get_or_insert_with(|| Decompress::new(zlib_header))
    }

    fn gzip_compress(&mut self, input: &[u8], output: &mut [u8]) -> Result<usize, EngineError> {
        if output.len() < GZIP_HEADER.len() + GZIP_TRAILER_LEN {
            return Ok(0);
        }
        let body_end = output.len() - GZIP_TRAILER_LEN;
        output[..GZIP_HEADER.len()].copy_from_slice(&GZIP_HEADER);

        let body = deflate_into(self.deflater(false), input, &mut output[GZIP_HEADER.len()..body_end])?;
        if body == 0 {
            return Ok(0);
        }

        let mut crc = Crc::new();
        crc.update(input);
        let trailer_at = GZIP_HEADER.len() + body;
        output[trailer_at..trailer_at + 4].copy_from_slice(&crc.sum().to_le_bytes());
        output[trailer_at + 4..trailer_at + 8].copy_from_slice(&crc.amount().to_le_bytes());
        Ok(trailer_at + GZIP_TRAILER_LEN)
    }
}

fn deflate_into(ctx: &mut Compress, input: &[u8], output: &mut [u8]) -> Result<usize, EngineError> {
    ctx.reset();
    match ctx.compress(input, output, FlushCompress::Finish) {
        Ok(Status::StreamEnd) => Ok(ctx.total_out() as usize),
        Ok(Status::Ok | Status::BufError) => Ok(0),
        Err(e) => Err(EngineError::Compress {
            engine: NAME,
            reason: e.to_string(),
        }),
    }
}

fn inflate_into(
    ctx: &mut Decompress,
    zlib_header: bool,
    input: &[u8],
    output: &mut [u8],
) -> Result<usize, EngineError> {
    ctx.reset(zlib_header);
    match ctx.decompress(input, output, FlushDecompress::Finish) {
        Ok(Status::StreamEnd) => Ok(ctx.total_out() as usize),
        Ok(Status::Ok | Status::BufError) => Err(EngineError::Decompress {
            engine: NAME,
            reason: "stream truncated or larger than expected".to_string(),
        }),
        Err(e) => Err(EngineError::Decompress {
            engine: NAME,
            reason: e.to_string(),
        }),
    }
}

fn gunzip_into(input: &[u8], output: &mut [u8]) -> Result<usize, EngineError> {
    let to_error = |e: std::io::Error| EngineError::Decompress {
        engine: NAME,
        reason: e.to_string(),
    };

    let mut decoder = flate2::bufread::GzDecoder::new(input);
    let mut written = 0;
    while written < output.len() {
        let n = decoder.read(&mut output[written..]).map_err(to_error)?;
        if n == 0 {
            return Ok(written);
        }
        written += n;
    }

    let mut probe = [0u8; 1];
    if decoder.read(&mut probe).map_err(to_error)? != 0 {
        return Err(EngineError::Decompress {
            engine: NAME,
            reason: "stream larger than expected".to_string(),
        });
    }
    Ok(written)
}

impl CompressionEngine for BaselineEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Baseline
    }

    fn compress_bound(&self, max_input_size: usize, format: CompressionFormat) -> u64 {
        let len = max_input_size as u64;
        len + ((len + 7) >> 3) + ((len + 63) >> 6) + 5 + format.wrapper_overhead()
    }

    fn compress(
        &mut self,
        input: &[u8],
        output: &mut [u8],
        format: CompressionFormat,
    ) -> Result<usize, EngineError> {
        self.ensure_open()?;
        match format {
            CompressionFormat::Deflate => deflate_into(self.deflater(false), input, output),
            CompressionFormat::Zlib => deflate_into(self.deflater(true), input, output),
            CompressionFormat::Gzip => self.gzip_compress(input, output),
        }
    }

    fn decompress(
        &mut self,
        input: &[u8],
        output: &mut [u8],
        format: CompressionFormat,
        known_size: Option<usize>,
    ) -> Result<usize, EngineError> {
        self.ensure_open()?;
        let written = match format {
            CompressionFormat::Deflate => inflate_into(self.inflater(false), false, input, output)?,
            CompressionFormat::Zlib => inflate_into(self.inflater(true), true, input, output)?,
            CompressionFormat::Gzip => gunzip_into(input, output)?,
        };
        check_known_size(EngineKind::Baseline, written, known_size)
    }

    fn close(&mut self) {
        self.raw = None;
        self.zlib = None;
        self.raw_inflate = None;
        self.zlib_inflate = None;
        self.closed = true;
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}
