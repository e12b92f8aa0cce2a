//! # Compression Engine Benchmark
//!
//! Compares the baseline and accelerated engines on game-like payloads.
//!
//! Run with: cargo run --release --bin compression_benchmark

use std::time::{Duration, Instant};

use tickwire_net::compression::{
    AcceleratedEngine, BaselineEngine, CompressionEngine, CompressionFormat,
};
use tickwire_net::error::EngineError;

/// Payload sizes under test.
const SIZES: [usize; 5] = [1024, 8 * 1024, 64 * 1024, 256 * 1024, 1024 * 1024];
/// Untimed runs before measuring.
const WARMUP_ITERATIONS: usize = 3;
/// Timed runs per size.
const ITERATIONS: usize = 5;
/// Level used for both engines.
const LEVEL: u32 = 6;

/// Result for one engine at one size.
struct Measurement {
    compressed_len: usize,
    compress: Duration,
    decompress: Duration,
}

impl Measurement {
    fn ratio(&self, input_len: usize) -> f64 {
        self.compressed_len as f64 / input_len as f64
    }

    fn throughput_mb_s(input_len: usize, elapsed: Duration) -> f64 {
        let secs = elapsed.as_secs_f64();
        if secs == 0.0 {
            return f64::INFINITY;
        }
        input_len as f64 / (1024.0 * 1024.0) / secs
    }
}

/// Chunk-like data: runs of block ids with a little noise.
fn generate_payload(len: usize) -> Vec<u8> {
    let mut state: u32 = 0x9E37_79B9;
    let mut data = Vec::with_capacity(len);
    while data.len() < len {
        state ^= state << 13;
        state ^= state >> 17;
        state ^= state << 5;
        let block = (state % 12) as u8;
        let run = 1 + (state >> 8) as usize % 24;
        for _ in 0..run.min(len - data.len()) {
            data.push(block);
        }
    }
    data
}

fn measure(
    engine: &mut dyn CompressionEngine,
    input: &[u8],
    format: CompressionFormat,
) -> Result<Measurement, EngineError> {
    let bound = engine.compress_bound(input.len(), format);
    let bound = usize::try_from(bound).map_err(|_| EngineError::BoundTooLarge { bound })?;
    let mut compressed = vec![0u8; bound];
    let mut restored = vec![0u8; input.len()];

    let mut written = 0;
    for _ in 0..WARMUP_ITERATIONS {
        written = engine.compress(input, &mut compressed, format)?;
        engine.decompress(&compressed[..written], &mut restored, format, Some(input.len()))?;
    }

    let mut compress = Duration::ZERO;
    let mut decompress = Duration::ZERO;
    for _ in 0..ITERATIONS {
        let start = Instant::now();
        written = engine.compress(input, &mut compressed, format)?;
        compress += start.elapsed();

        let start = Instant::now();
        engine.decompress(&compressed[..written], &mut restored, format, Some(input.len()))?;
        decompress += start.elapsed();
    }

    if restored != input {
        return Err(EngineError::Decompress {
            engine: engine.kind().name(),
            reason: "round trip mismatch".to_string(),
        });
    }

    Ok(Measurement {
        compressed_len: written,
        compress: compress / ITERATIONS as u32,
        decompress: decompress / ITERATIONS as u32,
    })
}

fn print_row(name: &str, size: usize, result: &Result<Measurement, EngineError>) {
    match result {
        Ok(m) => println!(
            "  {:<12} {:>8} KB  ratio {:>6.3}  compress {:>8.1} MB/s  decompress {:>8.1} MB/s",
            name,
            size / 1024,
            m.ratio(size),
            Measurement::throughput_mb_s(size, m.compress),
            Measurement::throughput_mb_s(size, m.decompress),
        ),
        Err(e) => println!("  {name:<12} {:>8} KB  FAILED: {e}", size / 1024),
    }
}

fn main() {
    println!("╔══════════════════════════════════════════════════════════════════╗");
    println!("║           TICKWIRE COMPRESSION BENCHMARK                         ║");
    println!("╚══════════════════════════════════════════════════════════════════╝");
    println!();
    println!("Configuration:");
    println!("  Level:         {LEVEL}");
    println!("  Warmup:        {WARMUP_ITERATIONS} runs");
    println!("  Iterations:    {ITERATIONS} runs");
    println!("  Accelerated:   {}", if AcceleratedEngine::probe() { "available" } else { "unavailable" });
    println!();

    let mut baseline = match BaselineEngine::new(LEVEL) {
        Ok(engine) => engine,
        Err(e) => {
            eprintln!("baseline engine unavailable: {e}");
            return;
        }
    };
    let mut accelerated = AcceleratedEngine::new(LEVEL).ok().filter(|_| AcceleratedEngine::probe());

    for size in SIZES {
        let payload = generate_payload(size);
        println!("{} KB payload:", size / 1024);
        for format in [CompressionFormat::Deflate, CompressionFormat::Zlib, CompressionFormat::Gzip] {
            let result = measure(&mut baseline, &payload, format);
            print_row(&format!("flate2/{format}"), size, &result);
        }
        if let Some(engine) = accelerated.as_mut() {
            let result = measure(engine, &payload, CompressionFormat::default());
            print_row("lz4_flex", size, &result);
        }
        println!();
    }
}
