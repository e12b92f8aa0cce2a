//! Benchmarks for the outbound hot path.
//!
//! TARGET: varint + raw frame well under 100 ns, duplicate check under 1 µs
//!
//! Run with: cargo bench --package tickwire_net --bench pipeline_benchmark

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tickwire_net::compression::EngineSelection;
use tickwire_net::filter::{Fingerprint, FingerprintError};
use tickwire_net::protocol::{encode_frame, parse_frame, varint};
use tickwire_net::{CompressionManager, ConnectionId, DuplicateFilter, TickwireConfig};

struct MoveUpdate {
    entity: u32,
    x: i32,
    z: i32,
}

impl Fingerprint for MoveUpdate {
    fn message_type(&self) -> &'static str {
        "MoveUpdate"
    }

    fn write_fingerprint(&self, out: &mut Vec<u8>) -> Result<(), FingerprintError> {
        out.extend_from_slice(&self.entity.to_le_bytes());
        out.extend_from_slice(&self.x.to_le_bytes());
        out.extend_from_slice(&self.z.to_le_bytes());
        Ok(())
    }
}

fn chunk_payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| ((i / 16) % 7) as u8).collect()
}

fn benchmark_varint(c: &mut Criterion) {
    let mut group = c.benchmark_group("varint");
    for value in [0u32, 300, 2_097_152, u32::MAX] {
        group.bench_with_input(BenchmarkId::new("encode", value), &value, |b, &value| {
            let mut out = Vec::with_capacity(8);
            b.iter(|| {
                out.clear();
                varint::encode(black_box(value), &mut out);
                black_box(out.len())
            });
        });
    }
    group.finish();
}

fn benchmark_frame(c: &mut Criterion) {
    let payload = chunk_payload(128);
    let mut framed = Vec::new();
    encode_frame(0, &payload, &mut framed);

    c.bench_function("raw_frame_round_trip", |b| {
        let mut out = Vec::with_capacity(256);
        b.iter(|| {
            out.clear();
            encode_frame(0, black_box(&payload), &mut out);
            black_box(parse_frame(black_box(&framed), 256, true))
        });
    });
}

fn benchmark_compression(c: &mut Criterion) {
    let mut group = c.benchmark_group("compress");
    for (name, selection) in [
        ("baseline", EngineSelection::Baseline),
        ("accelerated", EngineSelection::Accelerated),
    ] {
        let config = TickwireConfig {
            compression_engine: selection,
            enable_adaptive_compression: false,
            ..TickwireConfig::default()
        };
        let Ok(manager) = CompressionManager::new(&config) else {
            continue;
        };
        for size in [1024usize, 16 * 1024, 256 * 1024] {
            let payload = chunk_payload(size);
            group.throughput(Throughput::Bytes(size as u64));
            group.bench_with_input(BenchmarkId::new(name, size), &payload, |b, payload| {
                b.iter(|| black_box(manager.compress(black_box(payload)).payload.len()));
            });
        }
    }
    group.finish();
}

fn benchmark_duplicate_filter(c: &mut Criterion) {
    let filter = DuplicateFilter::new(&TickwireConfig::default());
    let destination = ConnectionId(1);

    c.bench_function("duplicate_check", |b| {
        let mut tick = 0i32;
        b.iter(|| {
            tick = tick.wrapping_add(1);
            let update = MoveUpdate {
                entity: 7,
                x: tick / 4,
                z: 0,
            };
            black_box(filter.should_suppress(black_box(&update), destination))
        });
    });
}

criterion_group!(
    benches,
    benchmark_varint,
    benchmark_frame,
    benchmark_compression,
    benchmark_duplicate_filter
);
criterion_main!(benches);
