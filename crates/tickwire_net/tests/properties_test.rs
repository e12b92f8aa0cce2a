//! Property tests for framing, compression and duplicate suppression.

use proptest::prelude::*;
use tickwire_net::compression::{CompressionFormat, EngineSelection};
use tickwire_net::protocol::{parse_frame, varint, VarintRead};
use tickwire_net::{CompressionManager, ConnectionId, DuplicateFilter, TickwireConfig};

fn manager(engine: EngineSelection, format: CompressionFormat, min: u32) -> CompressionManager {
    let config = TickwireConfig {
        compression_engine: engine,
        compression_format: format,
        min_packet_size_to_compress: min,
        enable_adaptive_compression: false,
        ..TickwireConfig::default()
    };
    CompressionManager::new(&config).unwrap()
}

fn engines() -> impl Strategy<Value = (EngineSelection, CompressionFormat)> {
    prop_oneof![
        Just((EngineSelection::Baseline, CompressionFormat::Deflate)),
        Just((EngineSelection::Baseline, CompressionFormat::Zlib)),
        Just((EngineSelection::Baseline, CompressionFormat::Gzip)),
        Just((EngineSelection::Accelerated, CompressionFormat::Zlib)),
    ]
}

/// Payloads that range from incompressible noise to long runs.
fn payloads() -> impl Strategy<Value = Vec<u8>> {
    prop_oneof![
        prop::collection::vec(any::<u8>(), 0..4096),
        prop::collection::vec(0u8..4, 0..8192),
        (any::<u8>(), 1usize..20_000).prop_map(|(byte, len)| vec![byte; len]),
    ]
}

proptest! {
    #[test]
    fn test_varint_round_trip(value in any::<u32>()) {
        let mut out = Vec::new();
        varint::encode(value, &mut out);
        prop_assert_eq!(out.len(), varint::byte_len(value));
        prop_assert_eq!(
            varint::decode(&out).unwrap(),
            VarintRead::Complete { value, len: out.len() }
        );
        if out.len() > 1 {
            prop_assert_eq!(varint::decode(&out[..out.len() - 1]).unwrap(), VarintRead::Incomplete);
        }
    }

    #[test]
    fn test_compression_transparent(payload in payloads(), (engine, format) in engines()) {
        let manager = manager(engine, format, 64);
        let compressed = manager.compress(&payload);

        let mut frame = Vec::new();
        compressed.write_frame(&mut frame);
        let parsed = parse_frame(&frame, 64, true).unwrap();

        let restored = match parsed {
            None => Vec::new(),
            Some(parsed) if parsed.is_compressed() => manager
                .decompress(parsed.payload, parsed.declared_length as usize)
                .unwrap(),
            Some(parsed) => parsed.payload.to_vec(),
        };
        prop_assert_eq!(restored, payload);
    }

    #[test]
    fn test_compression_never_expands(payload in payloads(), (engine, format) in engines()) {
        let manager = manager(engine, format, 1);
        let compressed = manager.compress(&payload);

        let mut frame = Vec::new();
        compressed.write_frame(&mut frame);
        prop_assert!(frame.len() <= payload.len() + varint::byte_len(0));
        if !compressed.is_compressed() {
            prop_assert_eq!(&*compressed.payload, payload.as_slice());
        }
    }

    #[test]
    fn test_suppression_run_is_bounded(max in 1u32..=20, repeats in 1usize..200) {
        let config = TickwireConfig {
            max_consecutive_duplicates: max,
            ..TickwireConfig::default()
        };
        let filter = DuplicateFilter::new(&config);

        let mut run = 0u32;
        for _ in 0..repeats {
            if filter.should_suppress_hash("PositionUpdate", 99, ConnectionId(1), 0) {
                run += 1;
                prop_assert!(run <= max);
            } else {
                run = 0;
            }
        }
    }

    #[test]
    fn test_timeout_expiry_never_suppresses(gaps in prop::collection::vec(501i64..10_000, 1..50)) {
        let filter = DuplicateFilter::new(&TickwireConfig::default());
        let mut now = 0;
        prop_assert!(!filter.should_suppress_hash("ChunkData", 5, ConnectionId(1), now));
        for gap in gaps {
            now += gap;
            prop_assert!(!filter.should_suppress_hash("ChunkData", 5, ConnectionId(1), now));
        }
    }
}
