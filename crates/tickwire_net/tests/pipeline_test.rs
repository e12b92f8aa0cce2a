//! Integration test for the outbound and inbound pipelines.

use std::io::Read;
use std::net::{TcpListener, TcpStream};
use std::thread;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tickwire_net::filter::FingerprintError;
use tickwire_net::{
    ConnectionId, Direction, EngineSelection, Fingerprint, MemoryTransport, SendOutcome,
    StreamTransport, Tickwire, TickwireConfig,
};

struct ChunkData {
    x: i32,
    z: i32,
    blocks: Vec<u8>,
}

impl ChunkData {
    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8 + self.blocks.len());
        out.extend_from_slice(&self.x.to_le_bytes());
        out.extend_from_slice(&self.z.to_le_bytes());
        out.extend_from_slice(&self.blocks);
        out
    }
}

impl Fingerprint for ChunkData {
    fn message_type(&self) -> &'static str {
        "ChunkData"
    }

    fn write_fingerprint(&self, out: &mut Vec<u8>) -> Result<(), FingerprintError> {
        out.extend_from_slice(&self.encode());
        Ok(())
    }
}

fn chunk(rng: &mut StdRng, x: i32, z: i32) -> ChunkData {
    // Mostly air with a few ore veins: compresses well.
    let blocks = (0..4096)
        .map(|_| if rng.gen_ratio(1, 10) { rng.gen_range(1..12) } else { 0 })
        .collect();
    ChunkData { x, z, blocks }
}

fn config(engine: EngineSelection) -> TickwireConfig {
    TickwireConfig {
        compression_engine: engine,
        client_packet_batch_delay: 5,
        ..TickwireConfig::default()
    }
}

#[test]
fn test_mixed_traffic_round_trip() {
    for engine in [EngineSelection::Baseline, EngineSelection::Accelerated] {
        let tickwire = Tickwire::new(&config(engine)).unwrap();
        let (transport, log) = MemoryTransport::new();
        let (outbound, mut inbound) = tickwire
            .connect(ConnectionId(1), Box::new(transport), Direction::Client)
            .unwrap();

        let mut rng = StdRng::seed_from_u64(7);
        let mut sent = Vec::new();
        let mut last = None;
        for i in 0..32 {
            let message = if i % 4 == 0 {
                chunk(&mut rng, i, -i).encode()
            } else {
                (0..rng.gen_range(1..200)).map(|_| rng.gen()).collect()
            };
            last = Some(outbound.send_unfiltered(&message).unwrap());
            sent.push(message);
        }
        assert_eq!(last.unwrap().wait_timeout(Duration::from_secs(5)), Some(SendOutcome::Sent));

        let received = inbound.receive(&log.writes().concat()).unwrap();
        assert_eq!(received, sent, "engine {engine:?}");

        let stats = tickwire.stats().snapshot();
        assert_eq!(stats.compression.packets_compressed, 8);
        assert!(stats.compression.bytes_after < stats.compression.bytes_before);
        assert!(stats.batching.flushes < 32);
    }
}

#[test]
fn test_duplicate_chunks_resync() {
    let config = TickwireConfig {
        max_consecutive_duplicates: 2,
        ..config(EngineSelection::Baseline)
    };
    let tickwire = Tickwire::new(&config).unwrap();
    let (transport, _log) = MemoryTransport::new();
    let (outbound, _) = tickwire
        .connect(ConnectionId(1), Box::new(transport), Direction::Client)
        .unwrap();

    let mut rng = StdRng::seed_from_u64(11);
    let data = chunk(&mut rng, 0, 0);
    let encoded = data.encode();

    let delivered: Vec<bool> = (0..7)
        .map(|_| outbound.send(&data, &encoded).unwrap().is_some())
        .collect();
    // First goes out, then two suppressed, then a forced resync, and again.
    assert_eq!(delivered, vec![true, false, false, true, false, false, true]);

    let duplicates = tickwire.stats().snapshot().duplicates;
    assert_eq!(duplicates.filtered, 4);
    assert_eq!(duplicates.resyncs, 2);
}

#[test]
fn test_over_tcp() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let sender = thread::spawn(move || {
        let tickwire = Tickwire::new(&config(EngineSelection::Auto)).unwrap();
        let stream = TcpStream::connect(addr).unwrap();
        let transport = StreamTransport::tcp(stream).unwrap();
        let (outbound, _) = tickwire
            .connect(ConnectionId(1), Box::new(transport), Direction::Client)
            .unwrap();

        let mut rng = StdRng::seed_from_u64(3);
        let messages: Vec<Vec<u8>> = (0..10).map(|i| chunk(&mut rng, i, i).encode()).collect();
        for message in &messages {
            outbound.send_unfiltered(message).unwrap();
        }
        tickwire.disconnect(ConnectionId(1)).unwrap();
        messages
    });

    let (mut stream, _) = listener.accept().unwrap();
    let mut bytes = Vec::new();
    stream.read_to_end(&mut bytes).unwrap();
    let sent = sender.join().unwrap();

    let receiver = Tickwire::new(&config(EngineSelection::Auto)).unwrap();
    let mut inbound = receiver.inbound();
    // Feed in awkward slices to exercise reassembly.
    let mut received = Vec::new();
    for piece in bytes.chunks(333) {
        received.extend(inbound.receive(piece).unwrap());
    }
    assert_eq!(received, sent);
    assert_eq!(inbound.buffered(), 0);
}

#[test]
fn test_corrupt_stream_is_protocol_violation() {
    let tickwire = Tickwire::new(&config(EngineSelection::Baseline)).unwrap();
    let mut inbound = tickwire.inbound();

    // Outer length 4, then a frame declaring 1000 bytes of "compressed" junk.
    let err = inbound.receive(&[4, 0xE8, 0x07, 0xFF, 0xFF]).unwrap_err();
    assert!(matches!(err, tickwire_net::TickwireError::Decompression(_)));
    assert!(err.is_protocol_violation());
}
