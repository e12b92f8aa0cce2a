//! # Pipelines
//!
//! Wires the components into the two per-connection flows:
//!
//! ```text
//! OUTBOUND  message ─► DuplicateFilter ─► CompressionManager ─► frame
//!                       (drop?)            (maybe compress)      │
//!                                                                ▼
//!                                  OutboundBatcher ◄─ [outer length prefix]
//!
//! INBOUND   bytes ─► LengthDelimitedSplitter ─► parse_frame ─► decompress ─► dispatch
//! ```
//!
//! Pipelines hold only `Arc`s to the shared components, so a host installs
//! one outbound and one inbound pipeline per connection.

use std::sync::Arc;

use crate::batch::{OutboundBatcher, SendHandle};
use crate::compression::CompressionManager;
use crate::config::TickwireConfig;
use crate::error::{TickwireError, TickwireResult};
use crate::filter::{DuplicateFilter, Fingerprint};
use crate::protocol::{encode_length_delimited, parse_frame, LengthDelimitedSplitter};
use crate::stats::{BatchStats, StatsAggregator};
use crate::transport::{ConnectionId, Direction, Transport};
use crate::MAX_UNCOMPRESSED_SIZE;

/// Shared components for every connection in a process.
#[derive(Debug)]
pub struct Tickwire {
    filter: Arc<DuplicateFilter>,
    compression: Arc<CompressionManager>,
    batcher: Arc<OutboundBatcher>,
    stats: StatsAggregator,
    length_delimited: bool,
}

impl Tickwire {
    /// Builds every component from a validated configuration.
    ///
    /// # Errors
    ///
    /// [`crate::TickwireError::InvalidConfig`] if `config` fails validation,
    /// or a transport error if the flush scheduler cannot start.
    pub fn new(config: &TickwireConfig) -> TickwireResult<Self> {
        config.validate()?;
        let filter = Arc::new(DuplicateFilter::new(config));
        let compression = Arc::new(CompressionManager::new(config)?);
        let batcher = Arc::new(OutboundBatcher::new(config)?);
        let stats = StatsAggregator::new(
            compression.stats(),
            filter.stats(),
            Arc::clone(batcher.stats()),
        );
        Ok(Self {
            filter,
            compression,
            batcher,
            stats,
            length_delimited: true,
        })
    }

    /// Whether pipelines add and strip the outer 3-byte length prefix.
    ///
    /// On by default. Turn off when the host frames packets itself.
    #[must_use]
    pub const fn with_length_delimiting(mut self, enabled: bool) -> Self {
        self.length_delimited = enabled;
        self
    }

    /// Registers `transport` for `id` and returns both of its pipelines.
    ///
    /// # Errors
    ///
    /// If the connection's flush thread cannot be spawned.
    pub fn connect(
        &self,
        id: ConnectionId,
        transport: Box<dyn Transport>,
        direction: Direction,
    ) -> TickwireResult<(OutboundPipeline, InboundPipeline)> {
        self.batcher.register(id, transport, direction)?;
        Ok((self.outbound(id), self.inbound()))
    }

    /// Outbound pipeline for an already registered connection.
    #[must_use]
    pub fn outbound(&self, id: ConnectionId) -> OutboundPipeline {
        OutboundPipeline {
            connection: id,
            filter: Arc::clone(&self.filter),
            compression: Arc::clone(&self.compression),
            batcher: Arc::clone(&self.batcher),
            length_delimited: self.length_delimited,
        }
    }

    /// A fresh inbound pipeline.
    #[must_use]
    pub fn inbound(&self) -> InboundPipeline {
        InboundPipeline {
            compression: Arc::clone(&self.compression),
            batching: Arc::clone(self.batcher.stats()),
            splitter: self.length_delimited.then(LengthDelimitedSplitter::default),
        }
    }

    /// Flushes and closes `id`.
    ///
    /// # Errors
    ///
    /// [`crate::TickwireError::UnknownConnection`] if `id` is not registered.
    pub fn disconnect(&self, id: ConnectionId) -> TickwireResult<()> {
        self.batcher.teardown(id)
    }

    /// Duplicate filter.
    #[must_use]
    pub fn filter(&self) -> &Arc<DuplicateFilter> {
        &self.filter
    }

    /// Compression manager.
    #[must_use]
    pub fn compression(&self) -> &Arc<CompressionManager> {
        &self.compression
    }

    /// Outbound batcher.
    #[must_use]
    pub fn batcher(&self) -> &Arc<OutboundBatcher> {
        &self.batcher
    }

    /// Counters of every component.
    #[must_use]
    pub fn stats(&self) -> &StatsAggregator {
        &self.stats
    }

    /// Retires the compression manager. Connections stay registered.
    pub fn shutdown(&self) {
        self.compression.shutdown();
    }
}

/// Outbound flow of one connection.
#[derive(Debug, Clone)]
pub struct OutboundPipeline {
    connection: ConnectionId,
    filter: Arc<DuplicateFilter>,
    compression: Arc<CompressionManager>,
    batcher: Arc<OutboundBatcher>,
    length_delimited: bool,
}

impl OutboundPipeline {
    /// Connection this pipeline writes to.
    #[must_use]
    pub const fn connection(&self) -> ConnectionId {
        self.connection
    }

    /// Sends `message`, already serialized as `encoded`, unless the filter
    /// suppresses it.
    ///
    /// Returns `Ok(None)` when suppressed.
    ///
    /// # Errors
    ///
    /// Unknown connection, or a payload too large to send.
    pub fn send<M: Fingerprint + ?Sized>(
        &self,
        message: &M,
        encoded: &[u8],
    ) -> TickwireResult<Option<SendHandle>> {
        if self.filter.should_suppress(message, self.connection) {
            tracing::trace!(connection = %self.connection, message_type = message.message_type(), "suppressed duplicate");
            return Ok(None);
        }
        self.send_unfiltered(encoded).map(Some)
    }

    /// Sends `encoded` without consulting the duplicate filter.
    ///
    /// # Errors
    ///
    /// Unknown connection, or a payload too large to send.
    pub fn send_unfiltered(&self, encoded: &[u8]) -> TickwireResult<SendHandle> {
        let frame = self.encode(encoded)?;
        self.batcher.enqueue(self.connection, frame)
    }

    /// Produces the bytes that go on the wire for `encoded`.
    ///
    /// # Errors
    ///
    /// [`TickwireError::PayloadTooLarge`] if `encoded` exceeds
    /// [`MAX_UNCOMPRESSED_SIZE`] (no receiver would accept it) or the frame
    /// does not fit the outer prefix.
    pub fn encode(&self, encoded: &[u8]) -> TickwireResult<Vec<u8>> {
        if encoded.len() > MAX_UNCOMPRESSED_SIZE {
            return Err(TickwireError::PayloadTooLarge {
                len: encoded.len(),
                max: MAX_UNCOMPRESSED_SIZE,
            });
        }
        let compressed = self.compression.compress(encoded);
        let mut frame = Vec::with_capacity(compressed.payload.len() + 5);
        compressed.write_frame(&mut frame);
        if !self.length_delimited {
            return Ok(frame);
        }
        let mut wire = Vec::with_capacity(frame.len() + 3);
        encode_length_delimited(&frame, &mut wire)?;
        Ok(wire)
    }
}

/// Inbound flow of one connection.
#[derive(Debug)]
pub struct InboundPipeline {
    compression: Arc<CompressionManager>,
    batching: Arc<BatchStats>,
    splitter: Option<LengthDelimitedSplitter>,
}

impl InboundPipeline {
    /// Feeds bytes read from the socket, returning every complete message.
    ///
    /// Without length delimiting each call is treated as one packet.
    ///
    /// # Errors
    ///
    /// Any protocol violation; the connection should be closed.
    pub fn receive(&mut self, bytes: &[u8]) -> TickwireResult<Vec<Vec<u8>>> {
        let Some(splitter) = self.splitter.as_mut() else {
            return Ok(self.decode_packet(bytes)?.into_iter().collect());
        };

        let mut packets = Vec::new();
        splitter.push(bytes, &mut packets)?;
        let mut messages = Vec::with_capacity(packets.len());
        for packet in &packets {
            if let Some(message) = self.decode_packet(packet)? {
                messages.push(message);
            }
        }
        Ok(messages)
    }

    /// Decodes one compression frame. `Ok(None)` for an empty packet.
    ///
    /// # Errors
    ///
    /// Any protocol violation or a payload that fails to decompress.
    pub fn decode_packet(&self, packet: &[u8]) -> TickwireResult<Option<Vec<u8>>> {
        let Some(frame) = parse_frame(
            packet,
            self.compression.min_threshold(),
            self.compression.validates_decompressed_size(),
        )?
        else {
            return Ok(None);
        };
        self.batching.record_received(packet.len());

        if frame.is_compressed() {
            self.compression
                .decompress(frame.payload, frame.declared_length as usize)
                .map(Some)
        } else {
            Ok(Some(frame.payload.to_vec()))
        }
    }

    /// Bytes held back waiting for the rest of a packet.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.splitter.as_ref().map_or(0, LengthDelimitedSplitter::buffered)
    }
}
