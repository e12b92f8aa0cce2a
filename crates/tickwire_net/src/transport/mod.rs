//! # Transport Layer
//!
//! The ordered byte pipeline the batcher writes into.
//!
//! ## Design
//!
//! - `write` buffers, `flush` pushes to the socket; a batch is many writes
//!   and one flush
//! - One transport per connection, only ever driven under that connection's
//!   drain lock, so implementations need no internal locking
//! - [`StreamTransport`] wraps any `io::Write` (a `TcpStream` in production)
//! - [`MemoryTransport`] records every call for tests and benchmarks

use std::fmt;
use std::io::{self, BufWriter, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::Arc;

use parking_lot::Mutex;

/// Unique identifier for a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u32);

impl ConnectionId {
    /// Invalid/null connection ID.
    pub const NULL: Self = Self(u32::MAX);

    /// Returns true if this is the null ID.
    #[inline]
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == u32::MAX
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::NULL
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Which end of the protocol this process is on for a connection.
///
/// Selects the batching policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    /// We are the client; the peer is a server.
    Client,
    /// We are the server; the peer is a client.
    Server,
}

/// Per-connection byte sink.
pub trait Transport: Send {
    /// Buffers `payload` for sending.
    ///
    /// # Errors
    ///
    /// Any I/O failure.
    fn write(&mut self, payload: &[u8]) -> io::Result<()>;

    /// Pushes everything written so far to the peer.
    ///
    /// # Errors
    ///
    /// Any I/O failure.
    fn flush(&mut self) -> io::Result<()>;

    /// Returns false once the transport can no longer send.
    fn is_active(&self) -> bool;

    /// Closes the transport. Idempotent.
    fn close(&mut self);
}

// =============================================================================
// Stream transport
// =============================================================================

/// Transport over any `io::Write`, buffered until `flush`.
pub struct StreamTransport<W: Write + Send> {
    writer: Option<BufWriter<W>>,
    on_close: Option<Box<dyn FnOnce(&mut W) + Send>>,
}

impl<W: Write + Send> StreamTransport<W> {
    /// Wraps `inner`.
    pub fn new(inner: W) -> Self {
        Self {
            writer: Some(BufWriter::new(inner)),
            on_close: None,
        }
    }

    /// Wraps `inner` with a buffer of `capacity` bytes.
    pub fn with_capacity(capacity: usize, inner: W) -> Self {
        Self {
            writer: Some(BufWriter::with_capacity(capacity, inner)),
            on_close: None,
        }
    }

    fn closed() -> io::Error {
        io::Error::new(io::ErrorKind::NotConnected, "transport closed")
    }
}

impl StreamTransport<TcpStream> {
    /// Wraps a TCP stream with Nagle disabled; batching replaces it.
    ///
    /// # Errors
    ///
    /// If `TCP_NODELAY` cannot be set.
    pub fn tcp(stream: TcpStream) -> io::Result<Self> {
        stream.set_nodelay(true)?;
        Ok(Self {
            writer: Some(BufWriter::new(stream)),
            on_close: Some(Box::new(|stream: &mut TcpStream| {
                let _ = stream.shutdown(Shutdown::Both);
            })),
        })
    }
}

impl<W: Write + Send> Transport for StreamTransport<W> {
    fn write(&mut self, payload: &[u8]) -> io::Result<()> {
        self.writer.as_mut().ok_or_else(Self::closed)?.write_all(payload)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.as_mut().ok_or_else(Self::closed)?.flush()
    }

    fn is_active(&self) -> bool {
        self.writer.is_some()
    }

    fn close(&mut self) {
        let Some(writer) = self.writer.take() else {
            return;
        };
        match writer.into_inner() {
            Ok(mut inner) => {
                if let Some(on_close) = self.on_close.take() {
                    on_close(&mut inner);
                }
            }
            Err(e) => tracing::debug!(error = %e.error(), "unflushed bytes lost on close"),
        }
    }
}

// =============================================================================
// Memory transport
// =============================================================================

/// A call observed by a [`MemoryTransport`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportEvent {
    /// `write` with these bytes.
    Write(Vec<u8>),
    /// `flush`.
    Flush,
    /// `close`.
    Close,
}

#[derive(Debug)]
struct LogState {
    events: Vec<TransportEvent>,
    active: bool,
    fail_writes: bool,
}

/// Shared view of a [`MemoryTransport`]'s history.
#[derive(Clone, Debug)]
pub struct TransportLog {
    state: Arc<Mutex<LogState>>,
}

impl TransportLog {
    /// Every call so far, in order.
    #[must_use]
    pub fn events(&self) -> Vec<TransportEvent> {
        self.state.lock().events.clone()
    }

    /// Written payloads, in order.
    #[must_use]
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.state
            .lock()
            .events
            .iter()
            .filter_map(|event| match event {
                TransportEvent::Write(bytes) => Some(bytes.clone()),
                _ => None,
            })
            .collect()
    }

    /// Number of flushes.
    #[must_use]
    pub fn flushes(&self) -> usize {
        self.count(|event| matches!(event, TransportEvent::Flush))
    }

    /// Returns true once closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.count(|event| matches!(event, TransportEvent::Close)) > 0
    }

    /// Marks the transport inactive, as if the peer went away.
    pub fn set_active(&self, active: bool) {
        self.state.lock().active = active;
    }

    /// Makes every subsequent write fail.
    pub fn fail_writes(&self, fail: bool) {
        self.state.lock().fail_writes = fail;
    }

    fn count(&self, predicate: impl Fn(&TransportEvent) -> bool) -> usize {
        self.state.lock().events.iter().filter(|e| predicate(e)).count()
    }
}

/// In-memory transport recording every call.
#[derive(Debug)]
pub struct MemoryTransport {
    state: Arc<Mutex<LogState>>,
}

impl MemoryTransport {
    /// Creates a transport and the log that observes it.
    #[must_use]
    pub fn new() -> (Self, TransportLog) {
        let state = Arc::new(Mutex::new(LogState {
            events: Vec::new(),
            active: true,
            fail_writes: false,
        }));
        (
            Self {
                state: Arc::clone(&state),
            },
            TransportLog { state },
        )
    }
}

impl Transport for MemoryTransport {
    fn write(&mut self, payload: &[u8]) -> io::Result<()> {
        let mut state = self.state.lock();
        if !state.active {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "transport inactive"));
        }
        if state.fail_writes {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "injected write failure"));
        }
        state.events.push(TransportEvent::Write(payload.to_vec()));
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut state = self.state.lock();
        if !state.active {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "transport inactive"));
        }
        state.events.push(TransportEvent::Flush);
        Ok(())
    }

    fn is_active(&self) -> bool {
        self.state.lock().active
    }

    fn close(&mut self) {
        let mut state = self.state.lock();
        if state.active {
            state.active = false;
            state.events.push(TransportEvent::Close);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_id() {
        assert!(ConnectionId::NULL.is_null());
        assert!(ConnectionId::default().is_null());
        assert!(!ConnectionId(3).is_null());
        assert_eq!(ConnectionId(3).to_string(), "#3");
    }

    #[test]
    fn test_memory_transport_records_calls() {
        let (mut transport, log) = MemoryTransport::new();
        transport.write(b"a").unwrap();
        transport.write(b"b").unwrap();
        transport.flush().unwrap();
        transport.close();
        transport.close();

        assert_eq!(
            log.events(),
            vec![
                TransportEvent::Write(b"a".to_vec()),
                TransportEvent::Write(b"b".to_vec()),
                TransportEvent::Flush,
                TransportEvent::Close,
            ]
        );
        assert!(transport.write(b"c").is_err());
    }

    #[test]
    fn test_stream_transport_buffers_until_flush() {
        #[derive(Clone, Default)]
        struct Shared(Arc<Mutex<Vec<u8>>>);

        impl Write for Shared {
            fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
                self.0.lock().extend_from_slice(buf);
                Ok(buf.len())
            }

            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let sink = Shared::default();
        let mut transport = StreamTransport::new(sink.clone());
        transport.write(b"hello ").unwrap();
        transport.write(b"world").unwrap();
        assert!(sink.0.lock().is_empty());

        transport.flush().unwrap();
        assert_eq!(sink.0.lock().as_slice(), b"hello world");

        transport.close();
        assert!(!transport.is_active());
        assert!(transport.flush().is_err());
    }

    #[test]
    fn test_tcp_transport() {
        use std::io::Read;
        use std::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (mut server, _) = listener.accept().unwrap();

        let mut transport = StreamTransport::tcp(client).unwrap();
        transport.write(b"ping").unwrap();
        transport.flush().unwrap();
        transport.close();

        let mut received = Vec::new();
        server.read_to_end(&mut received).unwrap();
        assert_eq!(received, b"ping");
    }
}
