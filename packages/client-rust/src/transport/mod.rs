//! Byte-level transports and the scheme registry that creates them.
//!
//! A transport turns some network primitive into a pollable pair of byte
//! buffers. The dispatch loop only ever asks it two things without blocking:
//! "is there data?" and "give me up to N bytes". Outbound bytes accumulate
//! until `flush` submits them.

pub mod http;

use std::io;
use std::sync::Arc;

use dashmap::DashMap;

use crate::config::TransportSettings;
use crate::error::TransportError;

pub use http::{ExchangeClient, ExchangeCompleter, HttpTransport, HttpTransportFactory, PendingExchange, ReqwestExchange};

// ---------------------------------------------------------------------------
// Transport trait
// ---------------------------------------------------------------------------

/// Pollable byte transport for one logical connection.
///
/// None of these methods may block on network I/O.
pub trait Transport: Send {
    /// Prepares the transport for use.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport cannot be established.
    fn open(&mut self) -> Result<(), TransportError>;

    /// Releases in-flight exchanges and buffered bytes.
    fn close(&mut self);

    /// Whether the transport still accepts writes.
    fn is_open(&self) -> bool;

    /// Non-blocking poll: true when unread inbound bytes are available.
    fn has_data(&mut self) -> bool;

    /// Copies up to `buf.len()` unread bytes into `buf`, returning the count.
    /// Returns 0 when the current inbound buffer is exhausted.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying source failed mid-read.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError>;

    /// Appends bytes to the outbound buffer.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport is closed.
    fn write(&mut self, buf: &[u8]) -> Result<(), TransportError>;

    /// Submits the buffered outbound bytes as one exchange.
    ///
    /// # Errors
    ///
    /// Returns an error if the exchange cannot be submitted.
    fn flush(&mut self) -> Result<(), TransportError>;

    /// Discards the unread remainder of the current inbound buffer.
    ///
    /// Returns the number of bytes discarded.
    fn drain(&mut self, chunk_size: usize) -> usize {
        let mut scratch = vec![0u8; chunk_size.max(1)];
        let mut discarded = 0;
        while let Ok(n) = self.read(&mut scratch) {
            if n == 0 {
                break;
            }
            discarded += n;
        }
        discarded
    }

    /// Number of submitted exchanges that failed and were dropped while polling.
    fn dropped_exchanges(&self) -> u64 {
        0
    }
}

// ---------------------------------------------------------------------------
// TransportFactory
// ---------------------------------------------------------------------------

/// Creates transports for addresses of one scheme.
pub trait TransportFactory: Send + Sync {
    /// Builds an unopened transport for `address`.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport cannot be constructed.
    fn create(
        &self,
        address: &str,
        settings: &TransportSettings,
    ) -> Result<Box<dyn Transport>, TransportError>;
}

impl<F> TransportFactory for F
where
    F: Fn(&str, &TransportSettings) -> Result<Box<dyn Transport>, TransportError> + Send + Sync,
{
    fn create(
        &self,
        address: &str,
        settings: &TransportSettings,
    ) -> Result<Box<dyn Transport>, TransportError> {
        self(address, settings)
    }
}

/// Scheme -> factory lookup. Schemes are matched case-insensitively.
#[derive(Default)]
pub struct TransportRegistry {
    factories: DashMap<String, Arc<dyn TransportFactory>>,
}

impl TransportRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `factory` for `scheme`, replacing any earlier registration.
    pub fn register(&self, scheme: &str, factory: Arc<dyn TransportFactory>) {
        self.factories.insert(scheme.to_ascii_lowercase(), factory);
    }

    /// Looks up the factory for `scheme`.
    #[must_use]
    pub fn get(&self, scheme: &str) -> Option<Arc<dyn TransportFactory>> {
        self.factories
            .get(&scheme.to_ascii_lowercase())
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Whether a factory is registered for `scheme`.
    #[must_use]
    pub fn contains(&self, scheme: &str) -> bool {
        self.factories.contains_key(&scheme.to_ascii_lowercase())
    }
}

// ---------------------------------------------------------------------------
// std::io adapter
// ---------------------------------------------------------------------------

/// Exposes a transport as `std::io::Read + Write` for the codecs.
///
/// `Write::flush` is a no-op: exchanges are only submitted by an explicit
/// [`Transport::flush`].
pub(crate) struct TransportIo<'a>(pub(crate) &'a mut dyn Transport);

impl io::Read for TransportIo<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf).map_err(io::Error::other)
    }
}

impl io::Write for TransportIo<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf).map_err(io::Error::other)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod tests {
    use std::io::{Read, Write};

    use parking_lot::Mutex;

    use super::*;

    #[derive(Default)]
    pub(crate) struct MemoryState {
        pub(crate) inbound: Vec<u8>,
        pub(crate) read_pos: usize,
        pub(crate) outbound: Vec<u8>,
        pub(crate) flushed: Vec<Vec<u8>>,
        pub(crate) closed: bool,
    }

    /// In-memory transport: inbound bytes are queued by the test, outbound
    /// flushes are recorded. Clones share state, so a test keeps one handle
    /// while the code under test owns another.
    #[derive(Clone, Default)]
    pub(crate) struct MemoryTransport(pub(crate) Arc<Mutex<MemoryState>>);

    impl MemoryTransport {
        pub(crate) fn with_inbound(bytes: Vec<u8>) -> Self {
            let transport = Self::default();
            transport.push_inbound(&bytes);
            transport
        }

        pub(crate) fn push_inbound(&self, bytes: &[u8]) {
            self.0.lock().inbound.extend_from_slice(bytes);
        }

        pub(crate) fn flushed(&self) -> Vec<Vec<u8>> {
            self.0.lock().flushed.clone()
        }

        pub(crate) fn outbound(&self) -> Vec<u8> {
            self.0.lock().outbound.clone()
        }
    }

    impl Transport for MemoryTransport {
        fn open(&mut self) -> Result<(), TransportError> {
            self.0.lock().closed = false;
            Ok(())
        }

        fn close(&mut self) {
            self.0.lock().closed = true;
        }

        fn is_open(&self) -> bool {
            !self.0.lock().closed
        }

        fn has_data(&mut self) -> bool {
            let state = self.0.lock();
            state.read_pos < state.inbound.len()
        }

        fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
            let mut state = self.0.lock();
            let pos = state.read_pos;
            let n = buf.len().min(state.inbound.len() - pos);
            buf[..n].copy_from_slice(&state.inbound[pos..pos + n]);
            state.read_pos += n;
            Ok(n)
        }

        fn write(&mut self, buf: &[u8]) -> Result<(), TransportError> {
            let mut state = self.0.lock();
            if state.closed {
                return Err(TransportError::Closed);
            }
            state.outbound.extend_from_slice(buf);
            Ok(())
        }

        fn flush(&mut self) -> Result<(), TransportError> {
            let mut state = self.0.lock();
            if state.closed {
                return Err(TransportError::Closed);
            }
            let body = std::mem::take(&mut state.outbound);
            state.flushed.push(body);
            Ok(())
        }
    }

    #[test]
    fn default_drain_discards_remaining_bytes() {
        let mut transport = MemoryTransport::with_inbound(vec![7u8; 300]);
        let mut head = [0u8; 10];
        transport.read(&mut head).unwrap();
        assert_eq!(transport.drain(128), 290);
        assert!(!transport.has_data());
    }

    #[test]
    fn io_adapter_reads_and_writes_without_submitting() {
        let mut transport = MemoryTransport::with_inbound(b"hello".to_vec());
        let handle = transport.clone();
        {
            let mut io = TransportIo(&mut transport);
            let mut buf = [0u8; 3];
            assert_eq!(io.read(&mut buf).unwrap(), 3);
            assert_eq!(&buf, b"hel");
            io.write_all(b"out").unwrap();
            io.flush().unwrap();
        }
        assert_eq!(handle.outbound(), b"out");
        assert!(handle.flushed().is_empty());
    }

    #[test]
    fn registry_matches_schemes_case_insensitively() {
        let registry = TransportRegistry::new();
        let factory = |_: &str, _: &TransportSettings| -> Result<Box<dyn Transport>, TransportError> {
            Ok(Box::new(MemoryTransport::default()))
        };
        registry.register("MEM", Arc::new(factory));

        assert!(registry.contains("mem"));
        assert!(registry.get("Mem").is_some());
        assert!(registry.get("http").is_none());
    }
}
