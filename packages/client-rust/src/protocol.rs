//! Framed message primitives over a transport.
//!
//! `Protocol` pairs one transport with one codec. The dispatch loop decides
//! *when* to read; handlers and channels decide *what* to write.

use serde::de::DeserializeOwned;
use serde::Serialize;
use tickrpc_core::{
    from_payload, to_payload, ApplicationException, Envelope, ProtocolKind, Value,
};

use crate::error::{RpcError, TransportError};
use crate::transport::{Transport, TransportIo};

/// A transport wrapped in a codec.
pub struct Protocol {
    kind: ProtocolKind,
    transport: Box<dyn Transport>,
}

impl Protocol {
    #[must_use]
    pub fn new(kind: ProtocolKind, transport: Box<dyn Transport>) -> Self {
        Self { kind, transport }
    }

    /// The codec used for envelopes and payloads.
    #[must_use]
    pub fn kind(&self) -> ProtocolKind {
        self.kind
    }

    /// Direct access to the underlying transport.
    pub fn transport_mut(&mut self) -> &mut dyn Transport {
        self.transport.as_mut()
    }

    /// Non-blocking: whether unread inbound bytes are available.
    pub fn has_data(&mut self) -> bool {
        self.transport.has_data()
    }

    /// Discards the unread remainder of the current inbound buffer.
    pub fn drain(&mut self, chunk_size: usize) -> usize {
        self.transport.drain(chunk_size)
    }

    /// Exchanges the transport dropped after they failed.
    #[must_use]
    pub fn dropped_exchanges(&self) -> u64 {
        self.transport.dropped_exchanges()
    }

    // -- reading ------------------------------------------------------------

    /// Reads the next message envelope.
    ///
    /// # Errors
    ///
    /// Returns `RpcError::Codec` if the bytes do not form an envelope.
    pub fn read_message_begin(&mut self) -> Result<Envelope, RpcError> {
        let mut io = TransportIo(self.transport.as_mut());
        Ok(self.kind.decode_envelope(&mut io)?)
    }

    /// Reads one payload value.
    ///
    /// # Errors
    ///
    /// Returns `RpcError::Codec` if the bytes do not form a value.
    pub fn read_value(&mut self) -> Result<Value, RpcError> {
        let mut io = TransportIo(self.transport.as_mut());
        Ok(self.kind.decode_value(&mut io)?)
    }

    /// Reads one payload value and converts it to `T`.
    ///
    /// # Errors
    ///
    /// Returns `RpcError::Codec` if the value is missing or has the wrong shape.
    pub fn read_args<T: DeserializeOwned>(&mut self) -> Result<T, RpcError> {
        let value = self.read_value()?;
        Ok(from_payload(value)?)
    }

    /// Consumes one payload value without interpreting it.
    ///
    /// # Errors
    ///
    /// Returns `RpcError::Codec` if the bytes do not form a value.
    pub fn skip(&mut self) -> Result<(), RpcError> {
        self.read_value().map(drop)
    }

    /// Ends a message read. Both codecs are self-delimiting, so this reads
    /// nothing.
    ///
    /// # Errors
    ///
    /// Never fails for the built-in codecs.
    pub fn read_message_end(&mut self) -> Result<(), RpcError> {
        Ok(())
    }

    // -- writing ------------------------------------------------------------

    /// Writes a message envelope into the outbound buffer.
    ///
    /// # Errors
    ///
    /// Returns `RpcError::Transport` if the transport is closed, or
    /// `RpcError::Codec` if encoding fails.
    pub fn write_message_begin(&mut self, envelope: &Envelope) -> Result<(), RpcError> {
        if !self.transport.is_open() {
            return Err(TransportError::Closed.into());
        }
        let mut io = TransportIo(self.transport.as_mut());
        Ok(self.kind.encode_envelope(&mut io, envelope)?)
    }

    /// Writes one payload value into the outbound buffer.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails or the transport is closed.
    pub fn write_value(&mut self, value: &Value) -> Result<(), RpcError> {
        let mut io = TransportIo(self.transport.as_mut());
        Ok(self.kind.encode_value(&mut io, value)?)
    }

    /// Converts `args` to a payload value and writes it.
    ///
    /// # Errors
    ///
    /// Returns an error if `args` cannot be represented as a value or
    /// encoding fails.
    pub fn write_args<T: Serialize + ?Sized>(&mut self, args: &T) -> Result<(), RpcError> {
        let value = to_payload(args)?;
        self.write_value(&value)
    }

    /// Ends a message write. Nothing is written for the built-in codecs.
    ///
    /// # Errors
    ///
    /// Never fails for the built-in codecs.
    pub fn write_message_end(&mut self) -> Result<(), RpcError> {
        Ok(())
    }

    /// Submits everything written since the last flush as one exchange.
    ///
    /// # Errors
    ///
    /// Returns `RpcError::Transport` if the exchange cannot be submitted.
    pub fn flush(&mut self) -> Result<(), RpcError> {
        Ok(self.transport.flush()?)
    }

    /// Writes and flushes a complete `Reply` for `call`.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding or submission fails.
    pub fn write_reply(&mut self, call: &Envelope, value: &Value) -> Result<(), RpcError> {
        self.write_message_begin(&call.reply())?;
        self.write_value(value)?;
        self.write_message_end()?;
        self.flush()
    }

    /// Writes and flushes a complete `Exception` for `call`.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding or submission fails.
    pub fn write_exception(
        &mut self,
        call: &Envelope,
        exception: &ApplicationException,
    ) -> Result<(), RpcError> {
        self.write_message_begin(&call.exception())?;
        self.write_value(&exception.to_value())?;
        self.write_message_end()?;
        self.flush()
    }
}

impl std::fmt::Debug for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Protocol")
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
