//! `tickrpc` Core: message envelopes, application exceptions, and the binary
//! and JSON codecs shared by every connection.

pub mod codec;
pub mod envelope;
pub mod exception;

pub use codec::{from_payload, to_payload, CodecError, ProtocolKind, UnsupportedProtocolKind};
pub use envelope::{qualified_name, Envelope, MessageKind, SequenceId, SERVICE_SEPARATOR};
pub use exception::{ApplicationException, ApplicationExceptionKind};

/// Dynamic payload value exchanged between the codecs and callers.
pub use rmpv::Value;
