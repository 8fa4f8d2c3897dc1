//! Message envelope: the fixed header preceding every payload on the wire.
//!
//! An envelope carries the message name, its kind, and the sequence id used
//! to correlate replies with outstanding calls. Inbound calls are addressed
//! as `"<service>:<method>"`; [`Envelope::split_service`] resolves the two
//! halves and [`Envelope::with_method_name`] produces the handler-facing
//! envelope.

use std::fmt;

/// Sequence id correlating a call with its reply.
pub type SequenceId = i64;

/// Separator between the service and method halves of a call name.
pub const SERVICE_SEPARATOR: char = ':';

// ---------------------------------------------------------------------------
// MessageKind
// ---------------------------------------------------------------------------

/// Kind of message carried by an envelope.
///
/// Discriminants are the on-wire values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    /// Request expecting a reply.
    Call = 1,
    /// Successful reply to a call.
    Reply = 2,
    /// Application exception raised while handling a call.
    Exception = 3,
    /// Request that expects no reply.
    Oneway = 4,
}

impl MessageKind {
    /// Returns the on-wire value of this kind.
    #[must_use]
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Converts an on-wire value back into a kind.
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Call),
            2 => Some(Self::Reply),
            3 => Some(Self::Exception),
            4 => Some(Self::Oneway),
            _ => None,
        }
    }

    /// True for the kinds that address a locally registered service.
    #[must_use]
    pub fn is_inbound_call(self) -> bool {
        matches!(self, Self::Call | Self::Oneway)
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Call => "call",
            Self::Reply => "reply",
            Self::Exception => "exception",
            Self::Oneway => "oneway",
        };
        f.write_str(name)
    }
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// Header of one framed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Message name. `"<service>:<method>"` for outbound calls.
    pub name: String,
    /// What the payload following this header contains.
    pub kind: MessageKind,
    /// Correlation id.
    pub sequence_id: SequenceId,
}

impl Envelope {
    /// Creates an envelope from its parts.
    pub fn new(name: impl Into<String>, kind: MessageKind, sequence_id: SequenceId) -> Self {
        Self {
            name: name.into(),
            kind,
            sequence_id,
        }
    }

    /// Builds a `Call` envelope addressed to `service:method`.
    #[must_use]
    pub fn call(service: &str, method: &str, sequence_id: SequenceId) -> Self {
        Self::new(qualified_name(service, method), MessageKind::Call, sequence_id)
    }

    /// Builds a `Oneway` envelope addressed to `service:method`.
    #[must_use]
    pub fn oneway(service: &str, method: &str, sequence_id: SequenceId) -> Self {
        Self::new(qualified_name(service, method), MessageKind::Oneway, sequence_id)
    }

    /// Splits the name on the first separator into `(service, method)`.
    ///
    /// Returns `None` when the name carries no separator.
    #[must_use]
    pub fn split_service(&self) -> Option<(&str, &str)> {
        self.name.split_once(SERVICE_SEPARATOR)
    }

    /// Returns a copy of this envelope renamed to `method`, keeping kind and id.
    #[must_use]
    pub fn with_method_name(&self, method: &str) -> Self {
        Self::new(method, self.kind, self.sequence_id)
    }

    /// Builds the `Reply` envelope answering this call.
    #[must_use]
    pub fn reply(&self) -> Self {
        Self::new(self.name.clone(), MessageKind::Reply, self.sequence_id)
    }

    /// Builds the `Exception` envelope answering this call.
    #[must_use]
    pub fn exception(&self) -> Self {
        Self::new(self.name.clone(), MessageKind::Exception, self.sequence_id)
    }
}

impl fmt::Display for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({}, seq={})", self.kind, self.name, self.sequence_id)
    }
}

/// Joins a service and method into the `"<service>:<method>"` call name.
#[must_use]
pub fn qualified_name(service: &str, method: &str) -> String {
    format!("{service}{SERVICE_SEPARATOR}{method}")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
