//! Binary and JSON codecs for envelopes and payload values.
//!
//! Both codecs operate on plain `std::io::Read` / `std::io::Write` and never
//! read past the item they decode, so several messages may share one buffer.
//!
//! | Kind     | Envelope                      | Payload                 |
//! |----------|-------------------------------|-------------------------|
//! | `Binary` | `MsgPack` `[name, kind, seq]` | one `MsgPack` value     |
//! | `Json`   | `["name", kind, seq]`         | `[value]` (wrapped)     |
//!
//! JSON payloads are wrapped in a one-element array because a bare JSON
//! number is only terminated by the byte after it, which the decoder would
//! have to consume.

use std::fmt;
use std::io::{Read, Write};
use std::str::FromStr;

use rmpv::Value;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::envelope::{Envelope, MessageKind, SequenceId};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors raised while encoding or decoding envelopes and payloads.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("msgpack encode failed: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),
    #[error("msgpack decode failed: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),
    #[error("msgpack value decode failed: {0}")]
    ValueDecode(#[from] rmpv::decode::Error),
    #[error("msgpack value encode failed: {0}")]
    ValueEncode(String),
    #[error("json codec failed: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid message kind on the wire: {0}")]
    InvalidMessageKind(u8),
    #[error("malformed application exception: {0}")]
    MalformedException(String),
    #[error("payload conversion failed: {0}")]
    Payload(#[from] rmpv::ext::Error),
}

/// Returned when a protocol kind name is not one of the supported kinds.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unsupported protocol kind: {0}")]
pub struct UnsupportedProtocolKind(pub String);

// ---------------------------------------------------------------------------
// ProtocolKind
// ---------------------------------------------------------------------------

/// Structured encoding used on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolKind {
    /// `MessagePack`.
    #[default]
    Binary,
    /// JSON text.
    Json,
}

/// On-wire envelope layout shared by both codecs.
type WireEnvelope = (String, u8, SequenceId);

impl ProtocolKind {
    /// Name accepted by `FromStr`.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Binary => "binary",
            Self::Json => "json",
        }
    }

    /// MIME type advertised by transports carrying this encoding.
    #[must_use]
    pub fn content_type(self) -> &'static str {
        match self {
            Self::Binary => "application/msgpack",
            Self::Json => "application/json",
        }
    }

    /// Writes a message envelope.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding or the underlying writer fails.
    pub fn encode_envelope<W: Write>(self, writer: &mut W, envelope: &Envelope) -> Result<(), CodecError> {
        let wire = (envelope.name.as_str(), envelope.kind.as_u8(), envelope.sequence_id);
        match self {
            Self::Binary => rmp_serde::encode::write(writer, &wire)?,
            Self::Json => serde_json::to_writer(writer, &wire)?,
        }
        Ok(())
    }

    /// Reads exactly one message envelope.
    ///
    /// # Errors
    ///
    /// Returns an error on malformed or truncated input, or an unknown kind.
    pub fn decode_envelope<R: Read>(self, reader: &mut R) -> Result<Envelope, CodecError> {
        let (name, kind, sequence_id): WireEnvelope = match self {
            Self::Binary => rmp_serde::decode::from_read(reader)?,
            Self::Json => {
                let mut de = serde_json::Deserializer::from_reader(reader);
                <WireEnvelope as Deserialize>::deserialize(&mut de)?
            }
        };
        let kind = MessageKind::from_u8(kind).ok_or(CodecError::InvalidMessageKind(kind))?;
        Ok(Envelope {
            name,
            kind,
            sequence_id,
        })
    }

    /// Writes one payload value.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding or the underlying writer fails. JSON
    /// returns `CodecError::Json` for values it cannot carry unchanged: map
    /// keys that are not strings, binary and extension values, and
    /// non-finite floats. Nothing is written in that case.
    pub fn encode_value<W: Write>(self, writer: &mut W, value: &Value) -> Result<(), CodecError> {
        match self {
            Self::Binary => rmpv::encode::write_value(writer, value)
                .map_err(|e| CodecError::ValueEncode(e.to_string()))?,
            Self::Json => {
                check_json_representable(value)?;
                serde_json::to_writer(writer, &[value])?;
            }
        }
        Ok(())
    }

    /// Reads exactly one payload value.
    ///
    /// # Errors
    ///
    /// Returns an error on malformed or truncated input.
    pub fn decode_value<R: Read>(self, reader: &mut R) -> Result<Value, CodecError> {
        match self {
            Self::Binary => Ok(rmpv::decode::read_value(reader)?),
            Self::Json => {
                let mut de = serde_json::Deserializer::from_reader(reader);
                let (value,) = <(Value,)>::deserialize(&mut de)?;
                Ok(value)
            }
        }
    }
}

/// Rejects any part of `value` that would not decode back to itself from JSON.
fn check_json_representable(value: &Value) -> Result<(), serde_json::Error> {
    use serde::ser::Error as _;

    match value {
        Value::Map(entries) => entries.iter().try_for_each(|(key, item)| {
            if !key.is_str() {
                return Err(serde_json::Error::custom(format!(
                    "JSON map keys must be strings, found {key}"
                )));
            }
            check_json_representable(item)
        }),
        Value::Array(items) => items.iter().try_for_each(check_json_representable),
        Value::Binary(_) => Err(serde_json::Error::custom("JSON cannot carry binary values")),
        Value::Ext(tag, _) => Err(serde_json::Error::custom(format!(
            "JSON cannot carry extension type {tag}"
        ))),
        Value::F32(f) if !f.is_finite() => {
            Err(serde_json::Error::custom(format!("JSON cannot carry float {f}")))
        }
        Value::F64(f) if !f.is_finite() => {
            Err(serde_json::Error::custom(format!("JSON cannot carry float {f}")))
        }
        _ => Ok(()),
    }
}

impl fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProtocolKind {
    type Err = UnsupportedProtocolKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("binary") {
            Ok(Self::Binary)
        } else if s.eq_ignore_ascii_case("json") {
            Ok(Self::Json)
        } else {
            Err(UnsupportedProtocolKind(s.to_string()))
        }
    }
}

// ---------------------------------------------------------------------------
// Typed payload helpers
// ---------------------------------------------------------------------------

/// Converts a serializable value into a payload value.
///
/// # Errors
///
/// Returns `CodecError::Payload` if `T`'s `Serialize` impl fails.
pub fn to_payload<T: Serialize + ?Sized>(value: &T) -> Result<Value, CodecError> {
    Ok(rmpv::ext::to_value(value)?)
}

/// Converts a payload value into a typed value.
///
/// # Errors
///
/// Returns `CodecError::Payload` if the value does not match `T`'s shape.
pub fn from_payload<T: DeserializeOwned>(value: Value) -> Result<T, CodecError> {
    Ok(rmpv::ext::from_value(value)?)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
