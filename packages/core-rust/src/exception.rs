//! Application exceptions carried in `Exception` replies.
//!
//! On the wire an exception is a map `{"message": <string>, "kind": <int>}`.
//! Unknown numeric kinds decode as [`ApplicationExceptionKind::Unknown`] so a
//! newer peer never turns an exception into a decode fault.

use std::fmt;

use rmpv::Value;

use crate::codec::CodecError;

const MESSAGE_FIELD: &str = "message";
const KIND_FIELD: &str = "kind";

/// Category of an application exception. Discriminants are the wire values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApplicationExceptionKind {
    Unknown = 0,
    UnknownMethod = 1,
    InvalidMessageType = 2,
    WrongMethodName = 3,
    BadSequenceId = 4,
    MissingResult = 5,
    InternalError = 6,
    ProtocolError = 7,
    InvalidTransform = 8,
    InvalidProtocol = 9,
    UnsupportedClientType = 10,
    RequestTimeOut = 11,
    UnknownService = 12,
    TransportException = 13,
    ProtocolException = 14,
    AccessDenied = 15,
}

impl ApplicationExceptionKind {
    /// Maps a wire value to a kind, falling back to `Unknown`.
    #[must_use]
    pub fn from_i64(value: i64) -> Self {
        match value {
            1 => Self::UnknownMethod,
            2 => Self::InvalidMessageType,
            3 => Self::WrongMethodName,
            4 => Self::BadSequenceId,
            5 => Self::MissingResult,
            6 => Self::InternalError,
            7 => Self::ProtocolError,
            8 => Self::InvalidTransform,
            9 => Self::InvalidProtocol,
            10 => Self::UnsupportedClientType,
            11 => Self::RequestTimeOut,
            12 => Self::UnknownService,
            13 => Self::TransportException,
            14 => Self::ProtocolException,
            15 => Self::AccessDenied,
            _ => Self::Unknown,
        }
    }

    /// Text used when an exception carries no message of its own.
    #[must_use]
    pub fn default_message(self) -> &'static str {
        match self {
            Self::Unknown => "unknown application exception",
            Self::UnknownMethod => "unknown method",
            Self::InvalidMessageType => "invalid message type",
            Self::WrongMethodName => "wrong method name",
            Self::BadSequenceId => "bad sequence identifier",
            Self::MissingResult => "missing result",
            Self::InternalError => "internal error",
            Self::ProtocolError => "protocol error",
            Self::InvalidTransform => "invalid transform",
            Self::InvalidProtocol => "invalid protocol",
            Self::UnsupportedClientType => "unsupported client type",
            Self::RequestTimeOut => "request time out",
            Self::UnknownService => "unknown service",
            Self::TransportException => "transport exception",
            Self::ProtocolException => "protocol exception",
            Self::AccessDenied => "access denied",
        }
    }
}

/// Exception raised by a remote handler and returned in place of a reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplicationException {
    pub kind: ApplicationExceptionKind,
    /// Free-form description. May be empty.
    pub message: String,
}

impl ApplicationException {
    pub fn new(kind: ApplicationExceptionKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Encodes this exception as a payload value.
    #[must_use]
    pub fn to_value(&self) -> Value {
        Value::Map(vec![
            (
                Value::from(MESSAGE_FIELD),
                Value::from(self.message.as_str()),
            ),
            (Value::from(KIND_FIELD), Value::from(self.kind as i64)),
        ])
    }

    /// Decodes an exception from a payload value.
    ///
    /// Missing fields default to an empty message and `Unknown`.
    ///
    /// # Errors
    ///
    /// Returns `CodecError::MalformedException` when the value is not a map or
    /// a field has the wrong type.
    pub fn from_value(value: &Value) -> Result<Self, CodecError> {
        let Value::Map(entries) = value else {
            return Err(CodecError::MalformedException(format!(
                "expected a map, found {value}"
            )));
        };

        let mut exception = Self::new(ApplicationExceptionKind::Unknown, String::new());
        for (key, field) in entries {
            match key.as_str() {
                Some(MESSAGE_FIELD) => {
                    exception.message = field
                        .as_str()
                        .ok_or_else(|| {
                            CodecError::MalformedException(format!(
                                "message must be a string, found {field}"
                            ))
                        })?
                        .to_string();
                }
                Some(KIND_FIELD) => {
                    let raw = field.as_i64().ok_or_else(|| {
                        CodecError::MalformedException(format!(
                            "kind must be an integer, found {field}"
                        ))
                    })?;
                    exception.kind = ApplicationExceptionKind::from_i64(raw);
                }
                _ => {}
            }
        }
        Ok(exception)
    }
}

impl fmt::Display for ApplicationException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            f.write_str(self.kind.default_message())
        } else {
            f.write_str(&self.message)
        }
    }
}

impl std::error::Error for ApplicationException {}
