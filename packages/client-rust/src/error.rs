//! Error types for the client runtime.

use std::time::Duration;

use tickrpc_core::{ApplicationException, CodecError, UnsupportedProtocolKind};

/// Errors raised by transports.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The transport was closed and can no longer submit exchanges.
    #[error("transport is closed")]
    Closed,
    /// An exchange could not be submitted or failed in flight.
    #[error("exchange failed: {0}")]
    Exchange(String),
    /// No async runtime is available to run exchanges on.
    #[error("no runtime available for exchanges: {0}")]
    Runtime(String),
}

/// Errors surfaced by the client: usage mistakes, call outcomes, and faults.
///
/// `Timeout` and `Application` are only ever delivered through a call's
/// completion callback; the configuration variants are returned synchronously
/// by the offending operation.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("no default address configured; call set_default_address first")]
    NoDefaultAddress,
    #[error(transparent)]
    UnsupportedProtocol(#[from] UnsupportedProtocolKind),
    #[error("address has no scheme prefix: {address}")]
    MissingScheme { address: String },
    #[error("no transport factory registered for scheme: {scheme}")]
    NoTransportFactory { scheme: String },
    #[error("service already registered: {name}")]
    DuplicateService { name: String },
    #[error("call timed out after {elapsed:?} (budget {timeout:?})")]
    Timeout { timeout: Duration, elapsed: Duration },
    #[error("remote application exception: {0}")]
    Application(ApplicationException),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
}

impl RpcError {
    /// True for the configuration mistakes reported synchronously.
    #[must_use]
    pub fn is_usage_error(&self) -> bool {
        matches!(
            self,
            Self::NoDefaultAddress
                | Self::UnsupportedProtocol(_)
                | Self::MissingScheme { .. }
                | Self::NoTransportFactory { .. }
                | Self::DuplicateService { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use tickrpc_core::ApplicationExceptionKind;

    use super::*;

    #[test]
    fn timeout_and_application_errors_are_distinct() {
        let timeout = RpcError::Timeout {
            timeout: Duration::from_secs(1),
            elapsed: Duration::from_millis(1_100),
        };
        let app = RpcError::Application(ApplicationException::new(
            ApplicationExceptionKind::InternalError,
            "boom",
        ));
        assert!(matches!(timeout, RpcError::Timeout { .. }));
        assert!(matches!(app, RpcError::Application(_)));
        assert!(!timeout.is_usage_error());
        assert!(!app.is_usage_error());
    }

    #[test]
    fn usage_errors_read_as_configuration_mistakes() {
        let err = RpcError::NoTransportFactory {
            scheme: "ws".to_string(),
        };
        assert!(err.is_usage_error());
        assert_eq!(err.to_string(), "no transport factory registered for scheme: ws");

        let err: RpcError = UnsupportedProtocolKind("compact".to_string()).into();
        assert!(err.is_usage_error());
        assert_eq!(err.to_string(), "unsupported protocol kind: compact");
    }
}
