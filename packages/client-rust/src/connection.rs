//! Connection registry: one shared protocol per normalized address.
//!
//! Connections are created lazily on first use and live as long as the
//! registry. Creation is idempotent: the first caller for an address wins and
//! later settings or protocol kinds for the same address are ignored.

use std::fmt;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Mutex, MutexGuard};
use tickrpc_core::ProtocolKind;
use tracing::info;

use crate::config::TransportSettings;
use crate::error::RpcError;
use crate::protocol::Protocol;
use crate::transport::TransportRegistry;

/// Normalized (lower-cased) connection address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionKey(String);

impl ConnectionKey {
    #[must_use]
    pub fn new(address: &str) -> Self {
        Self(address.to_lowercase())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Text before the first `:`, if any.
    #[must_use]
    pub fn scheme(&self) -> Option<&str> {
        self.0.split_once(':').map(|(scheme, _)| scheme)
    }
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One logical connection: a protocol behind a lock.
///
/// The lock keeps frames whole: call issuers and the dispatch loop never
/// interleave partial writes or reads on the same transport.
#[derive(Debug)]
pub struct Connection {
    key: ConnectionKey,
    protocol: Mutex<Protocol>,
}

impl Connection {
    #[must_use]
    pub fn new(key: ConnectionKey, protocol: Protocol) -> Self {
        Self {
            key,
            protocol: Mutex::new(protocol),
        }
    }

    #[must_use]
    pub fn key(&self) -> &ConnectionKey {
        &self.key
    }

    /// Locks the protocol for one frame's worth of work.
    pub fn lock(&self) -> MutexGuard<'_, Protocol> {
        self.protocol.lock()
    }
}

/// Address -> connection map.
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionKey, Arc<Connection>>,
    transports: Arc<TransportRegistry>,
}

impl ConnectionRegistry {
    #[must_use]
    pub fn new(transports: Arc<TransportRegistry>) -> Self {
        Self {
            connections: DashMap::new(),
            transports,
        }
    }

    /// Returns the connection for `address`, creating and opening it on
    /// first use.
    ///
    /// The kind's content type is filled into `settings` unless the caller
    /// already set one.
    ///
    /// # Errors
    ///
    /// Returns `RpcError::MissingScheme` if `address` has no `:`,
    /// `RpcError::NoTransportFactory` if no factory serves its scheme, and
    /// `RpcError::Transport` if the transport cannot be created or opened.
    pub fn get_or_create(
        &self,
        address: &str,
        settings: &TransportSettings,
        kind: ProtocolKind,
    ) -> Result<Arc<Connection>, RpcError> {
        let key = ConnectionKey::new(address);
        if let Some(existing) = self.connections.get(&key) {
            return Ok(Arc::clone(existing.value()));
        }

        let scheme = key.scheme().ok_or_else(|| RpcError::MissingScheme {
            address: address.to_string(),
        })?;
        let factory = self
            .transports
            .get(scheme)
            .ok_or_else(|| RpcError::NoTransportFactory {
                scheme: scheme.to_string(),
            })?;

        match self.connections.entry(key) {
            Entry::Occupied(entry) => Ok(Arc::clone(entry.get())),
            Entry::Vacant(entry) => {
                let mut settings = settings.clone();
                if settings.content_type.is_none() {
                    settings.content_type = Some(kind.content_type().to_string());
                }
                let mut transport = factory.create(entry.key().as_str(), &settings)?;
                transport.open()?;

                let connection = Arc::new(Connection::new(
                    entry.key().clone(),
                    Protocol::new(kind, transport),
                ));
                info!(address = %entry.key(), protocol = %kind, "connection created");
                entry.insert(Arc::clone(&connection));
                Ok(connection)
            }
        }
    }

    /// Looks up an existing connection without creating one.
    #[must_use]
    pub fn get(&self, address: &str) -> Option<Arc<Connection>> {
        self.connections
            .get(&ConnectionKey::new(address))
            .map(|r| Arc::clone(r.value()))
    }

    /// Snapshot of every connection, for one dispatch tick.
    #[must_use]
    pub fn all(&self) -> Vec<Arc<Connection>> {
        let mut all: Vec<_> = self
            .connections
            .iter()
            .map(|r| Arc::clone(r.value()))
            .collect();
        all.sort_by(|a, b| a.key().cmp(b.key()));
        all
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

impl fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("connections", &self.connections.len())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
