//! Locally hosted services that answer inbound calls.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tickrpc_core::{ApplicationException, ApplicationExceptionKind, Envelope, MessageKind, Value};
use tracing::{debug, info, warn};

use crate::error::RpcError;
use crate::protocol::Protocol;

// ---------------------------------------------------------------------------
// ServiceHandler trait
// ---------------------------------------------------------------------------

/// Handler for inbound calls addressed to one service.
///
/// `process` runs on the thread driving the dispatch loop while the
/// connection's protocol is borrowed. The envelope's name is already the bare
/// method name and the arguments are still unread. A handler must consume the
/// arguments and write any reply through `protocol`; it must not issue calls
/// on the same connection from inside `process`.
pub trait ServiceHandler: Send + Sync {
    /// The name callers use before the `:` separator.
    fn service_name(&self) -> &str;

    /// Handles one inbound `Call` or `Oneway`.
    ///
    /// # Errors
    ///
    /// Returns an error if the arguments cannot be read or the reply cannot
    /// be written; the dispatch loop treats it as a connection fault.
    fn process(&self, call: &Envelope, protocol: &mut Protocol) -> Result<(), RpcError>;
}

// ---------------------------------------------------------------------------
// ServiceRegistry
// ---------------------------------------------------------------------------

/// Service name -> handler.
#[derive(Default)]
pub struct ServiceRegistry {
    handlers: DashMap<String, Arc<dyn ServiceHandler>>,
}

impl ServiceRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` under its service name.
    ///
    /// # Errors
    ///
    /// Returns `RpcError::DuplicateService` if the name is already taken.
    pub fn register(&self, handler: Arc<dyn ServiceHandler>) -> Result<(), RpcError> {
        let name = handler.service_name().to_string();
        match self.handlers.entry(name) {
            Entry::Occupied(entry) => Err(RpcError::DuplicateService {
                name: entry.key().clone(),
            }),
            Entry::Vacant(entry) => {
                info!(service = %entry.key(), "service registered");
                entry.insert(handler);
                Ok(())
            }
        }
    }

    /// Looks up the handler for `name`.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn ServiceHandler>> {
        self.handlers.get(name).map(|entry| Arc::clone(entry.value()))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<String> = self.handlers.iter().map(|e| e.key().clone()).collect();
        names.sort();
        f.debug_struct("ServiceRegistry").field("services", &names).finish()
    }
}

// ---------------------------------------------------------------------------
// MethodRouter
// ---------------------------------------------------------------------------

type MethodFn = Box<dyn Fn(Value) -> Result<Value, ApplicationException> + Send + Sync>;

/// A [`ServiceHandler`] assembled from per-method closures.
///
/// Each method receives its argument value and returns a reply value or an
/// application exception. Unknown methods are answered with an
/// `UnknownMethod` exception; oneway calls never get a reply.
pub struct MethodRouter {
    service: String,
    methods: HashMap<String, MethodFn>,
}

impl MethodRouter {
    #[must_use]
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            methods: HashMap::new(),
        }
    }

    /// Adds (or replaces) a method.
    #[must_use]
    pub fn method<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Value) -> Result<Value, ApplicationException> + Send + Sync + 'static,
    {
        self.methods.insert(name.into(), Box::new(f));
        self
    }
}

impl ServiceHandler for MethodRouter {
    fn service_name(&self) -> &str {
        &self.service
    }

    fn process(&self, call: &Envelope, protocol: &mut Protocol) -> Result<(), RpcError> {
        let args = protocol.read_value()?;
        protocol.read_message_end()?;

        let outcome = match self.methods.get(&call.name) {
            Some(method) => method(args),
            None => Err(ApplicationException::new(
                ApplicationExceptionKind::UnknownMethod,
                format!("unknown method {}:{}", self.service, call.name),
            )),
        };

        if call.kind == MessageKind::Oneway {
            if let Err(exception) = outcome {
                warn!(service = %self.service, %call, %exception, "oneway call failed");
            }
            return Ok(());
        }

        match outcome {
            Ok(value) => protocol.write_reply(call, &value),
            Err(exception) => {
                debug!(service = %self.service, %call, %exception, "replying with exception");
                protocol.write_exception(call, &exception)
            }
        }
    }
}

impl fmt::Debug for MethodRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut methods: Vec<&String> = self.methods.keys().collect();
        methods.sort();
        f.debug_struct("MethodRouter")
            .field("service", &self.service)
            .field("methods", &methods)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
