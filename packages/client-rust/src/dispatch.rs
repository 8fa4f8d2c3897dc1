//! The drive loop: one decode-or-sweep step per connection per tick.
//!
//! Each tick visits every connection once. An idle connection sweeps its own
//! expired sessions; a connection with data decodes exactly one message and
//! routes it to a local service handler (inbound call) or to the waiting
//! session (reply or exception). Sessions are therefore only swept while
//! their connection is idle: a connection that always has data can hold a
//! session past its budget.
//!
//! Completion callbacks run after the connection lock is released.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tickrpc_core::{ApplicationException, MessageKind};
use tracing::{debug, error, warn};

use crate::connection::{Connection, ConnectionRegistry};
use crate::error::RpcError;
use crate::protocol::Protocol;
use crate::service::ServiceRegistry;
use crate::session::{Reply, Session, SessionTable};

// ---------------------------------------------------------------------------
// DispatchStats
// ---------------------------------------------------------------------------

/// Running totals across all ticks.
#[derive(Debug, Default)]
pub struct DispatchStats {
    processed: AtomicU64,
    skipped: AtomicU64,
    expired: AtomicU64,
    faults: AtomicU64,
}

impl DispatchStats {
    /// Messages handled: inbound calls run and sessions completed by a reply
    /// or exception.
    #[must_use]
    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    /// Messages discarded: unroutable calls and replies with no session.
    #[must_use]
    pub fn skipped(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }

    /// Sessions expired by idle sweeps.
    #[must_use]
    pub fn expired(&self) -> u64 {
        self.expired.load(Ordering::Relaxed)
    }

    /// Decode or transport faults that drained a connection.
    #[must_use]
    pub fn faults(&self) -> u64 {
        self.faults.load(Ordering::Relaxed)
    }

    fn add(counter: &AtomicU64, n: usize) {
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

/// What one step on one connection produced.
enum Step {
    Idle,
    Skipped,
    Handled,
    Completed(Session, Result<Reply, RpcError>),
}

/// Routes decoded messages between connections, sessions and services.
#[derive(Debug)]
pub struct Dispatcher {
    connections: Arc<ConnectionRegistry>,
    sessions: Arc<SessionTable>,
    services: Arc<ServiceRegistry>,
    stats: DispatchStats,
    drain_chunk_size: usize,
}

impl Dispatcher {
    #[must_use]
    pub fn new(
        connections: Arc<ConnectionRegistry>,
        sessions: Arc<SessionTable>,
        services: Arc<ServiceRegistry>,
        drain_chunk_size: usize,
    ) -> Self {
        Self {
            connections,
            sessions,
            services,
            stats: DispatchStats::default(),
            drain_chunk_size,
        }
    }

    #[must_use]
    pub fn stats(&self) -> &DispatchStats {
        &self.stats
    }

    /// Runs one step on every connection.
    ///
    /// Returns the number of messages processed this tick.
    ///
    /// # Errors
    ///
    /// Returns the first connection fault of the tick, after every connection
    /// has been stepped. The faulting connection's read buffer has already
    /// been drained.
    pub fn tick(&self, now: Instant) -> Result<usize, RpcError> {
        let mut processed = 0;
        let mut first_fault = None;

        for connection in self.connections.all() {
            match self.step(&connection, now) {
                Ok(true) => processed += 1,
                Ok(false) => {}
                Err(err) => {
                    first_fault.get_or_insert(err);
                }
            }
        }

        match first_fault {
            Some(err) => Err(err),
            None => Ok(processed),
        }
    }

    /// Steps one connection. Returns whether a message was processed.
    fn step(&self, connection: &Connection, now: Instant) -> Result<bool, RpcError> {
        let step = {
            let mut protocol = connection.lock();
            if protocol.has_data() {
                match self.read_one(&mut protocol) {
                    Ok(step) => step,
                    Err(err) => {
                        let drained = protocol.drain(self.drain_chunk_size);
                        DispatchStats::add(&self.stats.faults, 1);
                        error!(
                            connection = %connection.key(),
                            drained,
                            error = %err,
                            "dispatch fault; read buffer drained"
                        );
                        return Err(err);
                    }
                }
            } else {
                Step::Idle
            }
        };

        match step {
            Step::Idle => {
                let expired = self.sessions.sweep_connection(now, connection.key());
                DispatchStats::add(&self.stats.expired, expired);
                Ok(false)
            }
            Step::Skipped => {
                DispatchStats::add(&self.stats.skipped, 1);
                Ok(false)
            }
            Step::Handled => {
                DispatchStats::add(&self.stats.processed, 1);
                Ok(true)
            }
            Step::Completed(session, result) => {
                session.complete(result);
                DispatchStats::add(&self.stats.processed, 1);
                Ok(true)
            }
        }
    }

    /// Decodes and routes one message. Runs with the connection locked.
    fn read_one(&self, protocol: &mut Protocol) -> Result<Step, RpcError> {
        let envelope = protocol.read_message_begin()?;
        debug!(%envelope, "message received");

        match envelope.kind {
            MessageKind::Call | MessageKind::Oneway => {
                let Some((service, method)) = envelope.split_service() else {
                    warn!(%envelope, "inbound call without a service name; skipping");
                    protocol.skip()?;
                    protocol.read_message_end()?;
                    return Ok(Step::Skipped);
                };
                let Some(handler) = self.services.get(service) else {
                    warn!(%envelope, service, "no handler registered; skipping");
                    protocol.skip()?;
                    protocol.read_message_end()?;
                    return Ok(Step::Skipped);
                };
                let call = envelope.with_method_name(method);
                handler.process(&call, protocol)?;
                Ok(Step::Handled)
            }
            MessageKind::Reply | MessageKind::Exception => {
                let payload = protocol.read_value()?;
                protocol.read_message_end()?;

                let Some(session) = self.sessions.resolve(envelope.sequence_id) else {
                    warn!(%envelope, "no pending session; late or duplicate reply skipped");
                    return Ok(Step::Skipped);
                };

                let result = if envelope.kind == MessageKind::Reply {
                    Ok(Reply::new(payload))
                } else {
                    Err(match ApplicationException::from_value(&payload) {
                        Ok(exception) => RpcError::Application(exception),
                        Err(err) => RpcError::Codec(err),
                    })
                };
                Ok(Step::Completed(session, result))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
