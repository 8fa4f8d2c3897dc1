//! `RpcClient`: the explicitly owned entry point.
//!
//! The client owns every registry (transports, connections, sessions,
//! services) and the dispatcher. Nothing is global: two clients in one
//! process share no state.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tickrpc_core::{to_payload, Envelope, ProtocolKind, SequenceId, Value};
use tracing::{debug, info};

use crate::config::{ClientConfig, TransportSettings};
use crate::connection::{Connection, ConnectionKey, ConnectionRegistry};
use crate::dispatch::{DispatchStats, Dispatcher};
use crate::error::{RpcError, TransportError};
use crate::protocol::Protocol;
use crate::service::{ServiceHandler, ServiceRegistry};
use crate::session::{Reply, ReplyCallback, SessionTable};
use crate::transport::{HttpTransportFactory, TransportFactory, TransportRegistry};

// ---------------------------------------------------------------------------
// Channel
// ---------------------------------------------------------------------------

/// Call issuer bound to one connection.
///
/// Cheap to clone. Calls may be issued from any thread; replies are
/// delivered by whichever thread drives [`RpcClient::update`].
#[derive(Clone)]
pub struct Channel {
    connection: Arc<Connection>,
    sessions: Arc<SessionTable>,
    config: Arc<ClientConfig>,
}

impl Channel {
    /// The normalized address this channel sends to.
    #[must_use]
    pub fn address(&self) -> &ConnectionKey {
        self.connection.key()
    }

    /// Issues `service:method(args)` and registers `callback` for the reply.
    ///
    /// `timeout` of `None` uses the configured default; shorter budgets than
    /// the configured minimum are raised to it.
    ///
    /// # Errors
    ///
    /// Returns an error if `args` cannot be encoded or the request cannot be
    /// written and flushed. The session is withdrawn first: `callback` is
    /// never invoked for a call that returned an error.
    pub fn call<A: Serialize + ?Sized>(
        &self,
        service: &str,
        method: &str,
        args: &A,
        timeout: Option<Duration>,
        callback: ReplyCallback,
    ) -> Result<SequenceId, RpcError> {
        let args = to_payload(args)?;
        let timeout = self.config.call_timeout(timeout);

        let mut protocol = self.connection.lock();
        let sequence_id = self
            .sessions
            .register(callback, timeout, self.connection.key().clone());
        let envelope = Envelope::call(service, method, sequence_id);

        if let Err(err) = write_request(&mut protocol, &envelope, &args) {
            self.sessions.withdraw(sequence_id);
            debug!(%envelope, error = %err, "request not sent; session withdrawn");
            return Err(err);
        }
        debug!(%envelope, ?timeout, "call issued");
        Ok(sequence_id)
    }

    /// Like [`call`](Self::call), decoding the reply into `R` before handing
    /// it to `on_done`.
    ///
    /// # Errors
    ///
    /// Same as [`call`](Self::call).
    pub fn request<A, R, F>(
        &self,
        service: &str,
        method: &str,
        args: &A,
        timeout: Option<Duration>,
        on_done: F,
    ) -> Result<SequenceId, RpcError>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
        F: FnOnce(Result<R, RpcError>) + Send + 'static,
    {
        let callback: ReplyCallback =
            Box::new(move |result: Result<Reply, RpcError>| on_done(result.and_then(Reply::decode)));
        self.call(service, method, args, timeout, callback)
    }

    /// Sends `service:method(args)` expecting no reply.
    ///
    /// # Errors
    ///
    /// Returns an error if `args` cannot be encoded or the request cannot be
    /// written and flushed.
    pub fn oneway<A: Serialize + ?Sized>(
        &self,
        service: &str,
        method: &str,
        args: &A,
    ) -> Result<SequenceId, RpcError> {
        let args = to_payload(args)?;
        let mut protocol = self.connection.lock();
        let sequence_id = self.sessions.next_sequence_id();
        let envelope = Envelope::oneway(service, method, sequence_id);
        write_request(&mut protocol, &envelope, &args)?;
        debug!(%envelope, "oneway issued");
        Ok(sequence_id)
    }
}

fn write_request(
    protocol: &mut Protocol,
    envelope: &Envelope,
    args: &Value,
) -> Result<(), RpcError> {
    protocol.write_message_begin(envelope)?;
    protocol.write_value(args)?;
    protocol.write_message_end()?;
    protocol.flush()
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("address", self.address())
            .finish_non_exhaustive()
    }
}

/// A typed service stub built on a [`Channel`].
pub trait ServiceClient: Sized {
    fn from_channel(channel: Channel) -> Self;
}

// ---------------------------------------------------------------------------
// RpcClient
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct DefaultAddress {
    address: String,
    settings: TransportSettings,
    kind: ProtocolKind,
}

/// Owns the registries and drives dispatch.
pub struct RpcClient {
    config: Arc<ClientConfig>,
    transports: Arc<TransportRegistry>,
    connections: Arc<ConnectionRegistry>,
    sessions: Arc<SessionTable>,
    services: Arc<ServiceRegistry>,
    dispatcher: Dispatcher,
    default_address: RwLock<Option<DefaultAddress>>,
}

impl RpcClient {
    /// Creates a client with no transports registered.
    #[must_use]
    pub fn new(config: ClientConfig) -> Self {
        let transports = Arc::new(TransportRegistry::new());
        let connections = Arc::new(ConnectionRegistry::new(Arc::clone(&transports)));
        let sessions = Arc::new(SessionTable::new());
        let services = Arc::new(ServiceRegistry::new());
        let dispatcher = Dispatcher::new(
            Arc::clone(&connections),
            Arc::clone(&sessions),
            Arc::clone(&services),
            config.drain_chunk_size,
        );
        Self {
            config: Arc::new(config),
            transports,
            connections,
            sessions,
            services,
            dispatcher,
            default_address: RwLock::new(None),
        }
    }

    /// Creates a client with the HTTP transport registered for `http` and
    /// `https`, running exchanges on the current tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Runtime` when called outside a tokio runtime.
    pub fn with_http(config: ClientConfig) -> Result<Self, TransportError> {
        let client = Self::new(config);
        let http: Arc<dyn TransportFactory> = Arc::new(HttpTransportFactory::current()?);
        client.register_transport("http", Arc::clone(&http));
        client.register_transport("https", http);
        Ok(client)
    }

    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Registers the transport factory serving `scheme`.
    pub fn register_transport(&self, scheme: &str, factory: Arc<dyn TransportFactory>) {
        info!(scheme, "transport registered");
        self.transports.register(scheme, factory);
    }

    /// Sets the address used by [`get_client`](Self::get_client).
    ///
    /// The connection is created here, so a bad address is reported now
    /// rather than on the first [`get_client`](Self::get_client).
    ///
    /// # Errors
    ///
    /// Returns `RpcError::MissingScheme`, `RpcError::NoTransportFactory`, or
    /// `RpcError::Transport` if the connection cannot be created. The
    /// previous default, if any, is kept.
    pub fn set_default_address(
        &self,
        address: &str,
        settings: TransportSettings,
        kind: ProtocolKind,
    ) -> Result<(), RpcError> {
        self.connections.get_or_create(address, &settings, kind)?;
        *self.default_address.write() = Some(DefaultAddress {
            address: address.to_string(),
            settings,
            kind,
        });
        Ok(())
    }

    /// Builds a service stub bound to the default address.
    ///
    /// # Errors
    ///
    /// Returns `RpcError::NoDefaultAddress` if no default address is set,
    /// and the connection errors of [`get_client_at`](Self::get_client_at).
    pub fn get_client<T: ServiceClient>(&self) -> Result<T, RpcError> {
        let default = self
            .default_address
            .read()
            .clone()
            .ok_or(RpcError::NoDefaultAddress)?;
        self.get_client_at(&default.address, &default.settings, default.kind)
    }

    /// Builds a service stub bound to `address`.
    ///
    /// # Errors
    ///
    /// Returns `RpcError::MissingScheme`, `RpcError::NoTransportFactory`, or
    /// `RpcError::Transport` if the connection cannot be created.
    pub fn get_client_at<T: ServiceClient>(
        &self,
        address: &str,
        settings: &TransportSettings,
        kind: ProtocolKind,
    ) -> Result<T, RpcError> {
        Ok(T::from_channel(self.channel(address, settings, kind)?))
    }

    /// Returns a channel to `address`, creating the connection on first use.
    ///
    /// # Errors
    ///
    /// Same as [`get_client_at`](Self::get_client_at).
    pub fn channel(
        &self,
        address: &str,
        settings: &TransportSettings,
        kind: ProtocolKind,
    ) -> Result<Channel, RpcError> {
        let connection = self.connections.get_or_create(address, settings, kind)?;
        Ok(Channel {
            connection,
            sessions: Arc::clone(&self.sessions),
            config: Arc::clone(&self.config),
        })
    }

    /// Hosts `handler` for inbound calls on every connection.
    ///
    /// # Errors
    ///
    /// Returns `RpcError::DuplicateService` if the name is already taken.
    pub fn register_service(&self, handler: Arc<dyn ServiceHandler>) -> Result<(), RpcError> {
        self.services.register(handler)
    }

    /// Runs one dispatch tick now.
    ///
    /// # Errors
    ///
    /// See [`update_at`](Self::update_at).
    pub fn update(&self) -> Result<usize, RpcError> {
        self.update_at(Instant::now())
    }

    /// Runs one dispatch tick as of `now`: at most one message per
    /// connection, idle connections sweep their expired sessions.
    ///
    /// Returns the number of messages processed.
    ///
    /// # Errors
    ///
    /// Returns the first connection fault of the tick. Other connections are
    /// still stepped and the faulting connection's read buffer is drained.
    pub fn update_at(&self, now: Instant) -> Result<usize, RpcError> {
        self.dispatcher.tick(now)
    }

    #[must_use]
    pub fn stats(&self) -> &DispatchStats {
        self.dispatcher.stats()
    }

    /// Number of calls still waiting for a reply.
    #[must_use]
    pub fn pending_calls(&self) -> usize {
        self.sessions.len()
    }

    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }
}

impl Default for RpcClient {
    fn default() -> Self {
        Self::new(ClientConfig::default())
    }
}

impl fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcClient")
            .field("config", &self.config)
            .field("connections", &self.connections)
            .field("sessions", &self.sessions)
            .field("services", &self.services)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use parking_lot::Mutex;
    use tickrpc_core::MessageKind;

    use super::*;
    use crate::protocol::tests::frame;
    use crate::service::tests::echo_service;
    use crate::session::tests::{recorder, Outcomes};
    use crate::transport::tests::MemoryTransport;
    use crate::transport::Transport;

    const KIND: ProtocolKind = ProtocolKind::Binary;

    #[derive(Debug)]
    struct EchoClient(Channel);

    impl ServiceClient for EchoClient {
        fn from_channel(channel: Channel) -> Self {
            Self(channel)
        }
    }

    impl EchoClient {
        fn ping<F>(&self, text: &str, on_done: F) -> Result<SequenceId, RpcError>
        where
            F: FnOnce(Result<String, RpcError>) + Send + 'static,
        {
            self.0.request("Echo", "ping", text, None, on_done)
        }
    }

    /// Client whose `mem:` addresses all share `transport`.
    fn memory_client(transport: &MemoryTransport) -> RpcClient {
        let client = RpcClient::default();
        let shared = transport.clone();
        client.register_transport(
            "mem",
            Arc::new(
                move |_: &str, _: &TransportSettings| -> Result<Box<dyn Transport>, TransportError> {
                    Ok(Box::new(shared.clone()))
                },
            ),
        );
        client
    }

    fn last_request(transport: &MemoryTransport) -> (Envelope, Value) {
        let flushed = transport.flushed();
        let mut reader = flushed.last().unwrap().as_slice();
        let envelope = KIND.decode_envelope(&mut reader).unwrap();
        let value = KIND.decode_value(&mut reader).unwrap();
        (envelope, value)
    }

    #[test]
    fn get_client_requires_default_address() {
        let client = RpcClient::default();
        let err = client.get_client::<EchoClient>().unwrap_err();
        assert!(matches!(err, RpcError::NoDefaultAddress));
    }

    #[test]
    fn unsupported_protocol_name_is_a_usage_error() {
        let err: RpcError = "compact"
            .parse::<ProtocolKind>()
            .map_err(RpcError::from)
            .unwrap_err();
        assert!(matches!(err, RpcError::UnsupportedProtocol(_)));
    }

    #[test]
    fn address_errors_surface_from_get_client_at() {
        let client = memory_client(&MemoryTransport::default());
        let settings = TransportSettings::default();
        assert!(matches!(
            client.get_client_at::<EchoClient>("nowhere", &settings, KIND),
            Err(RpcError::MissingScheme { .. })
        ));
        assert!(matches!(
            client.get_client_at::<EchoClient>("ftp://host", &settings, KIND),
            Err(RpcError::NoTransportFactory { .. })
        ));
    }

    #[test]
    fn default_address_without_transport_is_rejected_and_not_stored() {
        let client = memory_client(&MemoryTransport::default());
        assert!(matches!(
            client.set_default_address("ftp://x", TransportSettings::default(), KIND),
            Err(RpcError::NoTransportFactory { .. })
        ));
        assert_eq!(client.connection_count(), 0);
        assert!(matches!(
            client.get_client::<EchoClient>(),
            Err(RpcError::NoDefaultAddress)
        ));

        client
            .set_default_address("mem:peer", TransportSettings::default(), KIND)
            .unwrap();
        assert_eq!(client.connection_count(), 1);
        assert!(client.set_default_address("nowhere", TransportSettings::default(), KIND).is_err());
        assert!(client.get_client::<EchoClient>().is_ok());
    }

    #[test]
    fn addresses_differing_in_case_share_a_connection() {
        let client = memory_client(&MemoryTransport::default());
        let settings = TransportSettings::default();
        let a = client.get_client_at::<EchoClient>("mem://Peer", &settings, KIND).unwrap();
        let b = client.get_client_at::<EchoClient>("MEM://peer", &settings, KIND).unwrap();
        assert_eq!(a.0.address(), b.0.address());
        assert_eq!(client.connection_count(), 1);
    }

    #[test]
    fn default_address_round_trip() {
        let transport = MemoryTransport::default();
        let client = memory_client(&transport);
        client
            .set_default_address("mem:peer", TransportSettings::default(), KIND)
            .unwrap();
        let echo = client.get_client::<EchoClient>().unwrap();

        let result = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&result);
        let id = echo
            .ping("hello", move |r| *sink.lock() = Some(r))
            .unwrap();
        assert_eq!(client.pending_calls(), 1);

        let (envelope, args) = last_request(&transport);
        assert_eq!(envelope, Envelope::call("Echo", "ping", id));
        assert_eq!(args, Value::from("hello"));

        transport.push_inbound(&frame(KIND, &envelope.reply(), &Value::from("hello")));
        assert_eq!(client.update().unwrap(), 1);
        assert_eq!(client.pending_calls(), 0);
        assert_eq!(result.lock().take().unwrap().unwrap(), "hello");
    }

    #[test]
    fn failed_send_withdraws_the_session() {
        let mut transport = MemoryTransport::default();
        let client = memory_client(&transport);
        let channel = client
            .channel("mem:peer", &TransportSettings::default(), KIND)
            .unwrap();
        transport.close();

        let outcomes = Outcomes::default();
        let err = channel
            .call("Echo", "ping", &1, None, recorder(&outcomes, "a"))
            .unwrap_err();
        assert!(matches!(err, RpcError::Transport(TransportError::Closed)));
        assert_eq!(client.pending_calls(), 0);

        client
            .update_at(Instant::now() + Duration::from_secs(60))
            .unwrap();
        assert!(outcomes.lock().is_empty());
    }

    #[test]
    fn call_timeouts_are_normalized() {
        let client = memory_client(&MemoryTransport::default());
        let channel = client
            .channel("mem:peer", &TransportSettings::default(), KIND)
            .unwrap();
        let outcomes = Outcomes::default();
        let start = Instant::now();
        channel
            .call("Echo", "ping", &(), Some(Duration::ZERO), recorder(&outcomes, "zero"))
            .unwrap();
        channel
            .call("Echo", "ping", &(), None, recorder(&outcomes, "default"))
            .unwrap();

        client.update_at(start + Duration::from_millis(500)).unwrap();
        assert!(outcomes.lock().is_empty());

        client.update_at(start + Duration::from_millis(1_500)).unwrap();
        assert_eq!(outcomes.lock().len(), 1);
        assert_eq!(outcomes.lock()[0].0, "zero");

        client.update_at(start + Duration::from_millis(5_500)).unwrap();
        assert_eq!(outcomes.lock().len(), 2);
        assert!(outcomes
            .lock()
            .iter()
            .all(|(_, r)| matches!(r, Err(RpcError::Timeout { .. }))));
    }

    #[test]
    fn oneway_registers_nothing() {
        let transport = MemoryTransport::default();
        let client = memory_client(&transport);
        let channel = client
            .channel("mem:peer", &TransportSettings::default(), KIND)
            .unwrap();
        let first = channel.oneway("Log", "write", "line").unwrap();
        let second = channel.oneway("Log", "write", "line").unwrap();

        assert_eq!(second, first + 1);
        assert_eq!(client.pending_calls(), 0);
        let (envelope, _) = last_request(&transport);
        assert_eq!(envelope.kind, MessageKind::Oneway);
        assert_eq!(envelope.name, "Log:write");
    }

    #[test]
    fn hosted_service_answers_inbound_calls() {
        let transport = MemoryTransport::default();
        let client = memory_client(&transport);
        client.register_service(Arc::new(echo_service())).unwrap();
        assert!(matches!(
            client.register_service(Arc::new(echo_service())),
            Err(RpcError::DuplicateService { .. })
        ));
        client
            .channel("mem:peer", &TransportSettings::default(), KIND)
            .unwrap();

        transport.push_inbound(&frame(KIND, &Envelope::call("Echo", "ping", 3), &Value::from(8)));
        assert_eq!(client.update().unwrap(), 1);
        let (envelope, value) = last_request(&transport);
        assert_eq!(envelope, Envelope::new("ping", MessageKind::Reply, 3));
        assert_eq!(value, Value::from(8));
    }

    // -- end to end over HTTP -----------------------------------------------

    async fn echo_handler(body: axum::body::Bytes) -> Vec<u8> {
        let mut reader = body.as_ref();
        let call = KIND.decode_envelope(&mut reader).unwrap();
        let args = KIND.decode_value(&mut reader).unwrap();
        frame(KIND, &call.reply(), &args)
    }

    async fn spawn_echo_server() -> SocketAddr {
        let app = axum::Router::new().route("/rpc", axum::routing::post(echo_handler));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn call_over_http_completes_through_update() {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let addr = spawn_echo_server().await;
        let client = RpcClient::with_http(ClientConfig::default()).unwrap();
        client
            .set_default_address(&format!("http://{addr}/rpc"), TransportSettings::default(), KIND)
            .unwrap();
        let echo = client.get_client::<EchoClient>().unwrap();

        let result = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&result);
        echo.ping("over the wire", move |r| *sink.lock() = Some(r))
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while result.lock().is_none() && Instant::now() < deadline {
            client.update().unwrap();
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let reply = result.lock().take().expect("no reply before deadline");
        assert_eq!(reply.unwrap(), "over the wire");
        assert_eq!(client.stats().processed(), 1);
        assert_eq!(client.pending_calls(), 0);
    }
}
