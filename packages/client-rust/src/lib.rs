//! `tickrpc` Client: multiplexes asynchronous calls over polled transports.
//!
//! An [`RpcClient`] issues calls through [`Channel`]s, tracks each in a
//! [`SessionTable`], and delivers replies when the embedding application
//! drives [`RpcClient::update`]. Locally hosted [`ServiceHandler`]s answer
//! inbound calls on the same connections.

pub mod client;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod protocol;
pub mod service;
pub mod session;
pub mod transport;

pub use client::{Channel, RpcClient, ServiceClient};
pub use config::{ClientConfig, TransportSettings};
pub use connection::{Connection, ConnectionKey, ConnectionRegistry};
pub use dispatch::{DispatchStats, Dispatcher};
pub use error::{RpcError, TransportError};
pub use protocol::Protocol;
pub use service::{MethodRouter, ServiceHandler, ServiceRegistry};
pub use session::{Reply, ReplyCallback, Session, SessionTable};
pub use transport::{
    ExchangeClient, ExchangeCompleter, HttpTransport, HttpTransportFactory, PendingExchange,
    ReqwestExchange, Transport, TransportFactory, TransportRegistry,
};

pub use tickrpc_core::{
    ApplicationException, ApplicationExceptionKind, Envelope, MessageKind, ProtocolKind,
    SequenceId, Value,
};
