//! HTTP transport: one POST exchange per flushed call.
//!
//! Writes for one logical call accumulate in a growable buffer until
//! `flush`, which submits them as one exchange and appends it to the pending
//! list. Polling adopts the first completed exchange it finds as the read
//! buffer, so replies surface in completion order rather than submission
//! order.
//!
//! The network primitive sits behind [`ExchangeClient`]. The production
//! implementation, [`ReqwestExchange`], spawns each POST on a tokio runtime
//! and reports back through a oneshot channel, which keeps every transport
//! operation non-blocking.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use reqwest::header::CONTENT_TYPE;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::sync::oneshot::error::TryRecvError;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

use super::{Transport, TransportFactory};
use crate::config::TransportSettings;
use crate::error::TransportError;

const FALLBACK_CONTENT_TYPE: &str = "application/octet-stream";

/// Outcome of one exchange: the response body or the reason it failed.
pub type ExchangeResult = Result<Bytes, TransportError>;

// ---------------------------------------------------------------------------
// PendingExchange / ExchangeCompleter
// ---------------------------------------------------------------------------

/// Receiving half of an in-flight exchange, polled without blocking.
#[derive(Debug)]
pub struct PendingExchange {
    rx: oneshot::Receiver<ExchangeResult>,
    abort: Option<AbortHandle>,
}

/// Sending half of an in-flight exchange, held by whatever performs it.
#[derive(Debug)]
pub struct ExchangeCompleter {
    tx: oneshot::Sender<ExchangeResult>,
}

enum ExchangeState {
    InFlight,
    Done(Bytes),
    Failed(TransportError),
}

impl PendingExchange {
    /// Creates a linked completer/pending pair.
    #[must_use]
    pub fn channel() -> (ExchangeCompleter, PendingExchange) {
        let (tx, rx) = oneshot::channel();
        (ExchangeCompleter { tx }, PendingExchange { rx, abort: None })
    }

    /// Attaches the handle of the task performing the exchange so `close`
    /// can cancel it.
    #[must_use]
    pub fn with_abort_handle(mut self, abort: AbortHandle) -> Self {
        self.abort = Some(abort);
        self
    }

    fn poll(&mut self) -> ExchangeState {
        match self.rx.try_recv() {
            Ok(Ok(body)) => ExchangeState::Done(body),
            Ok(Err(err)) => ExchangeState::Failed(err),
            Err(TryRecvError::Empty) => ExchangeState::InFlight,
            Err(TryRecvError::Closed) => ExchangeState::Failed(TransportError::Exchange(
                "exchange abandoned before completion".to_string(),
            )),
        }
    }

    fn abort(&self) {
        if let Some(abort) = &self.abort {
            abort.abort();
        }
    }
}

impl ExchangeCompleter {
    /// Completes the exchange with a response body.
    pub fn complete(self, body: impl Into<Bytes>) {
        self.finish(Ok(body.into()));
    }

    /// Completes the exchange with a failure.
    pub fn fail(self, err: TransportError) {
        self.finish(Err(err));
    }

    /// Completes the exchange with `result`. A dropped receiver is ignored.
    pub fn finish(self, result: ExchangeResult) {
        let _ = self.tx.send(result);
    }
}

// ---------------------------------------------------------------------------
// ExchangeClient
// ---------------------------------------------------------------------------

/// Performs one request/response exchange per submitted body.
pub trait ExchangeClient: Send + Sync {
    /// Starts an exchange and returns immediately.
    ///
    /// # Errors
    ///
    /// Returns an error if the exchange cannot be started at all.
    fn submit(&self, body: Bytes) -> Result<PendingExchange, TransportError>;
}

/// `reqwest`-backed exchanges, each an HTTP `POST` to a fixed URL.
#[derive(Debug, Clone)]
pub struct ReqwestExchange {
    client: reqwest::Client,
    url: String,
    content_type: String,
    headers: Vec<(String, String)>,
    timeout: Option<Duration>,
    runtime: Handle,
}

impl ReqwestExchange {
    /// Creates an exchange client for `url`, spawning requests on `runtime`.
    #[must_use]
    pub fn new(
        client: reqwest::Client,
        url: &str,
        settings: &TransportSettings,
        runtime: Handle,
    ) -> Self {
        Self {
            client,
            url: url.to_string(),
            content_type: settings
                .content_type
                .clone()
                .unwrap_or_else(|| FALLBACK_CONTENT_TYPE.to_string()),
            headers: settings.headers.clone(),
            timeout: settings.request_timeout_ms.map(Duration::from_millis),
            runtime,
        }
    }
}

impl ExchangeClient for ReqwestExchange {
    fn submit(&self, body: Bytes) -> Result<PendingExchange, TransportError> {
        let mut request = self
            .client
            .post(&self.url)
            .header(CONTENT_TYPE, self.content_type.as_str())
            .body(body);
        for (name, value) in &self.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some(timeout) = self.timeout {
            request = request.timeout(timeout);
        }

        let (completer, pending) = PendingExchange::channel();
        let task = self.runtime.spawn(async move {
            let result = match request
                .send()
                .await
                .and_then(reqwest::Response::error_for_status)
            {
                Ok(response) => response
                    .bytes()
                    .await
                    .map_err(|e| TransportError::Exchange(e.to_string())),
                Err(e) => Err(TransportError::Exchange(e.to_string())),
            };
            completer.finish(result);
        });
        Ok(pending.with_abort_handle(task.abort_handle()))
    }
}

// ---------------------------------------------------------------------------
// Buffers
// ---------------------------------------------------------------------------

/// Outbound buffer for one call.
///
/// The first write allocates `max(min_capacity, 2 * len)`; a write that does
/// not fit grows the buffer to `2 * (buffered + len)`.
#[derive(Debug)]
struct WriteBuffer {
    buf: Vec<u8>,
    min_capacity: usize,
}

impl WriteBuffer {
    fn new(min_capacity: usize) -> Self {
        Self {
            buf: Vec::new(),
            min_capacity,
        }
    }

    fn write(&mut self, bytes: &[u8]) {
        let needed = self.buf.len() + bytes.len();
        if self.buf.capacity() == 0 {
            self.buf = Vec::with_capacity(self.min_capacity.max(bytes.len() * 2));
        } else if self.buf.capacity() < needed {
            self.buf.reserve_exact(needed * 2 - self.buf.len());
        }
        self.buf.extend_from_slice(bytes);
    }

    fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    fn take(&mut self) -> Bytes {
        Bytes::from(std::mem::take(&mut self.buf))
    }

    fn clear(&mut self) {
        self.buf = Vec::new();
    }
}

/// Inbound buffer adopted from one completed exchange.
#[derive(Debug)]
struct ReadBuffer {
    data: Bytes,
    pos: usize,
}

impl ReadBuffer {
    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }
}

// ---------------------------------------------------------------------------
// HttpTransport
// ---------------------------------------------------------------------------

/// Transport mapping each flushed call onto one HTTP exchange.
pub struct HttpTransport {
    exchange: Arc<dyn ExchangeClient>,
    write_buf: WriteBuffer,
    read_buf: Option<ReadBuffer>,
    pending: Vec<PendingExchange>,
    open: bool,
    dropped: u64,
}

impl HttpTransport {
    /// Creates a transport submitting through `exchange`.
    #[must_use]
    pub fn new(exchange: Arc<dyn ExchangeClient>, min_write_capacity: usize) -> Self {
        Self {
            exchange,
            write_buf: WriteBuffer::new(min_write_capacity),
            read_buf: None,
            pending: Vec::new(),
            open: true,
            dropped: 0,
        }
    }

    /// Number of exchanges submitted and not yet adopted or dropped.
    #[must_use]
    pub fn pending_exchanges(&self) -> usize {
        self.pending.len()
    }

    /// Capacity currently reserved by the outbound buffer.
    #[must_use]
    pub fn write_capacity(&self) -> usize {
        self.write_buf.buf.capacity()
    }

    /// Adopts the first completed exchange as the read buffer, dropping
    /// failed and empty exchanges on the way. Stops at the first adoption so
    /// other completed exchanges keep their results for later polls.
    fn adopt_completed(&mut self) {
        let mut i = 0;
        while i < self.pending.len() && self.read_buf.is_none() {
            match self.pending[i].poll() {
                ExchangeState::InFlight => i += 1,
                ExchangeState::Done(body) => {
                    self.pending.remove(i);
                    if body.is_empty() {
                        debug!("dropping completed exchange with empty body");
                    } else {
                        self.read_buf = Some(ReadBuffer { data: body, pos: 0 });
                    }
                }
                ExchangeState::Failed(err) => {
                    self.pending.remove(i);
                    self.dropped += 1;
                    warn!(
                        error = %err,
                        dropped_total = self.dropped,
                        "dropping failed exchange; its caller will only learn of it by timeout"
                    );
                }
            }
        }
    }
}

impl Transport for HttpTransport {
    fn open(&mut self) -> Result<(), TransportError> {
        self.open = true;
        Ok(())
    }

    fn close(&mut self) {
        for exchange in self.pending.drain(..) {
            exchange.abort();
        }
        self.write_buf.clear();
        self.read_buf = None;
        self.open = false;
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn has_data(&mut self) -> bool {
        if self.read_buf.as_ref().is_some_and(|rb| rb.remaining() == 0) {
            self.read_buf = None;
        }
        if self.read_buf.is_none() {
            self.adopt_completed();
        }
        self.read_buf.as_ref().is_some_and(|rb| rb.remaining() > 0)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        let Some(rb) = self.read_buf.as_mut() else {
            return Ok(0);
        };
        let n = buf.len().min(rb.remaining());
        buf[..n].copy_from_slice(&rb.data[rb.pos..rb.pos + n]);
        rb.pos += n;
        if rb.remaining() == 0 {
            self.read_buf = None;
        }
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> Result<(), TransportError> {
        if !self.open {
            return Err(TransportError::Closed);
        }
        self.write_buf.write(buf);
        Ok(())
    }

    fn flush(&mut self) -> Result<(), TransportError> {
        if !self.open {
            return Err(TransportError::Closed);
        }
        if self.write_buf.is_empty() {
            return Ok(());
        }
        let body = self.write_buf.take();
        let pending = self.exchange.submit(body)?;
        self.pending.push(pending);
        Ok(())
    }

    fn dropped_exchanges(&self) -> u64 {
        self.dropped
    }
}

// ---------------------------------------------------------------------------
// HttpTransportFactory
// ---------------------------------------------------------------------------

/// Factory for the `http` and `https` schemes.
///
/// Shares one `reqwest::Client` (and its connection pool) across every
/// transport it creates.
#[derive(Debug, Clone)]
pub struct HttpTransportFactory {
    client: reqwest::Client,
    runtime: Handle,
}

impl HttpTransportFactory {
    /// Creates a factory spawning exchanges on `runtime`.
    #[must_use]
    pub fn new(runtime: Handle) -> Self {
        Self {
            client: reqwest::Client::new(),
            runtime,
        }
    }

    /// Creates a factory bound to the tokio runtime of the calling context.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Runtime` when called outside a tokio runtime.
    pub fn current() -> Result<Self, TransportError> {
        let runtime = Handle::try_current().map_err(|e| TransportError::Runtime(e.to_string()))?;
        Ok(Self::new(runtime))
    }
}

impl TransportFactory for HttpTransportFactory {
    fn create(
        &self,
        address: &str,
        settings: &TransportSettings,
    ) -> Result<Box<dyn Transport>, TransportError> {
        let exchange = ReqwestExchange::new(self.client.clone(), address, settings, self.runtime.clone());
        Ok(Box::new(HttpTransport::new(
            Arc::new(exchange),
            settings.min_write_capacity,
        )))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
