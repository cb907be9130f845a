//! Transport contract.
//!
//! A `Transport` owns exactly one channel to one server. It knows how to
//! open and close that channel and how to exchange correlated requests and
//! one-way notifications over it. It knows nothing about the MCP handshake,
//! reconnection, or other servers.
//!
//! Server-initiated traffic and the final disposition of the channel are
//! reported through an [`EventSink`] supplied at construction time.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::config::{ConnectionSettings, ServerConfig, TransportKind};
use super::errors::McpError;
use super::framing::InboundMessage;
use super::stdio::StdioTransport;
use super::types::JsonRpcNotification;

// ─── Transport Trait ─────────────────────────────────────────────────────────

#[async_trait]
pub trait Transport: Send + Sync {
    /// Id of the server this transport talks to.
    fn server_id(&self) -> &str;

    /// Open the channel. Fails with `AlreadyConnected` when already open.
    async fn connect(&self) -> Result<(), McpError>;

    /// Close the channel. Idempotent; fails every pending request with
    /// `TransportClosed` and releases the underlying resources on every path.
    async fn disconnect(&self) -> Result<(), McpError>;

    /// Send a correlated request and wait for its result.
    async fn send_request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, McpError>;

    /// Send a one-way notification.
    async fn send(&self, notification: JsonRpcNotification) -> Result<(), McpError>;

    fn is_connected(&self) -> bool;
}

// ─── Events ──────────────────────────────────────────────────────────────────

/// Something the transport reports without being asked.
#[derive(Debug)]
pub enum TransportEvent {
    /// A server-initiated notification or request.
    Message(InboundMessage),
    /// The channel is gone. `Some` carries the error that ended it; `None`
    /// means an orderly close.
    Closed(Option<McpError>),
}

/// Delivers transport events to the owning connection.
///
/// `Closed` is delivered at most once per connection lifetime; later calls
/// are swallowed until `rearm` is called for the next lifetime.
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<TransportEvent>,
    closed: Arc<AtomicBool>,
}

impl EventSink {
    pub fn new(tx: mpsc::UnboundedSender<TransportEvent>) -> Self {
        Self {
            tx,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Create a sink together with its receiving end.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    /// Forward a server-initiated message.
    pub fn message(&self, message: InboundMessage) {
        let _ = self.tx.send(TransportEvent::Message(message));
    }

    /// Report the final disposition. Returns `false` if one was already
    /// reported for this lifetime.
    pub fn closed(&self, error: Option<McpError>) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        let _ = self.tx.send(TransportEvent::Closed(error));
        true
    }

    /// Start a new connection lifetime.
    pub fn rearm(&self) {
        self.closed.store(false, Ordering::SeqCst);
    }
}

// ─── Factory ─────────────────────────────────────────────────────────────────

/// Builds a fresh transport for each connection attempt.
pub trait TransportFactory: Send + Sync {
    fn create(
        &self,
        config: &ServerConfig,
        settings: &ConnectionSettings,
        events: EventSink,
    ) -> Result<Arc<dyn Transport>, McpError>;
}

/// Process transport for `stdio`; socket kinds need a host-supplied factory.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultTransportFactory;

impl TransportFactory for DefaultTransportFactory {
    fn create(
        &self,
        config: &ServerConfig,
        settings: &ConnectionSettings,
        events: EventSink,
    ) -> Result<Arc<dyn Transport>, McpError> {
        match config.transport {
            TransportKind::Stdio => Ok(Arc::new(StdioTransport::new(
                config.clone(),
                settings.clone(),
                events,
            ))),
            kind => Err(McpError::UnsupportedTransport {
                server: config.id.clone(),
                kind: kind.as_str().to_string(),
            }),
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
