//! Per-server connection state machine.
//!
//! A `ServerConnection` wraps at most one open transport, performs the MCP
//! handshake, tracks the server's tool list, and owns the reconnection
//! policy:
//!
//! ```text
//! disconnected --connect()--> connecting --handshake ok--> connected
//! connecting --failure--> error
//! connected --channel lost--> reconnecting | error
//! reconnecting --success--> connected
//! reconnecting --attempts exhausted--> error
//! any --disconnect()--> disconnected
//! ```
//!
//! Every session is tagged with a generation number. `disconnect()` bumps it,
//! which turns any in-flight handshake, reconnect attempt, or transport event
//! from the old session into a no-op.

use std::sync::{Arc, Weak};

use chrono::Utc;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;

use super::config::{ConnectionSettings, ServerConfig};
use super::errors::McpError;
use super::framing::InboundMessage;
use super::transport::{EventSink, Transport, TransportEvent, TransportFactory};
use super::types::{
    error_codes, methods, ConnectionState, InitializeParams, InitializeResult,
    JsonRpcNotification, ServerInfo, ServerStatus, ToolDescriptor, ToolsListResult,
};

/// Called with a fresh snapshot after every state transition or tool refresh.
pub type StatusCallback = Arc<dyn Fn(&ServerStatus) + Send + Sync>;

// ─── Internal State ──────────────────────────────────────────────────────────

struct State {
    config: ServerConfig,
    settings: ConnectionSettings,
    state: ConnectionState,
    last_error: Option<String>,
    tools: Vec<ToolDescriptor>,
    server_info: Option<ServerInfo>,
    last_ok: Option<chrono::DateTime<Utc>>,
    attempts: u32,
    generation: u64,
    reconnect_task: Option<JoinHandle<()>>,
}

struct Inner {
    id: String,
    factory: Arc<dyn TransportFactory>,
    state: std::sync::Mutex<State>,
    /// The open transport, tagged with the generation that created it.
    transport: tokio::sync::Mutex<Option<(u64, Arc<dyn Transport>)>>,
    /// Held for the duration of one connect or reconnect attempt.
    connect_lock: tokio::sync::Mutex<()>,
    on_change: Option<StatusCallback>,
}

// ─── ServerConnection ────────────────────────────────────────────────────────

/// Connection to one server. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct ServerConnection {
    inner: Arc<Inner>,
}

impl ServerConnection {
    pub fn new(
        config: ServerConfig,
        settings: ConnectionSettings,
        factory: Arc<dyn TransportFactory>,
        on_change: Option<StatusCallback>,
    ) -> Self {
        let state = State {
            config: config.clone(),
            settings,
            state: ConnectionState::Disconnected,
            last_error: None,
            tools: Vec::new(),
            server_info: None,
            last_ok: None,
            attempts: 0,
            generation: 0,
            reconnect_task: None,
        };
        Self {
            inner: Arc::new(Inner {
                id: config.id,
                factory,
                state: std::sync::Mutex::new(state),
                transport: tokio::sync::Mutex::new(None),
                connect_lock: tokio::sync::Mutex::new(()),
                on_change,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn config(&self) -> ServerConfig {
        self.lock().config.clone()
    }

    pub fn settings(&self) -> ConnectionSettings {
        self.lock().settings.clone()
    }

    /// Replace the effective settings. Takes effect on the next attempt.
    pub fn apply_settings(&self, settings: ConnectionSettings) {
        self.lock().settings = settings;
    }

    pub fn state(&self) -> ConnectionState {
        self.lock().state
    }

    pub fn tools(&self) -> Vec<ToolDescriptor> {
        self.lock().tools.clone()
    }

    pub fn status(&self) -> ServerStatus {
        let st = self.lock();
        ServerStatus {
            id: self.inner.id.clone(),
            name: st.config.display_name().to_string(),
            enabled: st.config.enabled,
            state: st.state,
            last_error: st.last_error.clone(),
            tools: st.tools.clone(),
            last_ok: st.last_ok,
            reconnect_attempts: st.attempts,
            server_info: st.server_info.clone(),
        }
    }

    // ─── Lifecycle ───────────────────────────────────────────────────────

    /// Open a session: launch the transport and run the handshake.
    ///
    /// Returns immediately if already connected. Fails fast with
    /// `ConnectInProgress` if another attempt is running.
    pub async fn connect(&self) -> Result<(), McpError> {
        let _attempt = self
            .inner
            .connect_lock
            .try_lock()
            .map_err(|_| McpError::ConnectInProgress {
                server: self.inner.id.clone(),
            })?;

        let (generation, pending_reconnect) = {
            let mut st = self.lock();
            if st.state == ConnectionState::Connected {
                return Ok(());
            }
            st.generation += 1;
            st.state = ConnectionState::Connecting;
            st.last_error = None;
            st.attempts = 0;
            (st.generation, st.reconnect_task.take())
        };
        if let Some(task) = pending_reconnect {
            task.abort();
        }
        tracing::info!(server = %self.inner.id, "connecting");
        self.notify();

        match self.establish(generation).await {
            Ok(()) => Ok(()),
            Err(e) => {
                let current = {
                    let mut st = self.lock();
                    let current = st.generation == generation;
                    if current {
                        st.state = ConnectionState::Error;
                        st.last_error = Some(e.to_string());
                        st.tools.clear();
                    }
                    current
                };
                if current {
                    tracing::warn!(server = %self.inner.id, error = %e, "connection failed");
                    self.notify();
                }
                Err(e)
            }
        }
    }

    /// End the session. Always succeeds and always wins over an in-flight
    /// connect or reconnect.
    pub async fn disconnect(&self) -> Result<(), McpError> {
        let (changed, pending_reconnect) = {
            let mut st = self.lock();
            st.generation += 1;
            let changed = st.state != ConnectionState::Disconnected;
            st.state = ConnectionState::Disconnected;
            st.last_error = None;
            st.tools.clear();
            st.attempts = 0;
            (changed, st.reconnect_task.take())
        };

        if let Some(task) = pending_reconnect {
            task.abort();
        }

        let transport = self.inner.transport.lock().await.take();
        if let Some((_, transport)) = transport {
            if let Err(e) = transport.disconnect().await {
                tracing::warn!(server = %self.inner.id, error = %e, "transport disconnect failed");
            }
        }

        if changed {
            tracing::info!(server = %self.inner.id, "disconnected");
            self.notify();
        }
        Ok(())
    }

    // ─── Requests ────────────────────────────────────────────────────────

    /// Issue a correlated call on the open session.
    pub async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, McpError> {
        let transport = self.active_transport().await?;
        transport.send_request(method, params).await
    }

    /// Liveness check. Updates the last-ok time on success.
    pub async fn ping(&self) -> Result<(), McpError> {
        let transport = self.active_transport().await?;
        transport.send_request(methods::PING, None).await?;
        self.lock().last_ok = Some(Utc::now());
        Ok(())
    }

    /// Re-fetch the tool list from the open session.
    pub async fn refresh_tools(&self) -> Result<Vec<ToolDescriptor>, McpError> {
        let generation = self.lock().generation;
        let transport = self.active_transport().await?;
        let tools = list_tools(transport.as_ref()).await?;

        let applied = {
            let mut st = self.lock();
            let applied = st.generation == generation && st.state == ConnectionState::Connected;
            if applied {
                st.tools = tools.clone();
                st.last_ok = Some(Utc::now());
            }
            applied
        };
        if applied {
            tracing::info!(server = %self.inner.id, tools = tools.len(), "tool list refreshed");
            self.notify();
        }
        Ok(tools)
    }

    // ─── Internals ───────────────────────────────────────────────────────

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_current(&self, generation: u64) -> bool {
        self.lock().generation == generation
    }

    fn notify(&self) {
        if let Some(callback) = &self.inner.on_change {
            let status = self.status();
            callback(&status);
        }
    }

    fn cancelled(&self) -> McpError {
        McpError::ConnectionFailed {
            server: self.inner.id.clone(),
            reason: "connection attempt cancelled by disconnect".into(),
        }
    }

    async fn active_transport(&self) -> Result<Arc<dyn Transport>, McpError> {
        let not_connected = || McpError::NotConnected {
            server: self.inner.id.clone(),
        };
        if self.state() != ConnectionState::Connected {
            return Err(not_connected());
        }
        self.inner
            .transport
            .lock()
            .await
            .as_ref()
            .map(|(_, t)| t.clone())
            .ok_or_else(not_connected)
    }

    /// Create a transport, connect it, and handshake. On success the state
    /// becomes `Connected`; on failure the transport is released and the
    /// caller decides the next state.
    async fn establish(&self, generation: u64) -> Result<(), McpError> {
        let (config, settings) = {
            let st = self.lock();
            (st.config.clone(), st.settings.clone())
        };

        let (sink, events) = EventSink::channel();
        let transport = self.inner.factory.create(&config, &settings, sink)?;

        let previous = {
            let mut slot = self.inner.transport.lock().await;
            if !self.is_current(generation) {
                return Err(self.cancelled());
            }
            slot.replace((generation, transport.clone()))
        };
        if let Some((_, old)) = previous {
            let _ = old.disconnect().await;
        }
        self.spawn_event_pump(generation, events);

        // One budget covers launch and handshake together.
        let budget = settings.connect_timeout;
        let attempt = async {
            transport.connect().await?;
            handshake(transport.as_ref()).await
        };
        let outcome = match tokio::time::timeout(budget, attempt).await {
            Ok(result) => result,
            Err(_) => Err(McpError::ConnectionTimeout {
                server: self.inner.id.clone(),
                timeout_ms: budget.as_millis() as u64,
            }),
        };

        let (server_info, tools) = match outcome {
            Ok(found) => found,
            Err(e) => {
                self.release_transport(generation).await;
                return Err(e);
            }
        };

        let applied = {
            let mut st = self.lock();
            // The transport may have died between the handshake and here;
            // its close event is ignored while we are not yet connected.
            let applied = st.generation == generation && transport.is_connected();
            if applied {
                st.state = ConnectionState::Connected;
                st.tools = tools;
                st.server_info = server_info;
                st.last_ok = Some(Utc::now());
                st.last_error = None;
                st.attempts = 0;
            }
            applied
        };

        if !applied {
            let lost = self.is_current(generation);
            self.release_transport(generation).await;
            return Err(if lost {
                McpError::TransportClosed {
                    server: self.inner.id.clone(),
                }
            } else {
                self.cancelled()
            });
        }

        tracing::info!(
            server = %self.inner.id,
            tools = self.lock().tools.len(),
            "connected"
        );
        self.notify();
        Ok(())
    }

    /// Disconnect and drop the transport if it still belongs to `generation`.
    async fn release_transport(&self, generation: u64) {
        let taken = {
            let mut slot = self.inner.transport.lock().await;
            match slot.as_ref() {
                Some((owner, _)) if *owner == generation => slot.take(),
                _ => None,
            }
        };
        if let Some((_, transport)) = taken {
            let _ = transport.disconnect().await;
        }
    }

    fn spawn_event_pump(&self, generation: u64, mut events: UnboundedReceiver<TransportEvent>) {
        // Weak so an abandoned connection does not keep itself alive
        // through its own transport's event channel.
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(inner) = weak.upgrade() else { break };
                let conn = ServerConnection { inner };
                if !conn.is_current(generation) {
                    break;
                }
                match event {
                    TransportEvent::Message(message) => conn.handle_message(message).await,
                    TransportEvent::Closed(error) => {
                        conn.handle_closed(generation, error).await;
                        break;
                    }
                }
            }
        });
    }

    async fn handle_message(&self, message: InboundMessage) {
        match message.method.as_str() {
            methods::TOOLS_LIST_CHANGED => {
                if let Err(e) = self.refresh_tools().await {
                    tracing::warn!(server = %self.inner.id, error = %e, "tool list refresh failed");
                }
            }
            method if message.is_notification() => {
                tracing::debug!(server = %self.inner.id, method, "ignoring notification");
            }
            method => {
                tracing::debug!(server = %self.inner.id, method, "ignoring server request");
            }
        }
    }

    /// The channel of an established session is gone.
    async fn handle_closed(&self, generation: u64, error: Option<McpError>) {
        let reconnect = {
            let mut st = self.lock();
            if st.generation != generation || st.state != ConnectionState::Connected {
                return;
            }
            let message = error
                .as_ref()
                .map(|e| e.to_string())
                .unwrap_or_else(|| format!("server '{}' closed the connection", self.inner.id));
            st.last_error = Some(message);
            st.tools.clear();
            st.attempts = 0;
            if st.settings.reconnect.should_reconnect() {
                st.state = ConnectionState::Reconnecting;
                true
            } else {
                st.state = ConnectionState::Error;
                false
            }
        };

        tracing::warn!(
            server = %self.inner.id,
            error = ?error.as_ref().map(|e| e.to_string()),
            reconnect,
            "connection lost"
        );
        self.release_transport(generation).await;
        self.notify();

        if reconnect {
            self.schedule_reconnect(generation);
        }
    }

    fn schedule_reconnect(&self, generation: u64) {
        let task = tokio::spawn(reconnect_loop(Arc::downgrade(&self.inner), generation));
        let mut st = self.lock();
        if st.generation == generation && st.state == ConnectionState::Reconnecting {
            st.reconnect_task = Some(task);
        } else {
            task.abort();
        }
    }
}

// ─── Reconnection ────────────────────────────────────────────────────────────

/// Retry until connected, exhausted, or superseded by a newer generation.
async fn reconnect_loop(weak: Weak<Inner>, generation: u64) {
    loop {
        let delay = match weak.upgrade() {
            Some(inner) => ServerConnection { inner }.settings().reconnect.delay,
            None => return,
        };
        tokio::time::sleep(delay).await;

        let Some(inner) = weak.upgrade() else { return };
        let conn = ServerConnection { inner };
        let _attempt = conn.inner.connect_lock.lock().await;

        let attempt = {
            let mut st = conn.lock();
            if st.generation != generation || st.state != ConnectionState::Reconnecting {
                return;
            }
            st.attempts += 1;
            st.attempts
        };
        tracing::info!(server = %conn.inner.id, attempt, "reconnecting");
        conn.notify();

        let error = match conn.establish(generation).await {
            Ok(()) => {
                tracing::info!(server = %conn.inner.id, attempt, "reconnected");
                return;
            }
            Err(e) => e,
        };

        let exhausted = {
            let mut st = conn.lock();
            if st.generation != generation {
                return;
            }
            st.last_error = Some(error.to_string());
            let exhausted = st.attempts >= st.settings.reconnect.max_attempts;
            if exhausted {
                st.state = ConnectionState::Error;
                st.reconnect_task = None;
            }
            exhausted
        };

        if exhausted {
            tracing::warn!(
                server = %conn.inner.id,
                attempts = attempt,
                error = %error,
                "giving up on reconnect"
            );
        } else {
            tracing::warn!(server = %conn.inner.id, attempt, error = %error, "reconnect attempt failed");
        }
        conn.notify();
        if exhausted {
            return;
        }
    }
}

// ─── Handshake ───────────────────────────────────────────────────────────────

/// `initialize` → `notifications/initialized` → `tools/list`.
async fn handshake(
    transport: &dyn Transport,
) -> Result<(Option<ServerInfo>, Vec<ToolDescriptor>), McpError> {
    let params = serde_json::to_value(InitializeParams::default()).map_err(|e| {
        McpError::TransportError {
            server: transport.server_id().to_string(),
            reason: format!("failed to serialize initialize params: {e}"),
        }
    })?;
    let result = transport
        .send_request(methods::INITIALIZE, Some(params))
        .await?;
    let init: InitializeResult = serde_json::from_value(result).unwrap_or_else(|e| {
        tracing::debug!(
            server = %transport.server_id(),
            error = %e,
            "unreadable initialize result, continuing without server info"
        );
        InitializeResult::default()
    });

    if let Some(info) = &init.server_info {
        tracing::debug!(
            server = %transport.server_id(),
            name = ?info.name,
            version = ?info.version,
            protocol = ?init.protocol_version,
            "initialized"
        );
    }

    transport
        .send(JsonRpcNotification::new(methods::INITIALIZED, None))
        .await?;

    let tools = list_tools(transport).await?;
    Ok((init.server_info, tools))
}

/// Fetch the tool list. A server without tool support has no tools.
async fn list_tools(transport: &dyn Transport) -> Result<Vec<ToolDescriptor>, McpError> {
    match transport.send_request(methods::TOOLS_LIST, None).await {
        Ok(result) => {
            let list: ToolsListResult =
                serde_json::from_value(result).map_err(|e| McpError::MalformedMessage {
                    server: transport.server_id().to_string(),
                    reason: format!("invalid tools/list result: {e}"),
                })?;
            Ok(list.tools)
        }
        Err(McpError::RemoteError { code, .. }) if code == error_codes::METHOD_NOT_FOUND => {
            Ok(Vec::new())
        }
        Err(e) => Err(e),
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
