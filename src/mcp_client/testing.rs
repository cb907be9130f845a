//! Scripted in-memory transport for exercising the connection state machine
//! and the manager without spawning processes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use super::config::{ConnectionSettings, ServerConfig};
use super::errors::McpError;
use super::framing::InboundMessage;
use super::transport::{EventSink, Transport, TransportFactory};
use super::types::{error_codes, methods, JsonRpcNotification, ToolDescriptor};

/// A tool with just a name.
pub fn tool(name: &str) -> ToolDescriptor {
    ToolDescriptor {
        name: name.to_string(),
        description: Some(format!("{name} tool")),
        input_schema: json!({"type": "object", "properties": {}}),
    }
}

/// Poll `condition` every 10ms, panicking after 5s.
pub async fn wait_until<F: Fn() -> bool>(condition: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("condition not reached within 5s");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// ─── Script ──────────────────────────────────────────────────────────────────

/// Behavior of one fake server, shared by every transport created for it.
#[derive(Default)]
pub struct MockServer {
    tools: Mutex<Vec<ToolDescriptor>>,
    tools_unsupported: AtomicBool,
    hang_initialize: AtomicBool,
    garbled_initialize: AtomicBool,
    step_delay: Mutex<Duration>,
    fail_always: AtomicBool,
    fail_next: AtomicU32,
    connects: AtomicU32,
    transports: Mutex<Vec<Weak<MockTransport>>>,
}

impl MockServer {
    pub fn set_tools(&self, tools: Vec<ToolDescriptor>) {
        *self.tools.lock().unwrap() = tools;
    }

    /// Answer `tools/list` with method-not-found.
    pub fn tools_unsupported(&self, on: bool) {
        self.tools_unsupported.store(on, Ordering::SeqCst);
    }

    /// Never answer `initialize` (until the transport is closed).
    pub fn hang_initialize(&self, on: bool) {
        self.hang_initialize.store(on, Ordering::SeqCst);
    }

    /// Answer `initialize` with something that is not an initialize result.
    pub fn garbled_initialize(&self, on: bool) {
        self.garbled_initialize.store(on, Ordering::SeqCst);
    }

    /// Sleep this long inside both `connect()` and `initialize`.
    pub fn step_delay(&self, delay: Duration) {
        *self.step_delay.lock().unwrap() = delay;
    }

    fn delay(&self) -> Duration {
        *self.step_delay.lock().unwrap()
    }

    pub fn fail_always(&self, on: bool) {
        self.fail_always.store(on, Ordering::SeqCst);
    }

    pub fn fail_next_connects(&self, count: u32) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    /// Number of `connect()` calls, successful or not.
    pub fn connect_count(&self) -> u32 {
        self.connects.load(Ordering::SeqCst)
    }

    /// Transports currently connected.
    pub fn open_transports(&self) -> usize {
        self.live().iter().filter(|t| t.is_connected()).count()
    }

    /// Drop every open channel as if the server died.
    pub fn crash(&self, error: Option<McpError>) {
        for transport in self.live() {
            if transport.connected.swap(false, Ordering::SeqCst) {
                transport.events.closed(error.clone());
            }
        }
    }

    /// Replace the tool list and tell connected clients about it.
    pub fn announce_tools(&self, tools: Vec<ToolDescriptor>) {
        self.set_tools(tools);
        for transport in self.live() {
            if transport.is_connected() {
                transport.events.message(InboundMessage::from(JsonRpcNotification::new(
                    methods::TOOLS_LIST_CHANGED,
                    None,
                )));
            }
        }
    }

    fn live(&self) -> Vec<Arc<MockTransport>> {
        self.transports
            .lock()
            .unwrap()
            .iter()
            .filter_map(Weak::upgrade)
            .collect()
    }
}

// ─── Factory ─────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct MockFactory {
    servers: Mutex<HashMap<String, Arc<MockServer>>>,
}

impl MockFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Script for `id`, created on first use.
    pub fn server(&self, id: &str) -> Arc<MockServer> {
        self.servers
            .lock()
            .unwrap()
            .entry(id.to_string())
            .or_default()
            .clone()
    }
}

impl TransportFactory for MockFactory {
    fn create(
        &self,
        config: &ServerConfig,
        _settings: &ConnectionSettings,
        events: EventSink,
    ) -> Result<Arc<dyn Transport>, McpError> {
        let script = self.server(&config.id);
        let transport = Arc::new(MockTransport {
            id: config.id.clone(),
            script: script.clone(),
            events,
            connected: AtomicBool::new(false),
        });
        script
            .transports
            .lock()
            .unwrap()
            .push(Arc::downgrade(&transport));
        Ok(transport)
    }
}

// ─── Transport ───────────────────────────────────────────────────────────────

pub struct MockTransport {
    id: String,
    script: Arc<MockServer>,
    events: EventSink,
    connected: AtomicBool,
}

impl MockTransport {
    fn not_connected(&self) -> McpError {
        McpError::NotConnected {
            server: self.id.clone(),
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn server_id(&self) -> &str {
        &self.id
    }

    async fn connect(&self) -> Result<(), McpError> {
        self.script.connects.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.script.delay()).await;
        let scripted_failure = self.script.fail_always.load(Ordering::SeqCst)
            || self
                .script
                .fail_next
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
        if scripted_failure {
            return Err(McpError::ConnectionFailed {
                server: self.id.clone(),
                reason: "scripted connect failure".into(),
            });
        }
        if self.connected.swap(true, Ordering::SeqCst) {
            return Err(McpError::AlreadyConnected {
                server: self.id.clone(),
            });
        }
        self.events.rearm();
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), McpError> {
        if self.connected.swap(false, Ordering::SeqCst) {
            self.events.closed(None);
        }
        Ok(())
    }

    async fn send_request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, McpError> {
        if !self.is_connected() {
            return Err(self.not_connected());
        }
        match method {
            methods::INITIALIZE => {
                tokio::time::sleep(self.script.delay()).await;
                if self.script.garbled_initialize.load(Ordering::SeqCst) {
                    return Ok(json!("ready"));
                }
                if self.script.hang_initialize.load(Ordering::SeqCst) {
                    while self.is_connected() {
                        tokio::time::sleep(Duration::from_millis(5)).await;
                    }
                    return Err(McpError::TransportClosed {
                        server: self.id.clone(),
                    });
                }
                Ok(json!({
                    "protocolVersion": "2024-11-05",
                    "capabilities": {"tools": {}},
                    "serverInfo": {"name": self.id, "version": "1.0.0"}
                }))
            }
            methods::TOOLS_LIST => {
                if self.script.tools_unsupported.load(Ordering::SeqCst) {
                    return Err(McpError::RemoteError {
                        code: error_codes::METHOD_NOT_FOUND,
                        message: "Method not found".into(),
                        data: None,
                    });
                }
                let tools = self.script.tools.lock().unwrap().clone();
                Ok(json!({ "tools": tools }))
            }
            methods::PING => Ok(json!({})),
            _ => Ok(json!({ "method": method, "params": params })),
        }
    }

    async fn send(&self, _notification: JsonRpcNotification) -> Result<(), McpError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(self.not_connected())
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
