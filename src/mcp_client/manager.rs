//! Connection manager: one `ServerConnection` per configured server, plus
//! the aggregated tool registry.
//!
//! This is the host-facing API. Servers are independent: an operation on
//! one server never waits on another. The registry is rebuilt by the manager
//! alone whenever any server's status changes and is published as an
//! immutable snapshot, so readers never block the rebuild.
//!
//! Observers registered with [`ConnectionManager::on_status_change`] receive
//! every status change, in registration order.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use futures::future::join_all;

use super::config::{validate_server, ClientSettings, ConnectionSettings, ServerConfig};
use super::connection::{ServerConnection, StatusCallback};
use super::errors::McpError;
use super::registry::{RegisteredTool, ToolConflict, ToolRegistry};
use super::transport::{DefaultTransportFactory, TransportFactory};
use super::types::{ConnectionState, ServerStatus, ToolDescriptor};

/// Receives a snapshot whenever any server's status changes.
pub type StatusObserver = Arc<dyn Fn(&ServerStatus) + Send + Sync>;

/// Handle for removing an observer.
pub type ObserverId = u64;

// ─── Internal State ──────────────────────────────────────────────────────────

struct Entry {
    /// Position in registration order; kept across config updates.
    index: u64,
    /// Identifies the connection instance, so callbacks from a replaced
    /// connection are ignored.
    token: u64,
    connection: ServerConnection,
}

struct ManagerInner {
    settings: RwLock<ClientSettings>,
    servers: RwLock<HashMap<String, Entry>>,
    registry: RwLock<Arc<ToolRegistry>>,
    /// Serializes registry rebuilds.
    rebuild_lock: Mutex<()>,
    observers: RwLock<Vec<(ObserverId, StatusObserver)>>,
    factory: Arc<dyn TransportFactory>,
    started: AtomicBool,
    next_index: AtomicU64,
    next_token: AtomicU64,
    next_observer: AtomicU64,
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}

impl ManagerInner {
    fn on_status(&self, token: u64, status: &ServerStatus) {
        let current = read(&self.servers)
            .get(&status.id)
            .is_some_and(|e| e.token == token);
        if !current {
            return;
        }
        tracing::debug!(server = %status.id, state = %status.state, "status changed");
        self.rebuild_registry();
        self.notify_observers(status);
    }

    fn rebuild_registry(&self) {
        let _writer = self.rebuild_lock.lock().unwrap_or_else(|e| e.into_inner());

        let mut connections: Vec<(u64, ServerConnection)> = read(&self.servers)
            .values()
            .map(|e| (e.index, e.connection.clone()))
            .collect();
        connections.sort_by_key(|(index, _)| *index);

        let mut registry = ToolRegistry::new();
        for (_, connection) in &connections {
            let status = connection.status();
            if status.state != ConnectionState::Connected {
                continue;
            }
            let prefix = connection.settings().tool_prefix;
            registry.register_server_tools(&status.id, prefix.as_deref(), &status.tools);
        }

        tracing::debug!(
            tools = registry.len(),
            conflicts = registry.conflicts().len(),
            "tool registry rebuilt"
        );
        *write(&self.registry) = Arc::new(registry);
    }

    fn notify_observers(&self, status: &ServerStatus) {
        let observers: Vec<StatusObserver> =
            read(&self.observers).iter().map(|(_, o)| o.clone()).collect();
        for observer in observers {
            observer(status);
        }
    }
}

// ─── ConnectionManager ───────────────────────────────────────────────────────

/// Owns every server connection. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<ManagerInner>,
}

impl ConnectionManager {
    /// Create a manager for `settings`. No server is contacted until
    /// [`start`](Self::start) or an explicit connect.
    pub fn new(
        settings: ClientSettings,
        factory: Arc<dyn TransportFactory>,
    ) -> Result<Self, McpError> {
        settings.validate()?;

        let manager = Self {
            inner: Arc::new(ManagerInner {
                settings: RwLock::new(settings.clone()),
                servers: RwLock::new(HashMap::new()),
                registry: RwLock::new(Arc::new(ToolRegistry::new())),
                rebuild_lock: Mutex::new(()),
                observers: RwLock::new(Vec::new()),
                factory,
                started: AtomicBool::new(false),
                next_index: AtomicU64::new(0),
                next_token: AtomicU64::new(0),
                next_observer: AtomicU64::new(1),
            }),
        };

        {
            let mut servers = write(&manager.inner.servers);
            for config in &settings.servers {
                let index = manager.inner.next_index.fetch_add(1, Ordering::SeqCst);
                let entry = manager.new_entry(index, config.clone(), config.resolve(&settings));
                servers.insert(config.id.clone(), entry);
            }
        }
        Ok(manager)
    }

    /// Manager using the built-in process transport.
    pub fn with_default_transports(settings: ClientSettings) -> Result<Self, McpError> {
        Self::new(settings, Arc::new(DefaultTransportFactory))
    }

    fn new_entry(&self, index: u64, config: ServerConfig, settings: ConnectionSettings) -> Entry {
        let token = self.inner.next_token.fetch_add(1, Ordering::SeqCst);
        let weak = Arc::downgrade(&self.inner);
        let callback: StatusCallback = Arc::new(move |status: &ServerStatus| {
            if let Some(inner) = weak.upgrade() {
                inner.on_status(token, status);
            }
        });
        Entry {
            index,
            token,
            connection: ServerConnection::new(
                config,
                settings,
                self.inner.factory.clone(),
                Some(callback),
            ),
        }
    }

    fn connection(&self, id: &str) -> Result<ServerConnection, McpError> {
        read(&self.inner.servers)
            .get(id)
            .map(|e| e.connection.clone())
            .ok_or_else(|| McpError::UnknownServer {
                server: id.to_string(),
            })
    }

    /// Connections in registration order.
    fn connections(&self) -> Vec<ServerConnection> {
        let servers = read(&self.inner.servers);
        let mut entries: Vec<&Entry> = servers.values().collect();
        entries.sort_by_key(|e| e.index);
        entries.into_iter().map(|e| e.connection.clone()).collect()
    }

    /// Current configuration snapshot.
    pub fn settings(&self) -> ClientSettings {
        read(&self.inner.settings).clone()
    }

    // ─── Lifecycle ───────────────────────────────────────────────────────

    /// Connect every enabled server whose effective `auto_connect` is set.
    ///
    /// Servers connect concurrently. Returns the servers that failed; they
    /// stay in `error` and the rest are unaffected.
    pub async fn start(&self) -> Vec<(String, McpError)> {
        self.inner.started.store(true, Ordering::SeqCst);

        let targets: Vec<ServerConnection> = self
            .connections()
            .into_iter()
            .filter(|c| c.config().enabled && c.settings().auto_connect)
            .collect();

        tracing::info!(servers = targets.len(), "starting servers");

        let results = join_all(targets.iter().map(|c| c.connect())).await;
        let errors: Vec<(String, McpError)> = targets
            .iter()
            .zip(results)
            .filter_map(|(c, r)| r.err().map(|e| (c.id().to_string(), e)))
            .collect();

        for (server, error) in &errors {
            tracing::warn!(server = %server, error = %error, "server failed to start");
        }
        errors
    }

    /// Disconnect every server.
    pub async fn shutdown(&self) {
        self.inner.started.store(false, Ordering::SeqCst);
        let connections = self.connections();
        join_all(connections.iter().map(|c| c.disconnect())).await;
        tracing::info!(servers = connections.len(), "all servers disconnected");
    }

    pub async fn connect_server(&self, id: &str) -> Result<(), McpError> {
        self.connection(id)?.connect().await
    }

    pub async fn disconnect_server(&self, id: &str) -> Result<(), McpError> {
        self.connection(id)?.disconnect().await
    }

    // ─── Configuration ───────────────────────────────────────────────────

    /// Add a server or replace its configuration.
    ///
    /// A replaced server that was active is reconnected with the new
    /// configuration. A new server connects right away if it is enabled,
    /// auto-connect applies, and the manager has been started. A disabled
    /// server is torn down.
    pub async fn upsert_server(&self, config: ServerConfig) -> Result<(), McpError> {
        validate_server(&config)?;

        let resolved = {
            let mut settings = write(&self.inner.settings);
            match settings.servers.iter_mut().find(|s| s.id == config.id) {
                Some(existing) => *existing = config.clone(),
                None => settings.servers.push(config.clone()),
            }
            config.resolve(&settings)
        };

        let (previous, connection) = {
            let mut servers = write(&self.inner.servers);
            if let Some(existing) = servers.get(&config.id) {
                if existing.connection.config() == config {
                    existing.connection.apply_settings(resolved);
                    return Ok(());
                }
            }
            let index = servers
                .get(&config.id)
                .map(|e| e.index)
                .unwrap_or_else(|| self.inner.next_index.fetch_add(1, Ordering::SeqCst));
            let entry = self.new_entry(index, config.clone(), resolved.clone());
            let connection = entry.connection.clone();
            (servers.insert(config.id.clone(), entry), connection)
        };

        let was_active = match &previous {
            Some(entry) => {
                let state = entry.connection.state();
                entry.connection.disconnect().await?;
                matches!(
                    state,
                    ConnectionState::Connected
                        | ConnectionState::Connecting
                        | ConnectionState::Reconnecting
                )
            }
            None => false,
        };

        tracing::info!(
            server = %config.id,
            enabled = config.enabled,
            replaced = previous.is_some(),
            "server configuration updated"
        );
        self.inner.rebuild_registry();

        let started = self.inner.started.load(Ordering::SeqCst);
        if config.enabled && (was_active || (started && resolved.auto_connect)) {
            connection.connect().await
        } else {
            self.inner.notify_observers(&connection.status());
            Ok(())
        }
    }

    /// Enable (and connect) or disable (and tear down) a configured server.
    pub async fn set_enabled(&self, id: &str, enabled: bool) -> Result<(), McpError> {
        let mut config = self.connection(id)?.config();
        if config.enabled == enabled {
            return Ok(());
        }
        config.enabled = enabled;
        self.upsert_server(config).await?;
        if enabled {
            self.connect_server(id).await
        } else {
            Ok(())
        }
    }

    /// Tear down and forget a server.
    pub async fn remove_server(&self, id: &str) -> Result<(), McpError> {
        let entry = write(&self.inner.servers)
            .remove(id)
            .ok_or_else(|| McpError::UnknownServer {
                server: id.to_string(),
            })?;
        write(&self.inner.settings).servers.retain(|s| s.id != id);

        entry.connection.disconnect().await?;
        tracing::info!(server = %id, "server removed");

        self.inner.rebuild_registry();
        self.inner.notify_observers(&entry.connection.status());
        Ok(())
    }

    /// Replace the configuration snapshot.
    ///
    /// Servers no longer present are removed, new ones added, changed ones
    /// replaced. Unchanged servers keep their session and pick up the new
    /// global knobs on their next attempt; the registry is rebuilt at once so
    /// a new prefix applies immediately.
    pub async fn reload_settings(&self, settings: ClientSettings) -> Result<(), McpError> {
        settings.validate()?;

        let stale: Vec<String> = read(&self.inner.servers)
            .keys()
            .filter(|id| !settings.servers.iter().any(|s| &s.id == *id))
            .cloned()
            .collect();

        {
            let mut current = write(&self.inner.settings);
            *current = ClientSettings {
                servers: current.servers.clone(),
                ..settings.clone()
            };
        }

        for id in stale {
            self.remove_server(&id).await?;
        }

        let mut first_error = None;
        for config in &settings.servers {
            let existing = self.connection(&config.id).ok();
            match existing {
                Some(connection) if connection.config() == *config => {
                    connection.apply_settings(config.resolve(&settings));
                }
                _ => {
                    if let Err(e) = self.upsert_server(config.clone()).await {
                        first_error.get_or_insert(e);
                    }
                }
            }
        }
        *write(&self.inner.settings) = settings;

        self.inner.rebuild_registry();
        tracing::info!("settings reloaded");
        first_error.map_or(Ok(()), Err)
    }

    // ─── Status ──────────────────────────────────────────────────────────

    pub fn status(&self, id: &str) -> Result<ServerStatus, McpError> {
        Ok(self.connection(id)?.status())
    }

    /// Status of every server, in registration order.
    pub fn statuses(&self) -> Vec<ServerStatus> {
        self.connections().iter().map(|c| c.status()).collect()
    }

    /// Ids of every configured server, in registration order.
    pub fn server_ids(&self) -> Vec<String> {
        self.connections()
            .iter()
            .map(|c| c.id().to_string())
            .collect()
    }

    // ─── Observers ───────────────────────────────────────────────────────

    /// Register a status observer. Observers run in registration order on
    /// the task that caused the change and should return quickly.
    pub fn on_status_change<F>(&self, observer: F) -> ObserverId
    where
        F: Fn(&ServerStatus) + Send + Sync + 'static,
    {
        let id = self.inner.next_observer.fetch_add(1, Ordering::SeqCst);
        write(&self.inner.observers).push((id, Arc::new(observer)));
        id
    }

    pub fn remove_observer(&self, id: ObserverId) -> bool {
        let mut observers = write(&self.inner.observers);
        let before = observers.len();
        observers.retain(|(oid, _)| *oid != id);
        observers.len() != before
    }

    // ─── Tools ───────────────────────────────────────────────────────────

    /// Current registry snapshot.
    pub fn registry(&self) -> Arc<ToolRegistry> {
        read(&self.inner.registry).clone()
    }

    /// Every visible tool across connected servers.
    pub fn tools(&self) -> Vec<RegisteredTool> {
        self.registry().all_tools().into_iter().cloned().collect()
    }

    /// One server's tool list as it reported it.
    pub fn server_tools(&self, id: &str) -> Result<Vec<ToolDescriptor>, McpError> {
        Ok(self.connection(id)?.tools())
    }

    /// Visible name → `(server_id, original_name)`.
    pub fn resolve_tool(&self, visible_name: &str) -> Option<(String, String)> {
        self.registry()
            .resolve(visible_name)
            .map(|(server, name)| (server.to_string(), name.to_string()))
    }

    pub fn conflicts(&self) -> Vec<ToolConflict> {
        self.registry().conflicts().to_vec()
    }

    // ─── Requests ────────────────────────────────────────────────────────

    /// Send a correlated call to a connected server.
    pub async fn request(
        &self,
        id: &str,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, McpError> {
        self.connection(id)?.request(method, params).await
    }

    pub async fn ping_server(&self, id: &str) -> Result<(), McpError> {
        self.connection(id)?.ping().await
    }

    // ─── Connectivity Tests ──────────────────────────────────────────────

    /// Connect to `config` on a throwaway connection, count its tools, and
    /// disconnect. Managed connections are not touched.
    pub async fn test_connection(&self, config: &ServerConfig) -> Result<usize, McpError> {
        validate_server(config)?;
        let mut settings = config.resolve(&self.settings());
        settings.reconnect.enabled = false;

        let probe =
            ServerConnection::new(config.clone(), settings, self.inner.factory.clone(), None);
        let result = probe.connect().await.map(|()| probe.tools().len());
        probe.disconnect().await?;

        match &result {
            Ok(tools) => tracing::info!(server = %config.id, tools, "connection test passed"),
            Err(e) => tracing::warn!(server = %config.id, error = %e, "connection test failed"),
        }
        result
    }

    /// [`test_connection`](Self::test_connection) for a configured server.
    pub async fn test_server(&self, id: &str) -> Result<usize, McpError> {
        let config = self.connection(id)?.config();
        self.test_connection(&config).await
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp_client::testing::{tool, wait_until, MockFactory};

    fn settings(ids: &[&str]) -> ClientSettings {
        ClientSettings {
            reconnect_delay_ms: 10,
            connect_timeout_ms: 2_000,
            request_timeout_ms: 2_000,
            servers: ids
                .iter()
                .map(|id| ServerConfig::stdio(id, "mock", &[]))
                .collect(),
            ..ClientSettings::default()
        }
    }

    fn manager(settings: ClientSettings) -> (ConnectionManager, Arc<MockFactory>) {
        let factory = MockFactory::new();
        let manager = ConnectionManager::new(settings, factory.clone()).unwrap();
        (manager, factory)
    }

    fn visible_names(manager: &ConnectionManager) -> Vec<String> {
        manager.tools().into_iter().map(|t| t.visible_name).collect()
    }

    #[test]
    fn test_new_rejects_invalid_settings() {
        let mut bad = settings(&["a", "a"]);
        bad.servers[1].command = "other".into();
        let result = ConnectionManager::new(bad, MockFactory::new());
        assert!(matches!(result, Err(McpError::ConfigError { .. })));
    }

    #[tokio::test]
    async fn test_start_connects_enabled_servers_only() {
        let mut cfg = settings(&["alpha", "beta", "gamma"]);
        cfg.servers[1].enabled = false;
        cfg.servers[2].auto_connect = Some(false);
        let (manager, factory) = manager(cfg);

        let errors = manager.start().await;
        assert!(errors.is_empty());

        let states: Vec<(String, ConnectionState)> = manager
            .statuses()
            .into_iter()
            .map(|s| (s.id, s.state))
            .collect();
        assert_eq!(
            states,
            vec![
                ("alpha".to_string(), ConnectionState::Connected),
                ("beta".to_string(), ConnectionState::Disconnected),
                ("gamma".to_string(), ConnectionState::Disconnected),
            ]
        );
        assert_eq!(factory.server("beta").connect_count(), 0);
    }

    #[tokio::test]
    async fn test_prefix_with_server_id_avoids_collision() {
        let cfg = ClientSettings {
            tool_prefix: Some("{id}_".into()),
            ..settings(&["serverA", "serverB"])
        };
        let (manager, factory) = manager(cfg);
        factory.server("serverA").set_tools(vec![tool("search")]);
        factory.server("serverB").set_tools(vec![tool("search")]);

        manager.start().await;

        let mut names = visible_names(&manager);
        names.sort();
        assert_eq!(names, vec!["serverA_search", "serverB_search"]);
        assert!(manager.conflicts().is_empty());
        assert_eq!(
            manager.resolve_tool("serverB_search"),
            Some(("serverB".to_string(), "search".to_string()))
        );
    }

    #[tokio::test]
    async fn test_conflict_tie_break_follows_registration_order() {
        let (manager, factory) = manager(settings(&["first", "second"]));
        factory.server("first").set_tools(vec![tool("search")]);
        factory.server("second").set_tools(vec![tool("search"), tool("fetch")]);

        // Connect in reverse order; registration order still decides.
        manager.connect_server("second").await.unwrap();
        manager.connect_server("first").await.unwrap();

        assert_eq!(
            manager.resolve_tool("search"),
            Some(("first".to_string(), "search".to_string()))
        );
        let conflicts = manager.conflicts();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].server_id, "second");
        assert_eq!(conflicts[0].original_name, "search");
        assert_eq!(conflicts[0].existing_server, "first");
        assert!(manager.resolve_tool("fetch").is_some());
    }

    #[tokio::test]
    async fn test_disconnect_removes_only_that_servers_tools() {
        let (manager, factory) = manager(settings(&["a", "b"]));
        factory.server("a").set_tools(vec![tool("alpha")]);
        factory.server("b").set_tools(vec![tool("beta")]);
        manager.start().await;
        assert_eq!(manager.tools().len(), 2);

        manager.disconnect_server("a").await.unwrap();
        assert_eq!(visible_names(&manager), vec!["beta"]);
        assert_eq!(manager.status("b").unwrap().state, ConnectionState::Connected);
        assert!(manager.server_tools("a").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_crash_drops_tools_and_notifies() {
        let mut cfg = settings(&["a", "b"]);
        cfg.auto_reconnect = false;
        let (manager, factory) = manager(cfg);
        factory.server("a").set_tools(vec![tool("alpha")]);
        factory.server("b").set_tools(vec![tool("beta")]);
        manager.start().await;

        let errors = Arc::new(Mutex::new(Vec::new()));
        {
            let errors = errors.clone();
            manager.on_status_change(move |status| {
                if status.state == ConnectionState::Error {
                    errors.lock().unwrap().push(status.id.clone());
                }
            });
        }

        factory.server("a").crash(None);
        wait_until(|| manager.status("a").unwrap().state == ConnectionState::Error).await;

        assert_eq!(visible_names(&manager), vec!["beta"]);
        assert_eq!(*errors.lock().unwrap(), vec!["a".to_string()]);
        assert_eq!(manager.status("b").unwrap().state, ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_failing_server_does_not_affect_others() {
        let (manager, factory) = manager(settings(&["good", "bad"]));
        factory.server("good").set_tools(vec![tool("ok")]);
        factory.server("bad").fail_always(true);

        let errors = manager.start().await;
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].0, "bad");

        assert_eq!(manager.status("good").unwrap().state, ConnectionState::Connected);
        let bad = manager.status("bad").unwrap();
        assert_eq!(bad.state, ConnectionState::Error);
        assert!(bad.last_error.is_some());
        assert_eq!(visible_names(&manager), vec!["ok"]);
    }

    #[tokio::test]
    async fn test_observers_run_in_registration_order() {
        let (manager, _factory) = manager(settings(&["a"]));
        let calls = Arc::new(Mutex::new(Vec::new()));
        for label in ["first", "second"] {
            let calls = calls.clone();
            manager.on_status_change(move |status| {
                calls.lock().unwrap().push((label, status.state));
            });
        }

        manager.connect_server("a").await.unwrap();

        let calls = calls.lock().unwrap();
        assert_eq!(
            *calls,
            vec![
                ("first", ConnectionState::Connecting),
                ("second", ConnectionState::Connecting),
                ("first", ConnectionState::Connected),
                ("second", ConnectionState::Connected),
            ]
        );
    }

    #[tokio::test]
    async fn test_removed_observer_is_not_called() {
        let (manager, _factory) = manager(settings(&["a"]));
        let count = Arc::new(AtomicU64::new(0));
        let id = {
            let count = count.clone();
            manager.on_status_change(move |_| {
                count.fetch_add(1, Ordering::SeqCst);
            })
        };
        assert!(manager.remove_observer(id));
        assert!(!manager.remove_observer(id));

        manager.connect_server("a").await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_server_probe_leaves_state_alone() {
        let (manager, factory) = manager(settings(&["a"]));
        factory
            .server("a")
            .set_tools(vec![tool("x"), tool("y"), tool("z")]);

        assert_eq!(manager.test_server("a").await.unwrap(), 3);
        assert_eq!(manager.status("a").unwrap().state, ConnectionState::Disconnected);
        assert!(manager.tools().is_empty());
        assert_eq!(factory.server("a").open_transports(), 0);
    }

    #[tokio::test]
    async fn test_connection_probe_reports_failure() {
        let (manager, factory) = manager(settings(&[]));
        factory.server("new").fail_always(true);

        let err = manager
            .test_connection(&ServerConfig::stdio("new", "mock", &[]))
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::ConnectionFailed { .. }));
        assert!(manager.statuses().is_empty());
    }

    #[tokio::test]
    async fn test_upsert_and_disable() {
        let (manager, factory) = manager(settings(&["a"]));
        factory.server("b").set_tools(vec![tool("beta")]);
        manager.start().await;

        manager
            .upsert_server(ServerConfig::stdio("b", "mock", &[]))
            .await
            .unwrap();
        assert_eq!(manager.status("b").unwrap().state, ConnectionState::Connected);
        assert_eq!(manager.server_ids(), vec!["a", "b"]);
        assert_eq!(manager.settings().servers.len(), 2);

        manager.set_enabled("b", false).await.unwrap();
        let b = manager.status("b").unwrap();
        assert!(!b.enabled);
        assert_eq!(b.state, ConnectionState::Disconnected);
        assert!(manager.tools().is_empty());
        assert_eq!(manager.status("a").unwrap().state, ConnectionState::Connected);

        manager.set_enabled("b", true).await.unwrap();
        assert_eq!(manager.status("b").unwrap().state, ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_upsert_reconnects_active_server_with_new_config() {
        let (manager, factory) = manager(settings(&["a"]));
        manager.start().await;

        let mut updated = ServerConfig::stdio("a", "mock", &["--verbose"]);
        updated.name = "Alpha".into();
        manager.upsert_server(updated).await.unwrap();

        let status = manager.status("a").unwrap();
        assert_eq!(status.name, "Alpha");
        assert_eq!(status.state, ConnectionState::Connected);
        assert_eq!(factory.server("a").connect_count(), 2);
        assert_eq!(factory.server("a").open_transports(), 1);
    }

    #[tokio::test]
    async fn test_remove_server() {
        let (manager, factory) = manager(settings(&["a", "b"]));
        factory.server("a").set_tools(vec![tool("alpha")]);
        manager.start().await;

        manager.remove_server("a").await.unwrap();
        assert_eq!(manager.server_ids(), vec!["b"]);
        assert!(manager.tools().is_empty());
        assert_eq!(factory.server("a").open_transports(), 0);

        assert!(matches!(
            manager.remove_server("a").await,
            Err(McpError::UnknownServer { .. })
        ));
    }

    #[tokio::test]
    async fn test_unknown_server_operations() {
        let (manager, _factory) = manager(settings(&[]));
        assert!(matches!(
            manager.connect_server("nope").await,
            Err(McpError::UnknownServer { .. })
        ));
        assert!(matches!(manager.status("nope"), Err(McpError::UnknownServer { .. })));
        assert!(matches!(
            manager.request("nope", "ping", None).await,
            Err(McpError::UnknownServer { .. })
        ));
    }

    #[tokio::test]
    async fn test_reload_settings_applies_new_prefix() {
        let (manager, factory) = manager(settings(&["a"]));
        factory.server("a").set_tools(vec![tool("search")]);
        manager.start().await;
        assert_eq!(visible_names(&manager), vec!["search"]);

        let reloaded = ClientSettings {
            tool_prefix: Some("{id}__".into()),
            ..settings(&["a", "c"])
        };
        manager.reload_settings(reloaded).await.unwrap();

        assert_eq!(visible_names(&manager), vec!["a__search"]);
        assert_eq!(manager.server_ids(), vec!["a", "c"]);
        assert_eq!(manager.status("c").unwrap().state, ConnectionState::Connected);
        // The unchanged server kept its session.
        assert_eq!(factory.server("a").connect_count(), 1);
    }

    #[tokio::test]
    async fn test_reload_settings_drops_removed_servers() {
        let (manager, factory) = manager(settings(&["a", "b"]));
        manager.start().await;

        manager.reload_settings(settings(&["b"])).await.unwrap();
        assert_eq!(manager.server_ids(), vec!["b"]);
        assert_eq!(factory.server("a").open_transports(), 0);
        assert_eq!(manager.settings().servers.len(), 1);
    }

    #[tokio::test]
    async fn test_tool_list_change_updates_registry() {
        let (manager, factory) = manager(settings(&["a"]));
        factory.server("a").set_tools(vec![tool("one")]);
        manager.start().await;

        factory.server("a").announce_tools(vec![tool("one"), tool("two")]);
        wait_until(|| manager.tools().len() == 2).await;
        assert_eq!(visible_names(&manager), vec!["one", "two"]);
    }

    #[tokio::test]
    async fn test_request_routes_to_resolved_server() {
        let cfg = ClientSettings {
            tool_prefix: Some("{id}_".into()),
            ..settings(&["fs"])
        };
        let (manager, factory) = manager(cfg);
        factory.server("fs").set_tools(vec![tool("read_file")]);
        manager.start().await;

        let (server, original) = manager.resolve_tool("fs_read_file").unwrap();
        let result = manager
            .request(
                &server,
                "tools/call",
                Some(serde_json::json!({"name": original, "arguments": {"path": "/tmp"}})),
            )
            .await
            .unwrap();
        assert_eq!(result["params"]["name"], "read_file");

        manager.ping_server("fs").await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_disconnects_everything() {
        let (manager, factory) = manager(settings(&["a", "b"]));
        manager.start().await;

        manager.shutdown().await;
        for status in manager.statuses() {
            assert_eq!(status.state, ConnectionState::Disconnected);
        }
        assert_eq!(factory.server("a").open_transports(), 0);
        assert_eq!(factory.server("b").open_transports(), 0);
        assert!(manager.tools().is_empty());
    }
}
