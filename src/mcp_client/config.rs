//! Server and client configuration.
//!
//! Configuration is consumed, never mutated: the manager takes a
//! `ClientSettings` snapshot at construction and on reload. Global knobs can
//! be overridden per server; `ServerConfig::resolve` computes the effective
//! values for one connection attempt.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::errors::McpError;

// ─── Defaults ────────────────────────────────────────────────────────────────

/// Default budget for a transport to become usable.
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 30_000;

/// Default budget for a correlated response.
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;

/// Grace period between the polite termination signal and a force kill.
pub const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 5_000;

/// Maximum reconnect attempts per disconnect episode.
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 3;

/// Delay before each reconnect attempt.
pub const DEFAULT_RECONNECT_DELAY_MS: u64 = 1_000;

fn default_true() -> bool {
    true
}
fn default_max_reconnect_attempts() -> u32 {
    DEFAULT_MAX_RECONNECT_ATTEMPTS
}
fn default_reconnect_delay_ms() -> u64 {
    DEFAULT_RECONNECT_DELAY_MS
}
fn default_connect_timeout_ms() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_MS
}
fn default_request_timeout_ms() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_MS
}
fn default_shutdown_grace_ms() -> u64 {
    DEFAULT_SHUTDOWN_GRACE_MS
}

// ─── Public Types ────────────────────────────────────────────────────────────

/// Which channel a server is reached over.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Child process speaking newline-delimited JSON over stdio.
    #[default]
    Stdio,
    /// Server-sent events endpoint (needs a host-supplied transport).
    Sse,
    /// WebSocket endpoint (needs a host-supplied transport).
    Websocket,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Stdio => "stdio",
            TransportKind::Sse => "sse",
            TransportKind::Websocket => "websocket",
        }
    }
}

/// Identity and launch parameters for one tool provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    /// Stable, unique identifier.
    pub id: String,
    /// Human-readable display name. Falls back to `id` when empty.
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub transport: TransportKind,
    /// Executable to launch (stdio transport).
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Environment overrides layered over the inherited environment.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Working directory for the child process.
    #[serde(default)]
    pub cwd: Option<String>,
    /// Endpoint URL (socket transports).
    #[serde(default)]
    pub url: Option<String>,

    // Per-server overrides of the global settings.
    #[serde(default)]
    pub auto_connect: Option<bool>,
    #[serde(default)]
    pub tool_prefix: Option<String>,
    #[serde(default)]
    pub auto_reconnect: Option<bool>,
    #[serde(default)]
    pub max_reconnect_attempts: Option<u32>,
    #[serde(default)]
    pub reconnect_delay_ms: Option<u64>,
    #[serde(default)]
    pub connect_timeout_ms: Option<u64>,
    #[serde(default)]
    pub request_timeout_ms: Option<u64>,
}

impl ServerConfig {
    /// A stdio server with no overrides.
    pub fn stdio(id: &str, command: &str, args: &[&str]) -> Self {
        Self {
            id: id.to_string(),
            name: String::new(),
            enabled: true,
            transport: TransportKind::Stdio,
            command: command.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            env: HashMap::new(),
            cwd: None,
            url: None,
            auto_connect: None,
            tool_prefix: None,
            auto_reconnect: None,
            max_reconnect_attempts: None,
            reconnect_delay_ms: None,
            connect_timeout_ms: None,
            request_timeout_ms: None,
        }
    }

    /// Display name, defaulting to the id.
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.id
        } else {
            &self.name
        }
    }

    /// Compute the effective settings for this server.
    pub fn resolve(&self, global: &ClientSettings) -> ConnectionSettings {
        let tool_prefix = self
            .tool_prefix
            .as_ref()
            .or(global.tool_prefix.as_ref())
            .map(|p| expand_prefix(p, &self.id))
            .filter(|p| !p.is_empty());

        ConnectionSettings {
            auto_connect: self.auto_connect.unwrap_or(global.auto_connect),
            tool_prefix,
            reconnect: ReconnectPolicy {
                enabled: self.auto_reconnect.unwrap_or(global.auto_reconnect),
                max_attempts: self
                    .max_reconnect_attempts
                    .unwrap_or(global.max_reconnect_attempts),
                delay: Duration::from_millis(
                    self.reconnect_delay_ms.unwrap_or(global.reconnect_delay_ms),
                ),
            },
            connect_timeout: Duration::from_millis(
                self.connect_timeout_ms.unwrap_or(global.connect_timeout_ms),
            ),
            request_timeout: Duration::from_millis(
                self.request_timeout_ms.unwrap_or(global.request_timeout_ms),
            ),
            shutdown_grace: Duration::from_millis(global.shutdown_grace_ms),
            strict_framing: global.strict_framing,
        }
    }
}

/// Expand `{id}` in a prefix template.
fn expand_prefix(template: &str, server_id: &str) -> String {
    template.replace("{id}", server_id)
}

/// Global configuration snapshot consumed by the connection manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientSettings {
    /// Connect every enabled server when the manager starts.
    #[serde(default = "default_true")]
    pub auto_connect: bool,
    /// Prefix prepended to every visible tool name. `{id}` expands to the
    /// server id, e.g. `"{id}_"` turns `search` into `github_search`.
    #[serde(default)]
    pub tool_prefix: Option<String>,
    #[serde(default = "default_true")]
    pub auto_reconnect: bool,
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
    /// Treat an unparseable inbound line as fatal to the connection instead
    /// of logging and dropping it.
    #[serde(default)]
    pub strict_framing: bool,
    #[serde(default)]
    pub servers: Vec<ServerConfig>,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            auto_connect: true,
            tool_prefix: None,
            auto_reconnect: true,
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            reconnect_delay_ms: DEFAULT_RECONNECT_DELAY_MS,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            shutdown_grace_ms: DEFAULT_SHUTDOWN_GRACE_MS,
            strict_framing: false,
            servers: Vec::new(),
        }
    }
}

impl ClientSettings {
    /// Reject duplicate or empty ids and stdio servers without a command.
    pub fn validate(&self) -> Result<(), McpError> {
        let mut seen = HashSet::new();
        for server in &self.servers {
            validate_server(server)?;
            if !seen.insert(server.id.as_str()) {
                return Err(McpError::ConfigError {
                    reason: format!("duplicate server id '{}'", server.id),
                });
            }
        }
        Ok(())
    }
}

/// Validate a single server entry.
pub fn validate_server(server: &ServerConfig) -> Result<(), McpError> {
    if server.id.trim().is_empty() {
        return Err(McpError::ConfigError {
            reason: "server id must not be empty".into(),
        });
    }
    if server.transport == TransportKind::Stdio && server.command.trim().is_empty() {
        return Err(McpError::ConfigError {
            reason: format!("stdio server '{}' has no command", server.id),
        });
    }
    Ok(())
}

/// Reconnection policy for one server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub enabled: bool,
    pub max_attempts: u32,
    pub delay: Duration,
}

impl ReconnectPolicy {
    /// Whether an unexpected disconnect should start a reconnect episode.
    pub fn should_reconnect(&self) -> bool {
        self.enabled && self.max_attempts > 0
    }
}

/// Effective per-server settings for one connection attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSettings {
    pub auto_connect: bool,
    pub tool_prefix: Option<String>,
    pub reconnect: ReconnectPolicy,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub shutdown_grace: Duration,
    pub strict_framing: bool,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        ServerConfig::stdio("", "", &[]).resolve(&ClientSettings::default())
    }
}

// ─── Loading ─────────────────────────────────────────────────────────────────

/// Load settings from a JSON or YAML file (chosen by extension).
///
/// Performs environment-variable interpolation on `${VAR_NAME}` and
/// `${VAR_NAME:-default}` before parsing, then validates the result.
pub fn load_settings(path: &Path) -> Result<ClientSettings, McpError> {
    let raw = std::fs::read_to_string(path).map_err(|e| McpError::ConfigError {
        reason: format!("failed to read {}: {e}", path.display()),
    })?;

    let interpolated = interpolate_env_vars(&raw);

    let is_yaml = matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    );

    let settings: ClientSettings = if is_yaml {
        serde_yaml::from_str(&interpolated).map_err(|e| McpError::ConfigError {
            reason: format!("failed to parse {}: {e}", path.display()),
        })?
    } else {
        serde_json::from_str(&interpolated).map_err(|e| McpError::ConfigError {
            reason: format!("failed to parse {}: {e}", path.display()),
        })?
    };

    settings.validate()?;
    Ok(settings)
}

// ─── Env-var interpolation ───────────────────────────────────────────────────

/// Substitute `${VAR}` and `${VAR:-default}`. An unterminated `${` is kept
/// as written.
fn interpolate_env_vars(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                out.push_str(&lookup_var(&after[..end]));
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

/// Value of `NAME` or `NAME:-fallback`; unset without a fallback is empty.
fn lookup_var(expr: &str) -> String {
    let (name, fallback) = match expr.split_once(":-") {
        Some((name, fallback)) => (name, Some(fallback)),
        None => (expr, None),
    };
    match (std::env::var(name), fallback) {
        (Ok(value), _) => value,
        (Err(_), Some(fallback)) => expand_tilde(fallback),
        (Err(_), None) => String::new(),
    }
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix('~') {
        if let Some(home) = dirs::home_dir() {
            return format!("{}{rest}", home.display());
        }
    }
    path.to_string()
}

// ─── Tests ───────────────────────────────────────────────────────────────────
