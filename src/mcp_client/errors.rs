//! MCP Client error types.
//!
//! Transport-level failures are recovered by the connection layer into state
//! transitions; these types carry the context needed for the operator-facing
//! "last error" message and for structured log entries.

use thiserror::Error;

/// Errors that can occur during MCP client operations.
#[derive(Debug, Clone, Error)]
pub enum McpError {
    /// No usable channel within the connection budget.
    #[error("server '{server}' did not connect within {timeout_ms}ms")]
    ConnectionTimeout { server: String, timeout_ms: u64 },

    /// The process could not be launched, or exited / closed its channel.
    ///
    /// `reason` includes the captured diagnostic snippet when available.
    #[error("connection to server '{server}' failed: {reason}")]
    ConnectionFailed { server: String, reason: String },

    /// Operation attempted outside an open session.
    #[error("server '{server}' is not connected")]
    NotConnected { server: String },

    /// `connect()` invoked on a transport that is already connected.
    #[error("server '{server}' is already connected")]
    AlreadyConnected { server: String },

    /// A connect or handshake is already in flight on this connection.
    #[error("server '{server}' already has a connection attempt in progress")]
    ConnectInProgress { server: String },

    /// No correlated response within the per-request budget.
    #[error("request '{method}' (id={id}) to server '{server}' timed out after {timeout_ms}ms")]
    RequestTimeout {
        server: String,
        method: String,
        id: u64,
        timeout_ms: u64,
    },

    /// Server returned an explicit JSON-RPC error object.
    #[error("server error [{code}]: {message}")]
    RemoteError {
        code: i32,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// Pending request invalidated by transport teardown.
    #[error("transport for server '{server}' closed")]
    TransportClosed { server: String },

    /// Write, flush, or serialization failure on an open channel.
    #[error("transport error for server '{server}': {reason}")]
    TransportError { server: String, reason: String },

    /// Inbound line that failed to parse while strict framing is enabled.
    #[error("malformed message from server '{server}': {reason}")]
    MalformedMessage { server: String, reason: String },

    /// Two tools resolve to the same visible name after prefixing.
    #[error(
        "tool '{original_name}' from server '{server}' conflicts with '{visible_name}' \
         already registered by server '{existing_server}'"
    )]
    ToolNameConflict {
        visible_name: String,
        server: String,
        original_name: String,
        existing_server: String,
    },

    /// No transport binding exists for the configured transport kind.
    #[error("server '{server}': no transport available for kind '{kind}'")]
    UnsupportedTransport { server: String, kind: String },

    /// No server with this id is configured.
    #[error("unknown server: '{server}'")]
    UnknownServer { server: String },

    /// Configuration error (bad file, invalid server entry).
    #[error("config error: {reason}")]
    ConfigError { reason: String },
}

impl McpError {
    /// Whether this error means the channel itself is gone (as opposed to a
    /// per-request failure on a healthy channel).
    pub fn is_channel_loss(&self) -> bool {
        matches!(
            self,
            McpError::ConnectionFailed { .. }
                | McpError::TransportClosed { .. }
                | McpError::TransportError { .. }
                | McpError::MalformedMessage { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_error_message() {
        let err = McpError::RemoteError {
            code: -32601,
            message: "Method not found".into(),
            data: None,
        };
        assert_eq!(err.to_string(), "server error [-32601]: Method not found");
    }

    #[test]
    fn test_connection_failed_carries_reason() {
        let err = McpError::ConnectionFailed {
            server: "github".into(),
            reason: "process exited with code 1 | stderr: missing API key".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("github"));
        assert!(msg.contains("missing API key"));
    }

    #[test]
    fn test_is_channel_loss() {
        assert!(McpError::TransportClosed { server: "s".into() }.is_channel_loss());
        assert!(McpError::ConnectionFailed {
            server: "s".into(),
            reason: "gone".into(),
        }
        .is_channel_loss());
        assert!(!McpError::RequestTimeout {
            server: "s".into(),
            method: "tools/list".into(),
            id: 1,
            timeout_ms: 10,
        }
        .is_channel_loss());
        assert!(!McpError::RemoteError {
            code: -1,
            message: "x".into(),
            data: None,
        }
        .is_channel_loss());
    }
}
