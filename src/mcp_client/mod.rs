//! MCP client: connections to many tool servers behind one registry.
//!
//! This module handles:
//! - The transport contract and the process-pipe (stdio) transport
//! - JSON-RPC 2.0 request correlation over newline-delimited JSON
//! - Per-server connection state, handshake, and automatic reconnection
//! - Tool aggregation across servers with prefixing and conflict reporting
//!
//! [`ConnectionManager`] is the entry point for hosts.

pub mod config;
pub mod connection;
pub mod correlator;
pub mod errors;
pub mod framing;
pub mod manager;
pub mod registry;
pub mod stdio;
pub mod transport;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

// Re-exports for convenience
pub use config::{load_settings, ClientSettings, ServerConfig, TransportKind};
pub use connection::ServerConnection;
pub use errors::McpError;
pub use manager::{ConnectionManager, ObserverId};
pub use registry::{RegisteredTool, ToolConflict, ToolRegistry};
pub use transport::{DefaultTransportFactory, Transport, TransportEvent, TransportFactory};
pub use types::{ConnectionState, ServerStatus, ToolDescriptor};
