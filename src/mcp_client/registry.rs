//! Tool registry: aggregates tool descriptors across all connected servers.
//!
//! The registry is a derived view: the manager rebuilds it from scratch
//! whenever any server's tool list changes, feeding servers in registration
//! order. Each tool's visible name is its original name with the server's
//! prefix (if any) prepended.
//!
//! Visible names never collide. When two tools resolve to the same visible
//! name the first one registered keeps it and the later one is recorded as a
//! [`ToolConflict`] instead of overwriting the entry.

use std::collections::{BTreeSet, HashMap};

use serde::Serialize;

use super::errors::McpError;
use super::types::ToolDescriptor;

// ─── Entries ─────────────────────────────────────────────────────────────────

/// A tool as exposed to the host, with its dispatch back-reference.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisteredTool {
    pub visible_name: String,
    pub server_id: String,
    pub original_name: String,
    /// The descriptor exactly as the server reported it.
    pub descriptor: ToolDescriptor,
}

/// A tool left out of the registry because its visible name was taken.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolConflict {
    pub visible_name: String,
    pub server_id: String,
    pub original_name: String,
    /// Server whose tool kept the name.
    pub existing_server: String,
}

impl From<&ToolConflict> for McpError {
    fn from(c: &ToolConflict) -> Self {
        McpError::ToolNameConflict {
            visible_name: c.visible_name.clone(),
            server: c.server_id.clone(),
            original_name: c.original_name.clone(),
            existing_server: c.existing_server.clone(),
        }
    }
}

/// Visible name for `name` under an optional prefix.
pub fn visible_name(prefix: Option<&str>, name: &str) -> String {
    match prefix {
        Some(prefix) => format!("{prefix}{name}"),
        None => name.to_string(),
    }
}

// ─── ToolRegistry ────────────────────────────────────────────────────────────

/// Conflict-free mapping from visible tool name to originating server.
#[derive(Debug, Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, RegisteredTool>,
    /// Visible names in registration order.
    order: Vec<String>,
    conflicts: Vec<ToolConflict>,
}

impl ToolRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register every tool of one server. Tools whose visible name is
    /// already taken are recorded as conflicts.
    pub fn register_server_tools(
        &mut self,
        server_id: &str,
        prefix: Option<&str>,
        tools: &[ToolDescriptor],
    ) {
        for tool in tools {
            let name = visible_name(prefix, &tool.name);

            if let Some(existing) = self.tools.get(&name) {
                let conflict = ToolConflict {
                    visible_name: name,
                    server_id: server_id.to_string(),
                    original_name: tool.name.clone(),
                    existing_server: existing.server_id.clone(),
                };
                tracing::warn!(error = %McpError::from(&conflict), "tool name conflict");
                self.conflicts.push(conflict);
                continue;
            }

            self.order.push(name.clone());
            self.tools.insert(
                name.clone(),
                RegisteredTool {
                    visible_name: name,
                    server_id: server_id.to_string(),
                    original_name: tool.name.clone(),
                    descriptor: tool.clone(),
                },
            );
        }
    }

    /// Look up a tool by visible name.
    pub fn get(&self, visible_name: &str) -> Option<&RegisteredTool> {
        self.tools.get(visible_name)
    }

    /// Map a visible name back to `(server_id, original_name)` for dispatch.
    pub fn resolve(&self, visible_name: &str) -> Option<(&str, &str)> {
        self.tools
            .get(visible_name)
            .map(|t| (t.server_id.as_str(), t.original_name.as_str()))
    }

    /// All registered tools, in registration order.
    pub fn all_tools(&self) -> Vec<&RegisteredTool> {
        self.order
            .iter()
            .filter_map(|name| self.tools.get(name))
            .collect()
    }

    /// Tools contributed by one server, in registration order.
    pub fn tools_for_server(&self, server_id: &str) -> Vec<&RegisteredTool> {
        self.all_tools()
            .into_iter()
            .filter(|t| t.server_id == server_id)
            .collect()
    }

    /// Tools that lost a name collision during the last rebuild.
    pub fn conflicts(&self) -> &[ToolConflict] {
        &self.conflicts
    }

    /// Servers with at least one registered tool, sorted.
    pub fn server_names(&self) -> Vec<String> {
        self.tools
            .values()
            .map(|t| t.server_id.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp_client::testing::tool;

    #[test]
    fn test_prefixing_keeps_both_tools() {
        let mut reg = ToolRegistry::new();
        reg.register_server_tools("serverA", Some("serverA_"), &[tool("search")]);
        reg.register_server_tools("serverB", Some("serverB_"), &[tool("search")]);

        assert_eq!(reg.len(), 2);
        assert!(reg.conflicts().is_empty());
        assert_eq!(reg.resolve("serverA_search"), Some(("serverA", "search")));
        assert_eq!(reg.resolve("serverB_search"), Some(("serverB", "search")));
        assert!(reg.get("search").is_none());
    }

    #[test]
    fn test_first_registered_wins_and_conflict_is_reported() {
        let mut reg = ToolRegistry::new();
        reg.register_server_tools("a", None, &[tool("search"), tool("fetch")]);
        reg.register_server_tools("b", None, &[tool("search")]);

        assert_eq!(reg.len(), 2);
        assert_eq!(reg.resolve("search"), Some(("a", "search")));

        let conflicts = reg.conflicts();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(
            conflicts[0],
            ToolConflict {
                visible_name: "search".into(),
                server_id: "b".into(),
                original_name: "search".into(),
                existing_server: "a".into(),
            }
        );
    }

    #[test]
    fn test_collision_after_prefixing_is_reported() {
        let mut reg = ToolRegistry::new();
        reg.register_server_tools("a", Some("x_"), &[tool("search")]);
        reg.register_server_tools("b", None, &[tool("x_search")]);

        assert_eq!(reg.resolve("x_search"), Some(("a", "search")));
        assert_eq!(reg.conflicts()[0].original_name, "x_search");

        let err = McpError::from(&reg.conflicts()[0]);
        assert!(err.to_string().contains("already registered by server 'a'"));
    }

    #[test]
    fn test_descriptor_is_kept_verbatim() {
        let mut reg = ToolRegistry::new();
        let original = tool("read_file");
        reg.register_server_tools("fs", Some("fs_"), std::slice::from_ref(&original));

        let entry = reg.get("fs_read_file").unwrap();
        assert_eq!(entry.descriptor, original);
        assert_eq!(entry.original_name, "read_file");
    }

    #[test]
    fn test_order_and_per_server_views() {
        let mut reg = ToolRegistry::new();
        reg.register_server_tools("b", None, &[tool("z"), tool("y")]);
        reg.register_server_tools("a", None, &[tool("x")]);

        let names: Vec<&str> = reg.all_tools().iter().map(|t| t.visible_name.as_str()).collect();
        assert_eq!(names, vec!["z", "y", "x"]);
        assert_eq!(reg.tools_for_server("b").len(), 2);
        assert_eq!(reg.server_names(), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_empty_registry() {
        let reg = ToolRegistry::default();
        assert!(reg.is_empty());
        assert!(reg.resolve("anything").is_none());
        assert!(reg.server_names().is_empty());
    }
}
