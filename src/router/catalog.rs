//! Merged tool catalog, rebuilt on connection changes rather than on reads.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use crate::connection::{ConnectionChange, ConnectionObserver};
use crate::rpc::RemoteTool;
use crate::tools::ToolDescriptor;

#[derive(Default)]
struct CatalogState {
    servers: BTreeMap<String, Vec<ToolDescriptor>>,
    builtins: Vec<ToolDescriptor>,
    merged: Arc<Vec<ToolDescriptor>>,
}

impl CatalogState {
    fn rebuild(&mut self) {
        let mut merged: Vec<ToolDescriptor> = self
            .builtins
            .iter()
            .chain(self.servers.values().flatten())
            .cloned()
            .collect();
        merged.sort_by(|a, b| a.qualified_name.cmp(&b.qualified_name));
        self.merged = Arc::new(merged);
    }
}

/// Single mutation point for the merged catalog. Reads clone an `Arc`.
#[derive(Default)]
pub struct CatalogIndex {
    state: RwLock<CatalogState>,
}

impl CatalogIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current snapshot, sorted by qualified name.
    pub fn snapshot(&self) -> Arc<Vec<ToolDescriptor>> {
        Arc::clone(&self.state.read().unwrap_or_else(|e| e.into_inner()).merged)
    }

    pub fn set_builtins(&self, builtins: Vec<ToolDescriptor>) {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        state.builtins = builtins;
        state.rebuild();
    }

    /// Servers currently contributing tools.
    pub fn servers(&self) -> Vec<String> {
        self.state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .servers
            .keys()
            .cloned()
            .collect()
    }

    fn server_ready(&self, server: &str, tools: &[RemoteTool]) {
        let descriptors = tools
            .iter()
            .map(|tool| {
                ToolDescriptor::new(
                    server,
                    &tool.name,
                    tool.description.clone(),
                    tool.parameters_schema.clone(),
                )
            })
            .collect();
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        state.servers.insert(server.to_string(), descriptors);
        state.rebuild();
    }

    fn server_gone(&self, server: &str) {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        if state.servers.remove(server).is_some() {
            state.rebuild();
        }
    }
}

impl ConnectionObserver for CatalogIndex {
    fn connection_changed(&self, change: ConnectionChange) {
        match change {
            ConnectionChange::Ready { server, tools } => {
                tracing::debug!(server = %server, tools = tools.len(), "catalog entries added");
                self.server_ready(&server, &tools);
            }
            ConnectionChange::Unavailable { server } | ConnectionChange::Removed { server } => {
                tracing::debug!(server = %server, "catalog entries withdrawn");
                self.server_gone(&server);
            }
        }
    }
}

impl std::fmt::Debug for CatalogIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CatalogIndex")
            .field("tools", &self.snapshot().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn remote(name: &str) -> RemoteTool {
        RemoteTool {
            name: name.to_string(),
            description: format!("{name} tool"),
            parameters_schema: json!({"type": "object"}),
        }
    }

    fn names(index: &CatalogIndex) -> Vec<String> {
        index
            .snapshot()
            .iter()
            .map(|d| d.qualified_name.clone())
            .collect()
    }

    #[test]
    fn ready_servers_and_builtins_merge_sorted() {
        let index = CatalogIndex::new();
        index.set_builtins(vec![ToolDescriptor::new("hub", "memory_store", "", json!({}))]);
        index.connection_changed(ConnectionChange::Ready {
            server: "search".into(),
            tools: vec![remote("query"), remote("index")],
        });
        index.connection_changed(ConnectionChange::Ready {
            server: "files".into(),
            tools: vec![remote("read")],
        });

        assert_eq!(
            names(&index),
            vec!["files.read", "hub.memory_store", "search.index", "search.query"]
        );
        let query = index
            .snapshot()
            .iter()
            .find(|d| d.qualified_name == "search.query")
            .cloned()
            .unwrap();
        assert_eq!(query.owning_server, "search");
        assert_eq!(query.name, "query");
        assert_eq!(query.description, "query tool");
    }

    #[test]
    fn unavailable_server_drops_exactly_its_entries() {
        let index = CatalogIndex::new();
        for server in ["a", "b"] {
            index.connection_changed(ConnectionChange::Ready {
                server: server.into(),
                tools: vec![remote("one"), remote("two")],
            });
        }
        index.connection_changed(ConnectionChange::Unavailable { server: "a".into() });
        assert_eq!(names(&index), vec!["b.one", "b.two"]);

        index.connection_changed(ConnectionChange::Removed { server: "b".into() });
        assert!(index.snapshot().is_empty());
        assert!(index.servers().is_empty());
    }

    #[test]
    fn snapshots_are_stable_across_later_changes() {
        let index = CatalogIndex::new();
        index.connection_changed(ConnectionChange::Ready {
            server: "a".into(),
            tools: vec![remote("one")],
        });
        let before = index.snapshot();
        index.connection_changed(ConnectionChange::Ready {
            server: "a".into(),
            tools: vec![remote("one"), remote("two")],
        });
        assert_eq!(before.len(), 1);
        assert_eq!(index.snapshot().len(), 2);
    }
}
