//! Tools implemented inside the hub process, under the `hub` namespace.
//!
//! Each tool is constructed via [`AgentTool::new`] and returned as
//! `Arc<dyn Tool>`. [`BuiltinToolProvider::from_settings`] registers only the
//! tools whose configuration flag is set and whose runtime capability check
//! passes; a gated-off tool is simply absent.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::config::BuiltinSettings;
use crate::connection::ConnectionManager;
use crate::error::{HubError, Result};
use crate::registry::BUILTIN_NAMESPACE;
use crate::tools::tool::{AgentTool, Tool, ToolExecutionContext};
use crate::tools::types::{ToolDescriptor, ToolParameters};

const CONVERT_OUTPUT_MAX_BYTES: usize = 65_536;
const CONVERT_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_CONVERT_FORMAT: &str = "markdown";

fn truncate_utf8(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }

    let mut cutoff = max_bytes;
    while cutoff > 0 && !s.is_char_boundary(cutoff) {
        cutoff -= 1;
    }
    s[..cutoff].to_string()
}

/// Registered built-in tools, keyed by unqualified name.
#[derive(Default)]
pub struct BuiltinToolProvider {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl BuiltinToolProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register every tool whose gate is satisfied.
    ///
    /// Fails with [`HubError::Collision`] if two tools share a name.
    pub fn from_settings(settings: &BuiltinSettings, manager: Arc<ConnectionManager>) -> Result<Self> {
        let mut provider = Self::new();

        if settings.memory {
            let store = MemoryStore::default();
            provider.register(memory_store_tool(store.clone()))?;
            provider.register(memory_recall_tool(store))?;
        }

        if settings.document_conversion {
            match find_on_path(&settings.converter_command) {
                Some(converter) => provider.register(convert_document_tool(converter))?,
                None => tracing::info!(
                    converter = %settings.converter_command,
                    "converter not found on PATH, convert_document disabled"
                ),
            }
        }

        if settings.server_status {
            provider.register(server_status_tool(manager))?;
        }

        tracing::debug!(tools = provider.len(), "built-in tools registered");
        Ok(provider)
    }

    /// Add one tool; a second tool with the same name is rejected.
    pub fn register(&mut self, tool: Arc<dyn Tool>) -> Result<()> {
        let name = tool.name().to_string();
        if name.is_empty() || name.contains('.') {
            return Err(HubError::Validation(format!(
                "built-in tool name '{name}' must be non-empty and contain no '.'"
            )));
        }
        if self.tools.contains_key(&name) {
            return Err(HubError::Collision(format!(
                "built-in tool '{BUILTIN_NAMESPACE}.{name}' registered twice"
            )));
        }
        self.tools.insert(name, tool);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// Catalog entries for every registered tool.
    pub fn descriptors(&self) -> Vec<ToolDescriptor> {
        self.tools
            .values()
            .map(|tool| {
                ToolDescriptor::new(
                    BUILTIN_NAMESPACE,
                    tool.name(),
                    tool.description(),
                    tool.parameters().schema.clone(),
                )
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl std::fmt::Debug for BuiltinToolProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuiltinToolProvider")
            .field("tools", &self.tools.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Process-local key/value memory shared by the memory tools.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    entries: Arc<RwLock<BTreeMap<String, serde_json::Value>>>,
}

impl MemoryStore {
    fn insert(&self, key: String, value: serde_json::Value) -> Option<serde_json::Value> {
        self.entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key, value)
    }

    fn get(&self, key: &str) -> Option<serde_json::Value> {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
    }

    fn snapshot(&self) -> BTreeMap<String, serde_json::Value> {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

/// Create the `memory_store` tool.
pub fn memory_store_tool(store: MemoryStore) -> Arc<dyn Tool> {
    Arc::new(AgentTool::new(
        "memory_store",
        "Remember a JSON value under a key for later recall",
        ToolParameters::object()
            .string("key", "Key to store the value under", true)
            .any("value", "Any JSON value", true)
            .build(),
        move |args, _ctx: ToolExecutionContext| {
            let store = store.clone();
            async move {
                let key = args.get_str("key")?;
                if key.trim().is_empty() {
                    return Err(HubError::InvalidArgument("key must not be empty".into()));
                }
                let value = args.get_value("value")?.clone();
                let replaced = store.insert(key.to_string(), value).is_some();
                Ok(serde_json::json!({ "key": key, "replaced": replaced }))
            }
        },
    ))
}

/// Create the `memory_recall` tool. Without a key, returns every entry.
pub fn memory_recall_tool(store: MemoryStore) -> Arc<dyn Tool> {
    Arc::new(AgentTool::new(
        "memory_recall",
        "Recall a remembered value, or every entry when no key is given",
        ToolParameters::object()
            .string("key", "Key to look up", false)
            .build(),
        move |args, _ctx: ToolExecutionContext| {
            let store = store.clone();
            async move {
                match args.get_str_opt("key") {
                    Some(key) => {
                        let value = store.get(key);
                        Ok(serde_json::json!({
                            "key": key,
                            "found": value.is_some(),
                            "value": value,
                        }))
                    }
                    None => Ok(serde_json::json!({ "entries": store.snapshot() })),
                }
            }
        },
    ))
}

/// Create the `convert_document` tool around an already-located converter.
///
/// Runs `<converter> <path> -t <format>`, bounded by the smaller of 60s and
/// the caller's remaining deadline. Output beyond 64 KiB is truncated.
pub fn convert_document_tool(converter: PathBuf) -> Arc<dyn Tool> {
    Arc::new(AgentTool::new(
        "convert_document",
        "Convert a local document to text with the configured converter",
        ToolParameters::object()
            .string("path", "Path to the document", true)
            .string("format", "Target format (default: markdown)", false)
            .build(),
        move |args, ctx: ToolExecutionContext| {
            let converter = converter.clone();
            async move {
                let path = args.get_str("path")?;
                let format = args.get_str_opt("format").unwrap_or(DEFAULT_CONVERT_FORMAT);
                if !Path::new(path).is_file() {
                    return Err(HubError::InvalidArgument(format!("{path}: not a readable file")));
                }

                let budget = CONVERT_TIMEOUT.min(ctx.remaining());
                let result = tokio::time::timeout(
                    budget,
                    tokio::process::Command::new(&converter)
                        .arg(path)
                        .arg("-t")
                        .arg(format)
                        .kill_on_drop(true)
                        .output(),
                )
                .await;

                let output = match result {
                    Ok(Ok(output)) => output,
                    Ok(Err(e)) => {
                        return Err(HubError::ToolExecution {
                            tool_name: "convert_document".into(),
                            message: e.to_string(),
                        });
                    }
                    Err(_) => return Err(HubError::Timeout(budget.as_millis() as u64)),
                };

                if !output.status.success() {
                    let stderr = String::from_utf8_lossy(&output.stderr);
                    return Err(HubError::ToolExecution {
                        tool_name: "convert_document".into(),
                        message: format!(
                            "converter exited with {:?}: {}",
                            output.status.code(),
                            truncate_utf8(stderr.trim(), 1024)
                        ),
                    });
                }

                let stdout = String::from_utf8_lossy(&output.stdout);
                let truncated = stdout.len() > CONVERT_OUTPUT_MAX_BYTES;
                let mut content = truncate_utf8(&stdout, CONVERT_OUTPUT_MAX_BYTES);
                if truncated {
                    content.push_str("\n... (truncated)");
                }

                Ok(serde_json::json!({
                    "path": path,
                    "format": format,
                    "content": content,
                    "truncated": truncated,
                }))
            }
        },
    ))
}

/// Create the `server_status` tool: registry counts plus connection states.
pub fn server_status_tool(manager: Arc<ConnectionManager>) -> Arc<dyn Tool> {
    Arc::new(AgentTool::new(
        "server_status",
        "Report configured servers and the state of their connections",
        ToolParameters::empty(),
        move |_args, _ctx: ToolExecutionContext| {
            let manager = manager.clone();
            async move {
                let summary = manager.registry().summary()?;
                let servers: Vec<_> = manager
                    .connections()
                    .into_iter()
                    .map(|conn| {
                        serde_json::json!({
                            "name": conn.server_name,
                            "state": conn.state,
                            "tools": conn.tool_catalog.len(),
                            "consecutive_failures": conn.consecutive_failures,
                            "last_health_check_at": conn.last_health_check_at,
                        })
                    })
                    .collect();
                Ok(serde_json::json!({
                    "summary": summary,
                    "ready": manager.ready_count(),
                    "servers": servers,
                }))
            }
        },
    ))
}

/// Locate an executable by name on `PATH`, or check an explicit path.
pub fn find_on_path(command: &str) -> Option<PathBuf> {
    if command.is_empty() {
        return None;
    }
    if command.contains(std::path::MAIN_SEPARATOR) {
        let path = PathBuf::from(command);
        return path.is_file().then_some(path);
    }
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(command))
        .find(|candidate| candidate.is_file())
}
