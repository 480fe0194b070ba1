use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::common::FrameSink;
use super::{Connector, ToolSession};
use crate::error::{HubError, Result};
use crate::registry::ServerDescriptor;
use crate::rpc::{RemoteTool, RpcRequest, RpcResponse};

enum Scripted {
    Result(Value),
    Response(RpcResponse),
    Deferred,
}

/// Frame sink that answers from a script; an exhausted script defers.
pub(crate) struct ScriptedSink {
    script: Mutex<VecDeque<Scripted>>,
    sent: Arc<Mutex<Vec<RpcRequest>>>,
    close_calls: Arc<AtomicUsize>,
}

type SinkHandles = (
    ScriptedSink,
    Arc<Mutex<Vec<RpcRequest>>>,
    Arc<AtomicUsize>,
);

impl ScriptedSink {
    /// `Some(result)` answers inline with a success; `None` defers.
    pub(crate) fn new(results: Vec<Option<Value>>) -> SinkHandles {
        Self::build(
            results
                .into_iter()
                .map(|r| r.map_or(Scripted::Deferred, Scripted::Result))
                .collect(),
        )
    }

    pub(crate) fn with_responses(responses: Vec<Option<RpcResponse>>) -> SinkHandles {
        Self::build(
            responses
                .into_iter()
                .map(|r| r.map_or(Scripted::Deferred, Scripted::Response))
                .collect(),
        )
    }

    fn build(script: VecDeque<Scripted>) -> SinkHandles {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let close_calls = Arc::new(AtomicUsize::new(0));
        (
            Self {
                script: Mutex::new(script),
                sent: Arc::clone(&sent),
                close_calls: Arc::clone(&close_calls),
            },
            sent,
            close_calls,
        )
    }
}

#[async_trait]
impl FrameSink for ScriptedSink {
    async fn send(&self, request: &RpcRequest) -> Result<Option<RpcResponse>> {
        self.sent.lock().unwrap().push(request.clone());
        let next = self.script.lock().unwrap().pop_front();
        Ok(match next {
            Some(Scripted::Result(value)) => Some(RpcResponse::success(request.id.clone(), value)),
            Some(Scripted::Response(response)) => Some(response),
            Some(Scripted::Deferred) | None => None,
        })
    }

    async fn close(&self) -> Result<()> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// In-memory session whose tools echo `{"tool", "arguments"}`.
pub(crate) struct MockSession {
    server: String,
    tools: Vec<RemoteTool>,
    ping_ok: AtomicBool,
    closed: AtomicBool,
    call_delay: Mutex<Option<Duration>>,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    close_calls: AtomicUsize,
}

impl MockSession {
    pub(crate) fn new(server: &str, tools: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            server: server.to_string(),
            tools: tools
                .iter()
                .map(|name| RemoteTool {
                    name: name.to_string(),
                    description: format!("{name} tool"),
                    parameters_schema: json!({"type": "object"}),
                })
                .collect(),
            ping_ok: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            call_delay: Mutex::new(None),
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            close_calls: AtomicUsize::new(0),
        })
    }

    pub(crate) fn set_ping_ok(&self, ok: bool) {
        self.ping_ok.store(ok, Ordering::SeqCst);
    }

    /// Simulate the pipe dying underneath the session.
    pub(crate) fn set_closed(&self, closed: bool) {
        self.closed.store(closed, Ordering::SeqCst);
    }

    pub(crate) fn set_call_delay(&self, delay: Duration) {
        *self.call_delay.lock().unwrap() = Some(delay);
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ToolSession for MockSession {
    fn server_name(&self) -> &str {
        &self.server
    }

    async fn list_tools(&self) -> Result<Vec<RemoteTool>> {
        if self.is_closed() {
            return Err(HubError::transport(&self.server, "mock closed"));
        }
        Ok(self.tools.clone())
    }

    async fn call(&self, tool: &str, arguments: Value) -> Result<Value> {
        if self.is_closed() {
            return Err(HubError::transport(&self.server, "mock closed"));
        }
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let delay = *self.call_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        if tool == "fail" {
            return Err(HubError::Remote {
                kind: "tool_error".into(),
                message: "scripted failure".into(),
            });
        }
        Ok(json!({ "tool": tool, "arguments": arguments }))
    }

    async fn ping(&self) -> Result<()> {
        if self.is_closed() || !self.ping_ok.load(Ordering::SeqCst) {
            return Err(HubError::transport(&self.server, "mock ping failed"));
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn pending_requests(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<()> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Connector handing out [`MockSession`]s, with per-server failure switches.
#[derive(Default)]
pub(crate) struct MockConnector {
    tools: Mutex<HashMap<String, Vec<String>>>,
    failing: Mutex<HashSet<String>>,
    opens: Mutex<HashMap<String, usize>>,
    sessions: Mutex<HashMap<String, Arc<MockSession>>>,
}

impl MockConnector {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn set_tools(&self, server: &str, tools: &[&str]) {
        self.tools.lock().unwrap().insert(
            server.to_string(),
            tools.iter().map(|t| t.to_string()).collect(),
        );
    }

    pub(crate) fn set_failing(&self, server: &str, failing: bool) {
        let mut set = self.failing.lock().unwrap();
        if failing {
            set.insert(server.to_string());
        } else {
            set.remove(server);
        }
    }

    pub(crate) fn open_count(&self, server: &str) -> usize {
        self.opens.lock().unwrap().get(server).copied().unwrap_or(0)
    }

    /// Most recent session opened for `server`.
    pub(crate) fn session(&self, server: &str) -> Option<Arc<MockSession>> {
        self.sessions.lock().unwrap().get(server).cloned()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn open(&self, descriptor: &ServerDescriptor) -> Result<Arc<dyn ToolSession>> {
        let name = descriptor.name.clone();
        *self.opens.lock().unwrap().entry(name.clone()).or_default() += 1;
        if self.failing.lock().unwrap().contains(&name) {
            return Err(HubError::transport(&name, "mock connect refused"));
        }
        let tools = self
            .tools
            .lock()
            .unwrap()
            .get(&name)
            .cloned()
            .unwrap_or_else(|| vec!["echo".to_string()]);
        let tool_refs: Vec<&str> = tools.iter().map(String::as_str).collect();
        let session = MockSession::new(&name, &tool_refs);
        self.sessions
            .lock()
            .unwrap()
            .insert(name, Arc::clone(&session));
        Ok(session)
    }
}
