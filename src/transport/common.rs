use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::oneshot;

use super::ToolSession;
use crate::error::{HubError, Result};
use crate::registry::TransportKind;
use crate::rpc::{self, RemoteTool, RpcRequest, RpcResponse};

/// Outbound half of a session: how one encoded request reaches the backend.
///
/// A sink may answer inline (the stream side channel sometimes does); `None`
/// means the response will arrive through [`PendingRequests::complete`].
#[async_trait]
pub(crate) trait FrameSink: Send + Sync {
    async fn send(&self, request: &RpcRequest) -> Result<Option<RpcResponse>>;
    async fn close(&self) -> Result<()>;
}

#[derive(Default)]
struct PendingState {
    waiters: HashMap<u64, oneshot::Sender<RpcResponse>>,
    closed: Option<String>,
}

/// Correlation table routing responses back to their waiting callers.
#[derive(Default)]
pub(crate) struct PendingRequests {
    state: Mutex<PendingState>,
}

impl PendingRequests {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn state(&self) -> MutexGuard<'_, PendingState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Reserve a slot for `id`. The slot is released when the guard drops,
    /// so a cancelled caller never leaves an entry behind.
    pub(crate) fn register(
        self: &Arc<Self>,
        id: u64,
    ) -> std::result::Result<(PendingGuard, oneshot::Receiver<RpcResponse>), String> {
        let (tx, rx) = oneshot::channel();
        let mut state = self.state();
        if let Some(reason) = &state.closed {
            return Err(reason.clone());
        }
        state.waiters.insert(id, tx);
        Ok((
            PendingGuard {
                table: Arc::clone(self),
                id,
            },
            rx,
        ))
    }

    /// Deliver a response. Returns false when nobody is waiting for it.
    pub(crate) fn complete(&self, response: RpcResponse) -> bool {
        let Some(id) = response.id.as_u64() else {
            return false;
        };
        let waiter = self.state().waiters.remove(&id);
        match waiter {
            Some(tx) => tx.send(response).is_ok(),
            None => false,
        }
    }

    /// Mark the channel dead and wake every waiter with a closed error.
    pub(crate) fn fail_all(&self, reason: impl Into<String>) {
        let mut state = self.state();
        if state.closed.is_none() {
            state.closed = Some(reason.into());
        }
        state.waiters.clear();
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state().closed.is_some()
    }

    pub(crate) fn close_reason(&self) -> Option<String> {
        self.state().closed.clone()
    }

    pub(crate) fn len(&self) -> usize {
        self.state().waiters.len()
    }
}

pub(crate) struct PendingGuard {
    table: Arc<PendingRequests>,
    id: u64,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.table.state().waiters.remove(&self.id);
    }
}

/// Transport-agnostic RPC session: id allocation, correlation and envelope
/// decoding on top of one [`FrameSink`].
pub struct RpcSession {
    server: String,
    kind: TransportKind,
    next_id: AtomicU64,
    pending: Arc<PendingRequests>,
    sink: Box<dyn FrameSink>,
}

impl std::fmt::Debug for RpcSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcSession")
            .field("server", &self.server)
            .field("kind", &self.kind)
            .field("pending", &self.pending.len())
            .field("closed", &self.pending.is_closed())
            .finish()
    }
}

impl RpcSession {
    pub(crate) fn new(
        server: impl Into<String>,
        kind: TransportKind,
        pending: Arc<PendingRequests>,
        sink: Box<dyn FrameSink>,
    ) -> Self {
        Self {
            server: server.into(),
            kind,
            next_id: AtomicU64::new(1),
            pending,
            sink,
        }
    }

    pub fn transport_kind(&self) -> TransportKind {
        self.kind
    }

    /// Send the request built for the next id and wait for its response.
    async fn request(&self, build: impl FnOnce(u64) -> RpcRequest + Send) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = build(id);
        let (guard, rx) = self
            .pending
            .register(id)
            .map_err(|reason| HubError::transport(&self.server, reason))?;

        tracing::debug!(server = %self.server, id, method = %request.method, "sending request");
        if let Some(response) = self.sink.send(&request).await? {
            drop(guard);
            return response.into_result();
        }

        let response = rx.await.map_err(|_| {
            let reason = self
                .pending
                .close_reason()
                .unwrap_or_else(|| "connection closed before response".into());
            HubError::transport(&self.server, reason)
        })?;
        drop(guard);
        response.into_result()
    }
}

#[async_trait]
impl ToolSession for RpcSession {
    fn server_name(&self) -> &str {
        &self.server
    }

    async fn list_tools(&self) -> Result<Vec<RemoteTool>> {
        let result = self.request(RpcRequest::list_tools).await?;
        rpc::parse_tool_listing(result)
    }

    async fn call(&self, tool: &str, arguments: Value) -> Result<Value> {
        self.request(|id| RpcRequest::call_tool(id, tool, arguments))
            .await
    }

    async fn ping(&self) -> Result<()> {
        match self.request(RpcRequest::ping).await {
            Ok(_) | Err(HubError::Remote { .. }) => Ok(()),
            Err(err) => Err(err),
        }
    }

    fn is_closed(&self) -> bool {
        self.pending.is_closed()
    }

    fn pending_requests(&self) -> usize {
        self.pending.len()
    }

    async fn close(&self) -> Result<()> {
        let result = self.sink.close().await;
        self.pending.fail_all("session closed");
        result
    }
}
