//! Transport adapters: one capability interface over two wire channels.
//!
//! [`TransportAdapter`] is the closed set of transports, picked once per
//! connection from the descriptor. Everything above this module talks to a
//! [`ToolSession`] and never branches on the transport kind.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;
use crate::registry::{ServerDescriptor, TransportSpec};
use crate::rpc::RemoteTool;

mod common;
mod sse;
mod stdio;

pub use common::RpcSession;
pub use sse::SseTransport;
pub use stdio::StdioTransport;

#[cfg(test)]
pub(crate) mod test_support;

/// An open session with one backend tool server.
#[async_trait]
pub trait ToolSession: Send + Sync {
    fn server_name(&self) -> &str;

    /// Ask the backend for its tool catalog.
    async fn list_tools(&self) -> Result<Vec<RemoteTool>>;

    /// Invoke one tool by its unqualified name.
    async fn call(&self, tool: &str, arguments: Value) -> Result<Value>;

    /// Cheap liveness probe.
    async fn ping(&self) -> Result<()>;

    /// True once the underlying pipe or stream is gone.
    fn is_closed(&self) -> bool;

    /// Requests currently awaiting a response.
    fn pending_requests(&self) -> usize;

    /// Release the underlying resource. Idempotent.
    async fn close(&self) -> Result<()>;
}

/// The closed set of transports, selected from a descriptor.
#[derive(Debug, Clone)]
pub enum TransportAdapter {
    Subprocess(StdioTransport),
    Stream(SseTransport),
}

impl TransportAdapter {
    pub fn for_descriptor(descriptor: &ServerDescriptor) -> Self {
        match &descriptor.transport {
            TransportSpec::Subprocess(spec) => {
                Self::Subprocess(StdioTransport::new(&descriptor.name, spec.clone()))
            }
            TransportSpec::Stream(spec) => {
                Self::Stream(SseTransport::new(&descriptor.name, spec.clone()))
            }
        }
    }

    pub async fn open(&self) -> Result<RpcSession> {
        match self {
            Self::Subprocess(transport) => transport.open().await,
            Self::Stream(transport) => transport.open().await,
        }
    }
}

/// Opens sessions for descriptors. The connection manager's only way to
/// reach a backend, so tests can substitute scripted sessions.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, descriptor: &ServerDescriptor) -> Result<Arc<dyn ToolSession>>;
}

/// Production connector backed by the real transports.
#[derive(Debug, Clone, Copy, Default)]
pub struct TransportConnector;

#[async_trait]
impl Connector for TransportConnector {
    async fn open(&self, descriptor: &ServerDescriptor) -> Result<Arc<dyn ToolSession>> {
        let session = TransportAdapter::for_descriptor(descriptor).open().await?;
        Ok(Arc::new(session))
    }
}
