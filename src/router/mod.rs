//! Routes qualified tool calls to built-ins or backend connections.
//!
//! The router never branches on transport kind; it only asks the
//! [`ConnectionManager`] for a permit on the owning server.

pub mod catalog;

use std::sync::Arc;

use serde_json::Value;
use tokio::time::Instant;

pub use catalog::CatalogIndex;

use crate::connection::ConnectionManager;
use crate::error::{HubError, Result};
use crate::registry::BUILTIN_NAMESPACE;
use crate::tools::types::split_qualified;
use crate::tools::{
    BuiltinToolProvider, ToolArguments, ToolCallRequest, ToolCallResult, ToolDescriptor,
    ToolExecutionContext,
};
use crate::util::timeout::with_deadline;

/// Presents one flat catalog and dispatches calls against it.
pub struct ToolRouter {
    manager: Arc<ConnectionManager>,
    catalog: Arc<CatalogIndex>,
    builtins: Arc<BuiltinToolProvider>,
}

impl ToolRouter {
    /// Publishes the built-in descriptors into `catalog`.
    pub fn new(
        manager: Arc<ConnectionManager>,
        catalog: Arc<CatalogIndex>,
        builtins: Arc<BuiltinToolProvider>,
    ) -> Self {
        catalog.set_builtins(builtins.descriptors());
        Self {
            manager,
            catalog,
            builtins,
        }
    }

    pub fn catalog(&self) -> Arc<Vec<ToolDescriptor>> {
        self.catalog.snapshot()
    }

    /// Dispatch one call. Every failure is folded into the result.
    pub async fn call(&self, request: ToolCallRequest) -> ToolCallResult {
        let started = Instant::now();
        match self.dispatch(&request).await {
            Ok(payload) => {
                tracing::debug!(tool = %request.qualified_name, "tool call succeeded");
                ToolCallResult::ok(request.qualified_name, payload, started.elapsed())
            }
            Err(err) => {
                tracing::debug!(tool = %request.qualified_name, error = %err, "tool call failed");
                ToolCallResult::failed(request.qualified_name, &err, started.elapsed())
            }
        }
    }

    async fn dispatch(&self, request: &ToolCallRequest) -> Result<Value> {
        let (server, tool) = split_qualified(&request.qualified_name)?;

        if server == BUILTIN_NAMESPACE {
            let builtin = self
                .builtins
                .get(tool)
                .ok_or_else(|| unavailable(&request.qualified_name))?;
            let ctx = ToolExecutionContext::new(&request.qualified_name, request.deadline);
            let args = ToolArguments::new(request.arguments.clone());
            return with_deadline(request.deadline, builtin.execute(&args, &ctx)).await;
        }

        let permit = self
            .manager
            .acquire(server)
            .filter(|permit| permit.has_tool(tool))
            .ok_or_else(|| unavailable(&request.qualified_name))?;
        with_deadline(
            request.deadline,
            permit.session().call(tool, request.arguments.clone()),
        )
        .await
    }
}

fn unavailable(qualified_name: &str) -> HubError {
    HubError::Unavailable(format!("tool '{qualified_name}' is not available"))
}

impl std::fmt::Debug for ToolRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRouter")
            .field("catalog", &self.catalog)
            .field("builtins", &self.builtins)
            .finish()
    }
}
