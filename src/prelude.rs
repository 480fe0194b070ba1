//! Convenience re-exports for common use.

pub use crate::client_config::{ClientKind, ConfigGenerator};
pub use crate::config::HubConfig;
pub use crate::connection::{Connection, ConnectionState};
pub use crate::error::{ErrorKind, HubError, Result};
pub use crate::hub::{HealthReport, HealthStatus, Hub, ServerStatus};
pub use crate::registry::{ServerDescriptor, ServerRegistry, TransportKind};
pub use crate::tools::{
    AgentTool, Tool, ToolArguments, ToolCallRequest, ToolCallResult, ToolDescriptor,
    ToolParameters,
};
