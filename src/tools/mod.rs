//! Tool definitions, call types, and the built-in tool provider.

pub mod arguments;
pub mod builtin;
pub mod tool;
pub mod types;

pub use arguments::ToolArguments;
pub use builtin::BuiltinToolProvider;
pub use tool::{AgentTool, Tool, ToolExecutionContext};
pub use types::{
    ToolCallError, ToolCallRequest, ToolCallResult, ToolDescriptor, ToolParameters,
};
