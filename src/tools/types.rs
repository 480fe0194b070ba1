//! Tool-related types: parameter schemas, catalog entries, calls, results.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::error::{ErrorKind, HubError};

/// JSON Schema-based parameter definition for a tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolParameters {
    /// JSON Schema object describing the parameters.
    pub schema: serde_json::Value,
}

impl ToolParameters {
    /// Create an empty parameter schema (no parameters).
    pub fn empty() -> Self {
        Self {
            schema: serde_json::json!({
                "type": "object",
                "properties": {},
                "required": [],
            }),
        }
    }

    /// Builder: create an object schema with properties.
    pub fn object() -> ParameterBuilder {
        ParameterBuilder {
            properties: serde_json::Map::new(),
            required: Vec::new(),
        }
    }
}

/// Builder for constructing tool parameter schemas.
pub struct ParameterBuilder {
    properties: serde_json::Map<String, serde_json::Value>,
    required: Vec<String>,
}

impl ParameterBuilder {
    fn property(mut self, name: String, schema: serde_json::Value, required: bool) -> Self {
        self.properties.insert(name.clone(), schema);
        if required {
            self.required.push(name);
        }
        self
    }

    /// Add a string property.
    pub fn string(self, name: impl Into<String>, description: impl Into<String>, required: bool) -> Self {
        self.property(
            name.into(),
            serde_json::json!({
                "type": "string",
                "description": description.into(),
            }),
            required,
        )
    }

    /// Add a property accepting any JSON value.
    pub fn any(self, name: impl Into<String>, description: impl Into<String>, required: bool) -> Self {
        self.property(
            name.into(),
            serde_json::json!({ "description": description.into() }),
            required,
        )
    }

    /// Add an enum (string) property.
    pub fn string_enum(
        self,
        name: impl Into<String>,
        description: impl Into<String>,
        values: &[&str],
        required: bool,
    ) -> Self {
        self.property(
            name.into(),
            serde_json::json!({
                "type": "string",
                "description": description.into(),
                "enum": values,
            }),
            required,
        )
    }

    /// Build into ToolParameters.
    pub fn build(self) -> ToolParameters {
        ToolParameters {
            schema: serde_json::json!({
                "type": "object",
                "properties": self.properties,
                "required": self.required,
            }),
        }
    }
}

/// One callable capability in the merged catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    /// `server_name.tool_name`.
    pub qualified_name: String,
    pub name: String,
    pub description: String,
    pub parameters_schema: serde_json::Value,
    pub owning_server: String,
}

impl ToolDescriptor {
    pub fn new(
        owning_server: &str,
        name: &str,
        description: impl Into<String>,
        parameters_schema: serde_json::Value,
    ) -> Self {
        Self {
            qualified_name: qualify(owning_server, name),
            name: name.to_string(),
            description: description.into(),
            parameters_schema,
            owning_server: owning_server.to_string(),
        }
    }
}

/// Join a server namespace and a tool name.
pub fn qualify(server: &str, tool: &str) -> String {
    format!("{server}.{tool}")
}

/// Split a qualified name at its first `.` into `(server, tool)`.
pub fn split_qualified(qualified_name: &str) -> Result<(&str, &str), HubError> {
    match qualified_name.split_once('.') {
        Some((server, tool)) if !server.is_empty() && !tool.is_empty() => Ok((server, tool)),
        _ => Err(HubError::InvalidArgument(format!(
            "tool name '{qualified_name}' must be qualified as 'server.tool'"
        ))),
    }
}

/// A single call issued by an agent.
#[derive(Debug, Clone)]
pub struct ToolCallRequest {
    pub qualified_name: String,
    pub arguments: serde_json::Value,
    pub deadline: Instant,
}

impl ToolCallRequest {
    /// Request whose deadline is `timeout` from now.
    pub fn new(
        qualified_name: impl Into<String>,
        arguments: serde_json::Value,
        timeout: Duration,
    ) -> Self {
        Self::with_deadline(qualified_name, arguments, Instant::now() + timeout)
    }

    pub fn with_deadline(
        qualified_name: impl Into<String>,
        arguments: serde_json::Value,
        deadline: Instant,
    ) -> Self {
        Self {
            qualified_name: qualified_name.into(),
            arguments,
            deadline,
        }
    }
}

/// Structured failure relayed to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCallError {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&HubError> for ToolCallError {
    fn from(err: &HubError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Outcome of one call: a payload or a structured error, never both.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallResult {
    pub qualified_name: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ToolCallError>,
    pub elapsed_ms: u64,
}

impl ToolCallResult {
    pub fn ok(qualified_name: impl Into<String>, payload: serde_json::Value, elapsed: Duration) -> Self {
        Self {
            qualified_name: qualified_name.into(),
            success: true,
            payload: Some(payload),
            error: None,
            elapsed_ms: elapsed.as_millis() as u64,
        }
    }

    pub fn failed(qualified_name: impl Into<String>, err: &HubError, elapsed: Duration) -> Self {
        Self {
            qualified_name: qualified_name.into(),
            success: false,
            payload: None,
            error: Some(ToolCallError::from(err)),
            elapsed_ms: elapsed.as_millis() as u64,
        }
    }

    /// Error kind, if the call failed.
    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }

    pub fn into_result(self) -> Result<serde_json::Value, ToolCallError> {
        match (self.payload, self.error) {
            (_, Some(error)) => Err(error),
            (Some(payload), None) => Ok(payload),
            (None, None) => Ok(serde_json::Value::Null),
        }
    }
}
