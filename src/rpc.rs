//! Structured RPC envelope shared by both transports.
//!
//! Requests are `{method, params, id}`; responses are `{id, result}` or
//! `{id, error: {kind, message}}`. The subprocess transport frames one
//! envelope per line, the stream transport one envelope per event.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::HubError;

pub const METHOD_LIST_TOOLS: &str = "tools/list";
pub const METHOD_CALL_TOOL: &str = "tools/call";
pub const METHOD_PING: &str = "ping";

/// Correlation id. The hub always sends numbers but accepts strings back.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RpcId {
    Number(u64),
    String(String),
}

impl RpcId {
    /// Numeric value, parsing string ids that carry a number.
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Self::Number(n) => Some(*n),
            Self::String(s) => s.parse().ok(),
        }
    }
}

impl From<u64> for RpcId {
    fn from(value: u64) -> Self {
        Self::Number(value)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    pub method: String,
    #[serde(default = "empty_object")]
    pub params: Value,
    pub id: RpcId,
}

impl RpcRequest {
    pub fn new(id: u64, method: impl Into<String>, params: Value) -> Self {
        Self {
            method: method.into(),
            params,
            id: RpcId::Number(id),
        }
    }

    pub fn list_tools(id: u64) -> Self {
        Self::new(id, METHOD_LIST_TOOLS, empty_object())
    }

    pub fn call_tool(id: u64, name: &str, arguments: Value) -> Self {
        Self::new(
            id,
            METHOD_CALL_TOOL,
            serde_json::json!({ "name": name, "arguments": arguments }),
        )
    }

    pub fn ping(id: u64) -> Self {
        Self::new(id, METHOD_PING, empty_object())
    }

    /// One line of the subprocess framing, newline included.
    pub fn to_line(&self) -> Result<String, HubError> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}

/// Error body of a failed response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcError {
    pub kind: String,
    pub message: String,
}

impl RpcError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    pub id: RpcId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl RpcResponse {
    pub fn success(id: RpcId, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: RpcId, error: RpcError) -> Self {
        Self {
            id,
            result: None,
            error: Some(error),
        }
    }

    /// Parse a frame, returning `None` for anything that is not a response
    /// envelope (log lines, notifications, blank lines).
    pub fn parse_frame(frame: &str) -> Option<Self> {
        let trimmed = frame.trim();
        if !trimmed.starts_with('{') {
            return None;
        }
        serde_json::from_str(trimmed).ok()
    }

    /// Collapse the envelope into the result payload or a `Remote` error.
    pub fn into_result(self) -> Result<Value, HubError> {
        match (self.result, self.error) {
            (_, Some(error)) => Err(HubError::Remote {
                kind: error.kind,
                message: error.message,
            }),
            (Some(result), None) => Ok(result),
            (None, None) => Err(HubError::Remote {
                kind: "invalid_response".into(),
                message: "response carried neither result nor error".into(),
            }),
        }
    }
}

/// One tool as a backend reports it in `tools/list`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteTool {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "empty_object", alias = "inputSchema")]
    pub parameters_schema: Value,
}

#[derive(Debug, Deserialize)]
struct ToolListing {
    #[serde(default)]
    tools: Vec<RemoteTool>,
}

/// Decode a `tools/list` result payload.
pub fn parse_tool_listing(result: Value) -> Result<Vec<RemoteTool>, HubError> {
    let listing: ToolListing = serde_json::from_value(result).map_err(|e| HubError::Remote {
        kind: "invalid_response".into(),
        message: format!("malformed tools/list result: {e}"),
    })?;
    Ok(listing.tools)
}

fn empty_object() -> Value {
    Value::Object(serde_json::Map::new())
}
