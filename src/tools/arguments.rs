//! Typed access to tool call arguments.

use crate::error::HubError;

/// Wrapper around tool call arguments providing typed extraction.
#[derive(Debug, Clone)]
pub struct ToolArguments {
    value: serde_json::Value,
}

impl ToolArguments {
    pub fn new(value: serde_json::Value) -> Self {
        Self { value }
    }

    /// Get a string argument by key.
    pub fn get_str(&self, key: &str) -> Result<&str, HubError> {
        self.value
            .get(key)
            .and_then(|v| v.as_str())
            .ok_or_else(|| HubError::InvalidArgument(format!("Missing string argument: {key}")))
    }

    /// Get an optional string argument.
    pub fn get_str_opt(&self, key: &str) -> Option<&str> {
        self.value.get(key).and_then(|v| v.as_str())
    }

    /// Get an argument of any JSON type; `null` counts as missing.
    pub fn get_value(&self, key: &str) -> Result<&serde_json::Value, HubError> {
        self.value
            .get(key)
            .filter(|v| !v.is_null())
            .ok_or_else(|| HubError::InvalidArgument(format!("Missing argument: {key}")))
    }

    /// Deserialize the entire arguments into a typed struct.
    pub fn deserialize<T: serde::de::DeserializeOwned>(&self) -> Result<T, HubError> {
        serde_json::from_value(self.value.clone()).map_err(|e| {
            HubError::InvalidArgument(format!("Failed to deserialize arguments: {e}"))
        })
    }
}
