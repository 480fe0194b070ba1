//! Error types for the tool hub.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use thiserror::Error;

/// Primary error type for all hub operations.
#[derive(Error, Debug)]
pub enum HubError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Server not found: {0}")]
    NotFound(String),

    #[error("Transport error for server '{server}': {message}")]
    Transport { server: String, message: String },

    #[error("Unavailable: {0}")]
    Unavailable(String),

    #[error("Timeout after {0}ms")]
    Timeout(u64),

    #[error("Tool name collision: {0}")]
    Collision(String),

    #[error("Remote error ({kind}): {message}")]
    Remote { kind: String, message: String },

    #[error("Tool execution error: {tool_name}: {message}")]
    ToolExecution { tool_name: String, message: String },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Config file error: {0}")]
    ConfigFile(#[from] toml::de::Error),
}

/// Wire-level classification carried in `ToolCallResult.error.kind`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    NotFound,
    Transport,
    Unavailable,
    Timeout,
    Collision,
    Remote,
    InvalidArgument,
    Internal,
}

impl HubError {
    /// Build a transport error for one server.
    pub fn transport(server: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transport {
            server: server.into(),
            message: message.into(),
        }
    }

    /// Classify this error into its wire-level kind.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Transport { .. } | Self::Network(_) => ErrorKind::Transport,
            Self::Unavailable(_) => ErrorKind::Unavailable,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Collision(_) => ErrorKind::Collision,
            Self::Remote { .. } | Self::ToolExecution { .. } => ErrorKind::Remote,
            Self::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Self::Configuration(_)
            | Self::Io(_)
            | Self::Serialization(_)
            | Self::ConfigFile(_) => ErrorKind::Internal,
        }
    }

    /// Whether a caller may reasonably retry the operation.
    ///
    /// The hub itself never retries tool calls.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Transport | ErrorKind::Timeout | ErrorKind::Unavailable
        )
    }
}

/// Convenience alias.
pub type Result<T> = std::result::Result<T, HubError>;
