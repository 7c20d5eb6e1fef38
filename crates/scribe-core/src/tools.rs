use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Tool definition sent to the model as part of the context.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters_schema: serde_json::Value,
}

/// A named capability any agent may call.
///
/// Implementations must be side-effect free beyond their declared purpose.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    /// Natural-language usage hint consumed by the model.
    fn description(&self) -> &str;
    fn parameters_schema(&self) -> serde_json::Value;

    async fn execute(&self, args: serde_json::Value) -> Result<String, ToolFailure>;

    fn to_definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters_schema: self.parameters_schema(),
        }
    }
}

/// Error returned by a registry invocation.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum ToolError {
    #[error("unknown tool: {0}")]
    UnknownTool(String),
    #[error("tool {tool} failed: {reason}")]
    Execution { tool: String, reason: ToolFailure },
}

/// Why a known tool did not produce a result.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum ToolFailure {
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    #[error("{0}")]
    Failed(String),
    #[error("timed out after {0:?}")]
    TimedOut(Duration),
    #[error("panicked: {0}")]
    Panicked(String),
    #[error("denied: {0}")]
    Denied(String),
    #[error("cancelled")]
    Cancelled,
}

impl ToolError {
    pub fn execution(tool: impl Into<String>, reason: ToolFailure) -> Self {
        Self::Execution {
            tool: tool.into(),
            reason,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::Execution {
                reason: ToolFailure::TimedOut(_),
                ..
            }
        )
    }

    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::UnknownTool(_) => "unknown_tool",
            Self::Execution { reason, .. } => match reason {
                ToolFailure::InvalidArguments(_) => "invalid_arguments",
                ToolFailure::Failed(_) => "failed",
                ToolFailure::TimedOut(_) => "timed_out",
                ToolFailure::Panicked(_) => "panicked",
                ToolFailure::Denied(_) => "denied",
                ToolFailure::Cancelled => "cancelled",
            },
        }
    }

    /// Text handed back to the model in place of a tool result.
    pub fn as_tool_result(&self) -> String {
        format!("[error] {self}")
    }
}

/// Pull a required string argument out of a tool's JSON arguments.
pub fn require_str<'a>(args: &'a serde_json::Value, key: &str) -> Result<&'a str, ToolFailure> {
    args.get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| ToolFailure::InvalidArguments(format!("missing string field `{key}`")))
}
