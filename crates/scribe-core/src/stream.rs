use serde::{Deserialize, Serialize};

use crate::errors::GatewayError;
use crate::ids::ToolCallId;
use crate::messages::{Message, StopReason, ToolCallBlock};

/// Events yielded by an `LlmProvider` stream.
///
/// Start → (TextDelta | ToolCallStart → ToolCallDelta* → ToolCallEnd)* → Done
///
/// Error may replace Done at any point; Retry is informational.
#[derive(Clone, Debug)]
pub enum StreamEvent {
    Start,
    TextDelta { delta: String },
    ToolCallStart { tool_call_id: ToolCallId, name: String },
    ToolCallDelta { tool_call_id: ToolCallId, arguments_delta: String },
    ToolCallEnd { tool_call: ToolCallBlock },
    /// `message` is always `Message::Assistant`.
    Done { message: Message, stop_reason: StopReason },
    Error { error: GatewayError },
    Retry { attempt: u32, max_retries: u32, delay_ms: u64, error: GatewayErrorInfo },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GatewayErrorInfo {
    pub kind: String,
    pub message: String,
}

impl From<&GatewayError> for GatewayErrorInfo {
    fn from(e: &GatewayError) -> Self {
        Self {
            kind: e.error_kind().to_string(),
            message: e.to_string(),
        }
    }
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done { .. } | Self::Error { .. })
    }
}
