use std::fmt;

use serde::{Deserialize, Serialize};

use crate::ids::ToolCallId;

/// One unit of incremental output delivered to a client during a turn.
///
/// A turn's stream ends with exactly one terminal event: `End` or `Error`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnEvent {
    ContentDelta { text: String },
    ToolCallDelta(ToolCallMeta),
    Error { message: String },
    End,
}

/// Progress of a tool call or delegation, for display only.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCallMeta {
    pub agent: AgentRole,
    pub tool_call_id: ToolCallId,
    pub name: String,
    pub phase: ToolCallPhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallPhase {
    Started,
    Progress,
    Completed,
    Failed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    Supervisor,
    Writer,
    Reviewer,
}

impl TurnEvent {
    pub fn content(text: impl Into<String>) -> Self {
        Self::ContentDelta { text: text.into() }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::End | Self::Error { .. })
    }
}

impl ToolCallMeta {
    pub fn new(
        agent: AgentRole,
        tool_call_id: ToolCallId,
        name: impl Into<String>,
        phase: ToolCallPhase,
    ) -> Self {
        Self {
            agent,
            tool_call_id,
            name: name.into(),
            phase,
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

impl AgentRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Supervisor => "supervisor",
            Self::Writer => "writer",
            Self::Reviewer => "reviewer",
        }
    }
}

impl fmt::Display for AgentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
