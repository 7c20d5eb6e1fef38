//! The supervisor's two delegation tools, and the typed dispatch behind them.

use std::sync::Arc;

use scribe_core::events::AgentRole;
use scribe_core::messages::ToolCallBlock;
use scribe_core::provider::{LlmProvider, StreamOptions};
use scribe_core::tools::{require_str, ToolDefinition, ToolFailure};

use crate::approval::ApprovalGate;
use crate::registry::ToolRegistry;
use crate::worker::{LlmWorker, Worker, WorkerContext, WorkerError, WorkerOutput, WorkerSpec};

pub const DELEGATE_TO_WRITER: &str = "delegate_to_writer";
pub const DELEGATE_TO_REVIEWER: &str = "delegate_to_reviewer";

/// A task handed to one worker.
#[derive(Clone, Debug, PartialEq)]
pub struct Delegation {
    pub target: AgentRole,
    pub task: String,
}

impl Delegation {
    /// `None` when the call is not a delegation at all.
    pub fn from_call(call: &ToolCallBlock) -> Option<Result<Self, ToolFailure>> {
        let (target, field) = match call.name.as_str() {
            DELEGATE_TO_WRITER => (AgentRole::Writer, "request"),
            DELEGATE_TO_REVIEWER => (AgentRole::Reviewer, "content_to_review"),
            _ => return None,
        };
        Some(require_str(&call.arguments, field).map(|task| Self {
            target,
            task: task.to_string(),
        }))
    }

    pub fn tool_name(&self) -> &'static str {
        match self.target {
            AgentRole::Reviewer => DELEGATE_TO_REVIEWER,
            _ => DELEGATE_TO_WRITER,
        }
    }
}

pub fn is_delegation(name: &str) -> bool {
    matches!(name, DELEGATE_TO_WRITER | DELEGATE_TO_REVIEWER)
}

/// Tool definitions the supervisor's model sees.
pub fn delegation_definitions() -> Vec<ToolDefinition> {
    vec![
        ToolDefinition {
            name: DELEGATE_TO_WRITER.into(),
            description: "Call the writer. Use this whenever new content must be written, an article revised, or anything drafted.".into(),
            parameters_schema: serde_json::json!({
                "type": "object",
                "required": ["request"],
                "properties": {
                    "request": {
                        "type": "string",
                        "description": "Specific writing instructions for the writer"
                    }
                }
            }),
        },
        ToolDefinition {
            name: DELEGATE_TO_REVIEWER.into(),
            description: "Call the reviewer. Use this whenever an article needs to be reviewed.".into(),
            parameters_schema: serde_json::json!({
                "type": "object",
                "required": ["content_to_review"],
                "properties": {
                    "content_to_review": {
                        "type": "string",
                        "description": "The full text to review"
                    }
                }
            }),
        },
    ]
}

/// The workers the supervisor can delegate to.
#[derive(Clone)]
pub struct Team {
    writer: Arc<dyn Worker>,
    reviewer: Arc<dyn Worker>,
}

impl Team {
    pub fn new(writer: Arc<dyn Worker>, reviewer: Arc<dyn Worker>) -> Self {
        Self { writer, reviewer }
    }

    /// Writer and reviewer sharing one provider, with the reviewer's tool
    /// calls passing through `gate`.
    pub fn from_provider(
        provider: Arc<dyn LlmProvider>,
        registry: &ToolRegistry,
        gate: Arc<dyn ApprovalGate>,
        options: StreamOptions,
    ) -> Self {
        let writer = LlmWorker::new(WorkerSpec::writer(), Arc::clone(&provider), registry)
            .with_stream_options(options.clone());
        let reviewer = LlmWorker::new(WorkerSpec::reviewer(), provider, registry)
            .with_gate(gate)
            .with_stream_options(options);
        Self::new(Arc::new(writer), Arc::new(reviewer))
    }

    pub fn worker(&self, role: AgentRole) -> Option<&Arc<dyn Worker>> {
        match role {
            AgentRole::Writer => Some(&self.writer),
            AgentRole::Reviewer => Some(&self.reviewer),
            AgentRole::Supervisor => None,
        }
    }

    pub async fn dispatch(
        &self,
        delegation: &Delegation,
        ctx: &WorkerContext,
    ) -> Result<WorkerOutput, WorkerError> {
        match self.worker(delegation.target) {
            Some(worker) => worker.run(&delegation.task, ctx).await,
            None => Err(WorkerError::MalformedOutput {
                worker: delegation.target,
                raw: String::new(),
                reason: "the supervisor cannot delegate to itself".into(),
            }),
        }
    }
}
