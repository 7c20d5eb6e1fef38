//! Optional human-in-the-loop gate consulted before every tool invocation.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

use scribe_core::events::AgentRole;
use scribe_core::ids::ToolCallId;

const DEFAULT_APPROVAL_TIMEOUT: Duration = Duration::from_secs(300);

/// A tool call about to run.
#[derive(Clone, Debug, PartialEq)]
pub struct ToolCallRequest {
    pub agent: AgentRole,
    pub tool_call_id: ToolCallId,
    pub name: String,
    pub arguments: serde_json::Value,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ApprovalDecision {
    Approve,
    Deny(String),
    /// Run the tool with replacement arguments.
    Edit(serde_json::Value),
}

#[async_trait]
pub trait ApprovalGate: Send + Sync {
    async fn review(&self, request: &ToolCallRequest) -> ApprovalDecision;
}

/// Approves everything. The default gate.
#[derive(Clone, Copy, Debug, Default)]
pub struct AutoApprove;

#[async_trait]
impl ApprovalGate for AutoApprove {
    async fn review(&self, _request: &ToolCallRequest) -> ApprovalDecision {
        ApprovalDecision::Approve
    }
}

/// A pending approval handed to whoever reads the reviewer channel.
#[derive(Debug)]
pub struct ApprovalRequest {
    pub request: ToolCallRequest,
    respond: oneshot::Sender<ApprovalDecision>,
}

impl ApprovalRequest {
    pub fn respond(self, decision: ApprovalDecision) {
        if self.respond.send(decision).is_err() {
            warn!(tool = %self.request.name, "approval answered after the caller gave up");
        }
    }
}

/// Interrupts before the named tools and waits for an external decision.
///
/// Calls to other tools pass straight through. A reviewer that never answers,
/// or a closed reviewer channel, denies the call.
pub struct InterruptOn {
    tools: HashSet<String>,
    reviewer: mpsc::Sender<ApprovalRequest>,
    timeout: Duration,
}

impl InterruptOn {
    pub fn new(
        tools: impl IntoIterator<Item = impl Into<String>>,
    ) -> (Self, mpsc::Receiver<ApprovalRequest>) {
        let (tx, rx) = mpsc::channel(16);
        let gate = Self {
            tools: tools.into_iter().map(Into::into).collect(),
            reviewer: tx,
            timeout: DEFAULT_APPROVAL_TIMEOUT,
        };
        (gate, rx)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn gates(&self, tool: &str) -> bool {
        self.tools.contains(tool)
    }
}

#[async_trait]
impl ApprovalGate for InterruptOn {
    async fn review(&self, request: &ToolCallRequest) -> ApprovalDecision {
        if !self.gates(&request.name) {
            return ApprovalDecision::Approve;
        }

        let (tx, rx) = oneshot::channel();
        let pending = ApprovalRequest {
            request: request.clone(),
            respond: tx,
        };
        if self.reviewer.send(pending).await.is_err() {
            return ApprovalDecision::Deny("no reviewer is available".into());
        }
        info!(tool = %request.name, agent = %request.agent, "waiting for tool approval");

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(decision)) => decision,
            Ok(Err(_)) => ApprovalDecision::Deny("reviewer dropped the request".into()),
            Err(_) => {
                warn!(
                    tool = %request.name,
                    timeout_secs = self.timeout.as_secs(),
                    "tool approval timed out"
                );
                ApprovalDecision::Deny(format!(
                    "no decision within {}s",
                    self.timeout.as_secs()
                ))
            }
        }
    }
}
