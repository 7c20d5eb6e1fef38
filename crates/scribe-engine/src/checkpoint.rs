use serde::{Deserialize, Serialize};

use scribe_core::checkpoint::Checkpoint;
use scribe_core::events::AgentRole;
use scribe_core::ids::{ThreadId, TurnId};
use scribe_core::messages::ToolCallBlock;
use scribe_store::StoreError;

/// Where the supervisor is within one turn.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "worker", rename_all = "snake_case")]
pub enum TurnPhase {
    Idle,
    Planning,
    Delegating(AgentRole),
    Synthesizing,
    Done,
    Failed,
}

impl TurnPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

/// Orchestration progress stored as a checkpoint's payload.
///
/// Together with the committed transcript this is enough to pick a turn up
/// again: `reply` is the text already streamed to the client this turn, and
/// `pending` holds the supervisor tool calls not yet answered.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TurnCheckpoint {
    pub turn_id: TurnId,
    pub query: String,
    pub phase: TurnPhase,
    /// Delegation steps used so far.
    pub step: u32,
    #[serde(default)]
    pub reply: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pending: Vec<ToolCallBlock>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

impl TurnCheckpoint {
    /// A new turn that has not started reasoning yet.
    pub fn fresh(query: impl Into<String>) -> Self {
        Self {
            turn_id: TurnId::new(),
            query: query.into(),
            phase: TurnPhase::Idle,
            step: 0,
            reply: String::new(),
            pending: Vec::new(),
            failure: None,
        }
    }

    /// Interrupted mid-turn: neither finished nor failed.
    pub fn is_in_flight(&self) -> bool {
        !self.phase.is_terminal() && self.phase != TurnPhase::Idle
    }

    pub fn transition(&mut self, phase: TurnPhase) {
        self.phase = phase;
    }

    pub fn fail(&mut self, reason: impl Into<String>) {
        self.phase = TurnPhase::Failed;
        self.pending.clear();
        self.failure = Some(reason.into());
    }

    pub fn to_checkpoint(&self, thread_id: &ThreadId, sequence: u64) -> Result<Checkpoint, StoreError> {
        let payload = serde_json::to_value(self)?;
        Ok(Checkpoint::new(thread_id.clone(), sequence, payload))
    }

    pub fn from_checkpoint(checkpoint: &Checkpoint) -> Result<Self, StoreError> {
        serde_json::from_value(checkpoint.payload.clone()).map_err(|e| StoreError::CorruptRow {
            table: "checkpoints",
            column: "payload",
            detail: e.to_string(),
        })
    }
}
