use scribe_core::errors::GatewayError;
use scribe_core::ids::ThreadId;
use scribe_store::StoreError;

use crate::worker::WorkerError;

/// Why a turn ended without a final answer.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("worker error: {0}")]
    Worker(#[from] WorkerError),

    #[error("plan exceeded {0} delegation steps")]
    PlanStepLimitExceeded(u32),

    #[error("store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),

    #[error("nothing to resume on thread {0}")]
    NothingToResume(ThreadId),

    #[error("turn aborted")]
    Aborted,

    #[error("{0}")]
    Internal(String),
}

impl EngineError {
    /// Text carried by the stream's `Error` event.
    pub fn user_message(&self) -> String {
        match self {
            Self::Gateway(e) if e.is_fatal() => {
                "The language model rejected the request. Check the API key and model name."
                    .to_string()
            }
            Self::Gateway(GatewayError::Timeout(d)) => {
                format!("The language model did not respond within {}s.", d.as_secs())
            }
            Self::Gateway(e) => format!("The language model is unavailable: {e}"),
            Self::Worker(e) => format!("A sub-agent failed: {e}"),
            Self::PlanStepLimitExceeded(limit) => format!(
                "The plan needed more than {limit} delegation steps and was stopped."
            ),
            Self::StoreUnavailable(_) => {
                "Conversation memory is unavailable; nothing from this turn was saved past the last completed step."
                    .to_string()
            }
            Self::NothingToResume(thread) => {
                format!("Thread {thread} has no interrupted turn to resume.")
            }
            Self::Aborted => "The turn was cancelled.".to_string(),
            Self::Internal(msg) => format!("Internal error: {msg}"),
        }
    }

    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Gateway(e) => e.error_kind(),
            Self::Worker(_) => "worker",
            Self::PlanStepLimitExceeded(_) => "plan_step_limit",
            Self::StoreUnavailable(_) => "store_unavailable",
            Self::NothingToResume(_) => "nothing_to_resume",
            Self::Aborted => "aborted",
            Self::Internal(_) => "internal",
        }
    }
}
