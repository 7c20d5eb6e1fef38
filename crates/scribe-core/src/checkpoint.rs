use serde::{Deserialize, Serialize};

use crate::ids::ThreadId;

/// Opaque orchestration snapshot keyed by (thread, sequence).
///
/// Stores persist `payload` verbatim; only the engine interprets it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub thread_id: ThreadId,
    pub sequence: u64,
    pub payload: serde_json::Value,
    pub created_at: String,
}

impl Checkpoint {
    pub fn new(thread_id: ThreadId, sequence: u64, payload: serde_json::Value) -> Self {
        Self {
            thread_id,
            sequence,
            payload,
            created_at: chrono::Utc::now().to_rfc3339(),
        }
    }
}
