use serde::{Deserialize, Serialize};

use scribe_core::checkpoint::Checkpoint;
use scribe_core::ids::ThreadId;
use scribe_core::messages::Message;

use crate::error::StoreError;

/// Everything persisted for one thread.
#[derive(Clone, Debug, PartialEq)]
pub struct ThreadState {
    pub thread_id: ThreadId,
    pub messages: Vec<Message>,
    pub checkpoint_count: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ThreadSummary {
    pub thread_id: ThreadId,
    pub message_count: u64,
    pub updated_at: String,
}

/// Durable, keyed-by-thread persistence of transcripts and checkpoints.
///
/// Implementations are shared across concurrent turns. Each `commit` is
/// atomic: either all of its messages and its checkpoint become visible, or
/// none do, so a failed write never disturbs what was committed before.
pub trait ConversationStore: Send + Sync {
    /// Short backend name for logs and health output.
    fn backend(&self) -> &'static str;

    /// `None` for a thread that has never been written.
    fn load(&self, thread_id: &ThreadId) -> Result<Option<ThreadState>, StoreError>;

    /// Append `messages` and optionally record `checkpoint` in one atomic step.
    /// Creates the thread on first use. Returns the thread's message count afterwards.
    ///
    /// Checkpoint sequences must strictly increase per thread.
    fn commit(
        &self,
        thread_id: &ThreadId,
        messages: &[Message],
        checkpoint: Option<&Checkpoint>,
    ) -> Result<u64, StoreError>;

    fn latest_checkpoint(&self, thread_id: &ThreadId) -> Result<Option<Checkpoint>, StoreError>;

    /// Known threads, most recently updated first.
    fn list_threads(&self) -> Result<Vec<ThreadSummary>, StoreError>;

    /// Append one message; returns its zero-based position in the thread.
    fn append(&self, thread_id: &ThreadId, message: &Message) -> Result<u64, StoreError> {
        let count = self.commit(thread_id, std::slice::from_ref(message), None)?;
        Ok(count.saturating_sub(1))
    }

    fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), StoreError> {
        self.commit(&checkpoint.thread_id, &[], Some(checkpoint))
            .map(|_| ())
    }
}

pub(crate) fn check_thread(thread_id: &ThreadId, checkpoint: &Checkpoint) -> Result<(), StoreError> {
    if &checkpoint.thread_id != thread_id {
        return Err(StoreError::ThreadMismatch {
            expected: thread_id.to_string(),
            found: checkpoint.thread_id.to_string(),
        });
    }
    Ok(())
}

pub(crate) fn check_sequence(checkpoint: &Checkpoint, latest: Option<u64>) -> Result<(), StoreError> {
    match latest {
        Some(latest) if checkpoint.sequence <= latest => Err(StoreError::CheckpointConflict {
            thread_id: checkpoint.thread_id.to_string(),
            sequence: checkpoint.sequence,
            latest,
        }),
        _ => Ok(()),
    }
}
