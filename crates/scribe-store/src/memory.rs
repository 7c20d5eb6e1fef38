use std::collections::HashMap;

use chrono::Utc;
use parking_lot::RwLock;

use scribe_core::checkpoint::Checkpoint;
use scribe_core::ids::ThreadId;
use scribe_core::messages::Message;

use crate::error::StoreError;
use crate::store::{check_sequence, check_thread, ConversationStore, ThreadState, ThreadSummary};

#[derive(Default)]
struct ThreadRecord {
    messages: Vec<Message>,
    checkpoints: Vec<Checkpoint>,
    updated_at: String,
}

/// Ephemeral backend for local experimentation and tests. Lost on restart.
#[derive(Default)]
pub struct MemoryStore {
    threads: RwLock<HashMap<ThreadId, ThreadRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ConversationStore for MemoryStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    fn load(&self, thread_id: &ThreadId) -> Result<Option<ThreadState>, StoreError> {
        Ok(self.threads.read().get(thread_id).map(|record| ThreadState {
            thread_id: thread_id.clone(),
            messages: record.messages.clone(),
            checkpoint_count: record.checkpoints.len() as u64,
        }))
    }

    fn commit(
        &self,
        thread_id: &ThreadId,
        messages: &[Message],
        checkpoint: Option<&Checkpoint>,
    ) -> Result<u64, StoreError> {
        let mut threads = self.threads.write();

        // Validate before touching anything so a rejected commit is a no-op.
        if let Some(cp) = checkpoint {
            check_thread(thread_id, cp)?;
            let latest = threads
                .get(thread_id)
                .and_then(|r| r.checkpoints.last())
                .map(|c| c.sequence);
            check_sequence(cp, latest)?;
        }

        let record = threads.entry(thread_id.clone()).or_default();
        record.messages.extend_from_slice(messages);
        if let Some(cp) = checkpoint {
            record.checkpoints.push(cp.clone());
        }
        record.updated_at = Utc::now().to_rfc3339();
        Ok(record.messages.len() as u64)
    }

    fn latest_checkpoint(&self, thread_id: &ThreadId) -> Result<Option<Checkpoint>, StoreError> {
        Ok(self
            .threads
            .read()
            .get(thread_id)
            .and_then(|r| r.checkpoints.last().cloned()))
    }

    fn list_threads(&self) -> Result<Vec<ThreadSummary>, StoreError> {
        let mut out: Vec<ThreadSummary> = self
            .threads
            .read()
            .iter()
            .map(|(id, record)| ThreadSummary {
                thread_id: id.clone(),
                message_count: record.messages.len() as u64,
                updated_at: record.updated_at.clone(),
            })
            .collect();
        out.sort_by(|a, b| {
            b.updated_at
                .cmp(&a.updated_at)
                .then_with(|| a.thread_id.cmp(&b.thread_id))
        });
        Ok(out)
    }
}
