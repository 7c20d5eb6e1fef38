use std::path::Path;

use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use tracing::{debug, instrument};

use scribe_core::checkpoint::Checkpoint;
use scribe_core::ids::ThreadId;
use scribe_core::messages::{Message, Role};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;
use crate::store::{check_sequence, check_thread, ConversationStore, ThreadState, ThreadSummary};

/// Durable backend: survives process restarts.
pub struct SqliteStore {
    db: Database,
}

impl SqliteStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn open(path: &Path) -> Result<Self, StoreError> {
        Database::open(path).map(Self::new)
    }

    pub fn database(&self) -> &Database {
        &self.db
    }
}

impl ConversationStore for SqliteStore {
    fn backend(&self) -> &'static str {
        "sqlite"
    }

    #[instrument(skip(self), fields(thread_id = %thread_id))]
    fn load(&self, thread_id: &ThreadId) -> Result<Option<ThreadState>, StoreError> {
        self.db.with_conn(|conn| {
            let checkpoint_count: Option<i64> = conn
                .query_row(
                    "SELECT checkpoint_count FROM threads WHERE id = ?1",
                    [thread_id.as_str()],
                    |row| row.get(0),
                )
                .optional()?;
            let Some(checkpoint_count) = checkpoint_count else {
                return Ok(None);
            };

            let mut stmt = conn.prepare(
                "SELECT role, payload FROM messages WHERE thread_id = ?1 ORDER BY sequence ASC",
            )?;
            let mut rows = stmt.query([thread_id.as_str()])?;
            let mut messages = Vec::new();
            while let Some(row) = rows.next()? {
                let role: String = row_helpers::get(row, 0, "messages", "role")?;
                let payload: String = row_helpers::get(row, 1, "messages", "payload")?;
                let role: Role = row_helpers::parse_enum(&role, "messages", "role")?;
                let message: Message = row_helpers::parse_json(&payload, "messages", "payload")?;
                if message.role() != role {
                    return Err(StoreError::CorruptRow {
                        table: "messages",
                        column: "role",
                        detail: format!("column says {role}, payload says {}", message.role()),
                    });
                }
                messages.push(message);
            }

            Ok(Some(ThreadState {
                thread_id: thread_id.clone(),
                messages,
                checkpoint_count: row_helpers::to_sequence(checkpoint_count, "threads")?,
            }))
        })
    }

    #[instrument(skip(self, messages, checkpoint), fields(thread_id = %thread_id, messages = messages.len()))]
    fn commit(
        &self,
        thread_id: &ThreadId,
        messages: &[Message],
        checkpoint: Option<&Checkpoint>,
    ) -> Result<u64, StoreError> {
        if let Some(cp) = checkpoint {
            check_thread(thread_id, cp)?;
        }

        let count = self.db.with_tx(|tx| {
            let now = Utc::now().to_rfc3339();
            tx.execute(
                "INSERT INTO threads (id, created_at, updated_at) VALUES (?1, ?2, ?2)
                 ON CONFLICT(id) DO NOTHING",
                params![thread_id.as_str(), now],
            )?;

            let mut count: i64 = tx.query_row(
                "SELECT message_count FROM threads WHERE id = ?1",
                [thread_id.as_str()],
                |row| row.get(0),
            )?;

            for message in messages {
                tx.execute(
                    "INSERT INTO messages (thread_id, sequence, role, payload, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        thread_id.as_str(),
                        count,
                        message.role().as_str(),
                        serde_json::to_string(message)?,
                        now,
                    ],
                )?;
                count += 1;
            }

            let mut new_checkpoints = 0i64;
            if let Some(cp) = checkpoint {
                let latest: Option<i64> = tx.query_row(
                    "SELECT MAX(sequence) FROM checkpoints WHERE thread_id = ?1",
                    [thread_id.as_str()],
                    |row| row.get(0),
                )?;
                let latest = latest
                    .map(|s| row_helpers::to_sequence(s, "checkpoints"))
                    .transpose()?;
                check_sequence(cp, latest)?;

                tx.execute(
                    "INSERT INTO checkpoints (thread_id, sequence, payload, created_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![
                        thread_id.as_str(),
                        cp.sequence as i64,
                        serde_json::to_string(&cp.payload)?,
                        cp.created_at,
                    ],
                )?;
                new_checkpoints = 1;
            }

            tx.execute(
                "UPDATE threads
                 SET message_count = ?1, checkpoint_count = checkpoint_count + ?2, updated_at = ?3
                 WHERE id = ?4",
                params![count, new_checkpoints, now, thread_id.as_str()],
            )?;
            row_helpers::to_sequence(count, "threads")
        })?;

        debug!(count, "committed");
        Ok(count)
    }

    #[instrument(skip(self), fields(thread_id = %thread_id))]
    fn latest_checkpoint(&self, thread_id: &ThreadId) -> Result<Option<Checkpoint>, StoreError> {
        self.db.with_conn(|conn| {
            let row: Option<(i64, String, String)> = conn
                .query_row(
                    "SELECT sequence, payload, created_at FROM checkpoints
                     WHERE thread_id = ?1 ORDER BY sequence DESC LIMIT 1",
                    [thread_id.as_str()],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )
                .optional()?;

            row.map(|(sequence, payload, created_at)| {
                Ok(Checkpoint {
                    thread_id: thread_id.clone(),
                    sequence: row_helpers::to_sequence(sequence, "checkpoints")?,
                    payload: row_helpers::parse_json(&payload, "checkpoints", "payload")?,
                    created_at,
                })
            })
            .transpose()
        })
    }

    fn list_threads(&self) -> Result<Vec<ThreadSummary>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, message_count, updated_at FROM threads ORDER BY updated_at DESC, id ASC",
            )?;
            let mut rows = stmt.query([])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                let id: String = row_helpers::get(row, 0, "threads", "id")?;
                let count: i64 = row_helpers::get(row, 1, "threads", "message_count")?;
                out.push(ThreadSummary {
                    thread_id: ThreadId::from_raw(id),
                    message_count: row_helpers::to_sequence(count, "threads")?,
                    updated_at: row_helpers::get(row, 2, "threads", "updated_at")?,
                });
            }
            Ok(out)
        })
    }
}
