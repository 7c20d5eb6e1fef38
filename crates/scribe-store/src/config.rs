use std::path::PathBuf;
use std::sync::Arc;

use tracing::info;

use crate::error::StoreError;
use crate::memory::MemoryStore;
use crate::sqlite::SqliteStore;
use crate::store::ConversationStore;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StoreBackend {
    Sqlite { path: PathBuf },
    Memory,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoreConfig {
    pub backend: StoreBackend,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Sqlite {
                path: PathBuf::from("memory.sqlite"),
            },
        }
    }
}

impl StoreConfig {
    pub fn memory() -> Self {
        Self {
            backend: StoreBackend::Memory,
        }
    }

    pub fn sqlite(path: impl Into<PathBuf>) -> Self {
        Self {
            backend: StoreBackend::Sqlite { path: path.into() },
        }
    }
}

/// Build the configured backend behind the common interface.
pub fn open_store(config: &StoreConfig) -> Result<Arc<dyn ConversationStore>, StoreError> {
    let store: Arc<dyn ConversationStore> = match &config.backend {
        StoreBackend::Sqlite { path } => Arc::new(SqliteStore::open(path)?),
        StoreBackend::Memory => Arc::new(MemoryStore::new()),
    };
    info!(backend = store.backend(), "conversation store ready");
    Ok(store)
}
