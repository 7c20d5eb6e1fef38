pub mod config;
pub mod database;
pub mod error;
pub mod locks;
pub mod memory;
pub mod row_helpers;
pub mod schema;
pub mod sqlite;
pub mod store;

pub use config::{open_store, StoreBackend, StoreConfig};
pub use database::Database;
pub use error::StoreError;
pub use locks::{Reservation, ThreadGuard, ThreadLocks};
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use store::{ConversationStore, ThreadState, ThreadSummary};
