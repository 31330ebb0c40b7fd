//! Durable offline task queue.
//!
//! Tasks live in a SQLite database (WAL, synchronous=FULL) so nothing captured
//! while offline is lost across a crash. Inference results are written as JSON
//! files next to it and referenced by path.

mod results;
mod retry;
mod schema;
mod store;

pub use results::ResultStore;
pub use retry::RetryPolicy;
pub use schema::{FailureOutcome, NewTask, OfflineTask, StorageStats, TaskStatus};
pub use store::TaskStore;

use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum TaskStoreError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("task not found: {0}")]
    NotFound(Uuid),

    #[error("task {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: Uuid,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("corrupt task row: {0}")]
    Corrupt(String),
}

pub type Result<T> = std::result::Result<T, TaskStoreError>;

/// Content hash used for optional payload deduplication.
pub fn content_hash(bytes: &[u8]) -> String {
    hex::encode(blake3::hash(bytes).as_bytes())
}
