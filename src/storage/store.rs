//! Task store contract shared by the SQLite and PostgreSQL backends.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::scheduler::task::{AnalysisTask, TaskStatus};

/// Errors that can occur during task store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Connection to the database failed.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Query execution failed.
    #[error("Query failed: {0}")]
    QueryFailed(sqlx::Error),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Migration error.
    #[error("Migration error: {0}")]
    Migration(#[from] super::migrations::MigrationError),

    /// A write violated a store constraint (e.g. a second running task).
    #[error("Constraint violated: {0}")]
    Conflict(String),

    /// A persisted row could not be mapped back onto a task.
    #[error("Corrupt task row {id}: {reason}")]
    Corrupt { id: Uuid, reason: String },

    /// A save targeted a task that no longer exists.
    #[error("Task {0} not found")]
    NotFound(Uuid),

    /// The transaction was already committed or rolled back.
    #[error("Transaction is closed")]
    TransactionClosed,

    /// The database URL names no supported backend.
    #[error("Unsupported database URL '{0}' (expected sqlite:// or postgres://)")]
    UnsupportedUrl(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                StoreError::Conflict(db.message().to_string())
            }
            _ => StoreError::QueryFailed(err),
        }
    }
}

/// Durable store of analysis tasks.
///
/// Every scheduling decision goes through a [`TaskTransaction`]. Transactions
/// are serialized store-wide, so a check made inside one (e.g. "is any other
/// task running?") still holds when the same transaction writes.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Creates the schema if it does not exist yet.
    async fn migrate(&self) -> Result<(), StoreError>;

    /// Opens a transaction holding the store-wide write lock.
    async fn begin(&self) -> Result<Box<dyn TaskTransaction>, StoreError>;

    /// Inserts a new task.
    async fn insert(&self, task: &AnalysisTask) -> Result<(), StoreError>;

    /// Reads a task without locking.
    async fn get(&self, id: Uuid) -> Result<Option<AnalysisTask>, StoreError>;

    /// Lists the most recently created tasks, optionally filtered by status.
    async fn list(
        &self,
        status: Option<TaskStatus>,
        limit: u32,
    ) -> Result<Vec<AnalysisTask>, StoreError>;

    /// Deletes tasks in `status` whose `completed_at` is before `cutoff`.
    ///
    /// Returns the number of deleted rows.
    async fn delete_older_than(
        &self,
        status: TaskStatus,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, StoreError>;
}

/// A store transaction.
///
/// Dropping a transaction without calling [`TaskTransaction::commit`] rolls it
/// back.
#[async_trait]
pub trait TaskTransaction: Send {
    /// Loads a task and locks its row until the transaction ends.
    async fn lock_for_update(&mut self, id: Uuid) -> Result<Option<AnalysisTask>, StoreError>;

    /// Returns every running task.
    async fn query_running(&mut self) -> Result<Vec<AnalysisTask>, StoreError>;

    /// Returns queued tasks by priority descending, then FIFO.
    async fn query_queued_ordered(&mut self) -> Result<Vec<AnalysisTask>, StoreError>;

    /// Returns failed tasks that still have retries left, oldest failure
    /// first.
    async fn query_retryable(&mut self) -> Result<Vec<AnalysisTask>, StoreError>;

    /// Returns the most recently completed task with `purl` and a report,
    /// ignoring `exclude`.
    async fn query_completed_by_purl(
        &mut self,
        purl: &str,
        exclude: Uuid,
    ) -> Result<Option<AnalysisTask>, StoreError>;

    /// Writes every mutable field of the task.
    async fn save(&mut self, task: &AnalysisTask) -> Result<(), StoreError>;

    /// Writes only the derived queue position of a task.
    async fn set_queue_position(
        &mut self,
        id: Uuid,
        position: Option<u32>,
    ) -> Result<(), StoreError>;

    /// Commits the transaction and releases the write lock.
    async fn commit(&mut self) -> Result<(), StoreError>;
}
