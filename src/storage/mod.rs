//! Durable task storage.
//!
//! # Overview
//!
//! The storage system consists of:
//! - **TaskStore / TaskTransaction**: the contract the scheduler is written against
//! - **SqliteTaskStore**: single-host deployments and tests
//! - **PostgresTaskStore**: multi-process deployments
//! - **Migrations**: schema management for PostgreSQL
//!
//! # Usage
//!
//! ```rust,ignore
//! use packamal_scheduler::storage;
//!
//! let store = storage::connect("sqlite://scheduler.db").await?;
//! store.migrate().await?;
//!
//! let mut tx = store.begin().await?;
//! let running = tx.query_running().await?;
//! tx.commit().await?;
//! ```

pub mod migrations;
pub mod postgres;
mod row;
pub mod schema;
pub mod sqlite;
pub mod store;

use std::sync::Arc;

pub use migrations::{MigrationError, MigrationRunner};
pub use postgres::PostgresTaskStore;
pub use sqlite::SqliteTaskStore;
pub use store::{StoreError, TaskStore, TaskTransaction};

/// Opens the task store named by `database_url`.
///
/// `sqlite:` URLs open (and create) a SQLite database with the schema applied;
/// `postgres://` and `postgresql://` URLs connect without migrating.
pub async fn connect(database_url: &str) -> Result<Arc<dyn TaskStore>, StoreError> {
    if database_url.starts_with("sqlite:") {
        Ok(Arc::new(SqliteTaskStore::open(database_url).await?))
    } else if database_url.starts_with("postgres://") || database_url.starts_with("postgresql://")
    {
        Ok(Arc::new(PostgresTaskStore::connect(database_url).await?))
    } else {
        Err(StoreError::UnsupportedUrl(database_url.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_rejects_unknown_scheme() {
        let err = connect("mysql://localhost/db").await.err().unwrap();
        assert!(matches!(err, StoreError::UnsupportedUrl(_)));
    }

    #[tokio::test]
    async fn test_connect_sqlite() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("s.db").display());
        let store = connect(&url).await.unwrap();
        assert!(store.list(None, 5).await.unwrap().is_empty());
    }
}
