//! SQLite task store.
//!
//! Scheduler transactions start with `BEGIN IMMEDIATE`, which takes the
//! database write lock up front. Two dispatchers can therefore never both
//! observe "nothing is running" and both claim a task.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::pool::PoolConnection;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::{Sqlite, SqliteConnection, SqlitePool};
use uuid::Uuid;

use super::row::{bind_insert, bind_update, into_tasks, TaskRow};
use super::schema::{self, sqlite as sql};
use super::store::{StoreError, TaskStore, TaskTransaction};
use crate::scheduler::task::{AnalysisTask, TaskStatus};

/// How long a writer waits for the database lock before failing.
const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

/// SQLite-backed task store.
#[derive(Clone)]
pub struct SqliteTaskStore {
    pool: SqlitePool,
}

impl SqliteTaskStore {
    /// Opens (creating if missing) the database at `url` and applies the schema.
    ///
    /// Accepts `sqlite://path`, `sqlite:path` or a bare file path.
    pub async fn open(url: &str) -> Result<Self, StoreError> {
        let url = if url.starts_with("sqlite:") {
            url.to_string()
        } else {
            format!("sqlite://{}", url)
        };

        let opts = SqliteConnectOptions::from_str(&url)
            .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(BUSY_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .acquire_timeout(Duration::from_secs(30))
            .connect_with(opts)
            .await
            .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;

        let store = Self { pool };
        store.migrate().await?;

        tracing::info!(url = %url, "SQLite task store opened");
        Ok(store)
    }
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::query(sql::CREATE_TASKS_TABLE)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn begin(&self) -> Result<Box<dyn TaskTransaction>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;
        Ok(Box::new(SqliteTransaction { conn: Some(conn) }))
    }

    async fn insert(&self, task: &AnalysisTask) -> Result<(), StoreError> {
        let query = bind_insert!(sqlx::query(sql::INSERT_TASK), TaskRow::from(task));
        query.execute(&self.pool).await?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<AnalysisTask>, StoreError> {
        let row: Option<TaskRow> = sqlx::query_as(&schema::select(sql::SELECT_BY_ID))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(AnalysisTask::try_from).transpose()
    }

    async fn list(
        &self,
        status: Option<TaskStatus>,
        limit: u32,
    ) -> Result<Vec<AnalysisTask>, StoreError> {
        let rows: Vec<TaskRow> = sqlx::query_as(&schema::select(sql::SELECT_LIST))
            .bind(status.map(|s| s.as_str()))
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?;
        into_tasks(rows)
    }

    async fn delete_older_than(
        &self,
        status: TaskStatus,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(sql::DELETE_OLDER_THAN)
            .bind(status.as_str())
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

/// A `BEGIN IMMEDIATE` transaction on a pooled connection.
struct SqliteTransaction {
    conn: Option<PoolConnection<Sqlite>>,
}

impl SqliteTransaction {
    fn conn(&mut self) -> Result<&mut SqliteConnection, StoreError> {
        match self.conn.as_mut() {
            Some(conn) => Ok(&mut **conn),
            None => Err(StoreError::TransactionClosed),
        }
    }

    async fn fetch_one_task(
        &mut self,
        sql: &str,
        id: Uuid,
    ) -> Result<Option<AnalysisTask>, StoreError> {
        let sql = schema::select(sql);
        let row: Option<TaskRow> = sqlx::query_as(&sql)
            .bind(id)
            .fetch_optional(self.conn()?)
            .await?;
        row.map(AnalysisTask::try_from).transpose()
    }

    async fn fetch_tasks(&mut self, sql: &str) -> Result<Vec<AnalysisTask>, StoreError> {
        let sql = schema::select(sql);
        let rows: Vec<TaskRow> = sqlx::query_as(&sql).fetch_all(self.conn()?).await?;
        into_tasks(rows)
    }
}

#[async_trait]
impl TaskTransaction for SqliteTransaction {
    async fn lock_for_update(&mut self, id: Uuid) -> Result<Option<AnalysisTask>, StoreError> {
        // The IMMEDIATE lock already covers every row.
        self.fetch_one_task(sql::SELECT_BY_ID, id).await
    }

    async fn query_running(&mut self) -> Result<Vec<AnalysisTask>, StoreError> {
        self.fetch_tasks(sql::SELECT_RUNNING).await
    }

    async fn query_queued_ordered(&mut self) -> Result<Vec<AnalysisTask>, StoreError> {
        self.fetch_tasks(sql::SELECT_QUEUED_ORDERED).await
    }

    async fn query_retryable(&mut self) -> Result<Vec<AnalysisTask>, StoreError> {
        self.fetch_tasks(sql::SELECT_RETRYABLE).await
    }

    async fn query_completed_by_purl(
        &mut self,
        purl: &str,
        exclude: Uuid,
    ) -> Result<Option<AnalysisTask>, StoreError> {
        let sql = schema::select(sql::SELECT_COMPLETED_BY_PURL);
        let row: Option<TaskRow> = sqlx::query_as(&sql)
            .bind(purl)
            .bind(exclude)
            .fetch_optional(self.conn()?)
            .await?;
        row.map(AnalysisTask::try_from).transpose()
    }

    async fn save(&mut self, task: &AnalysisTask) -> Result<(), StoreError> {
        let query = bind_update!(sqlx::query(sql::UPDATE_TASK), TaskRow::from(task));
        let result = query.execute(self.conn()?).await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(task.id));
        }
        Ok(())
    }

    async fn set_queue_position(
        &mut self,
        id: Uuid,
        position: Option<u32>,
    ) -> Result<(), StoreError> {
        sqlx::query(sql::SET_QUEUE_POSITION)
            .bind(id)
            .bind(position.map(|p| i32::try_from(p).unwrap_or(i32::MAX)))
            .execute(self.conn()?)
            .await?;
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        let mut conn = self.conn.take().ok_or(StoreError::TransactionClosed)?;
        match sqlx::query("COMMIT").execute(&mut *conn).await {
            Ok(_) => Ok(()),
            Err(e) => {
                // Closing the connection discards the open transaction.
                drop(conn.detach());
                Err(e.into())
            }
        }
    }
}

impl Drop for SqliteTransaction {
    fn drop(&mut self) {
        // An uncommitted connection must not go back to the pool mid-transaction;
        // closing it rolls the transaction back.
        if let Some(conn) = self.conn.take() {
            drop(conn.detach());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::task::{
        AnalysisReport, AnalysisRequest, Ecosystem, ErrorCategory, TaskOptions,
    };
    use tempfile::tempdir;

    async fn open_store(dir: &tempfile::TempDir) -> SqliteTaskStore {
        let path = dir.path().join("tasks.db");
        SqliteTaskStore::open(path.to_str().unwrap()).await.unwrap()
    }

    fn task(name: &str, priority: i32) -> AnalysisTask {
        AnalysisTask::new(
            AnalysisRequest::new(Ecosystem::Npm, name).with_version("1.0.0"),
            TaskOptions::default().with_priority(priority),
        )
    }

    #[tokio::test]
    async fn test_insert_and_get() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir).await;

        let t = task("lodash", 0);
        store.insert(&t).await.unwrap();

        let loaded = store.get(t.id).await.unwrap().unwrap();
        assert_eq!(loaded.id, t.id);
        assert_eq!(loaded.status, TaskStatus::Queued);
        assert_eq!(loaded.purl.as_deref(), Some("pkg:npm/lodash@1.0.0"));
        assert!(store.get(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_queued_order_priority_then_fifo() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir).await;

        let a = task("a", 5);
        let mut b = task("b", 10);
        let mut c = task("c", 5);
        // Same timestamp as `a`; insertion order breaks the tie.
        c.queued_at = a.queued_at;
        b.queued_at = a.queued_at + chrono::Duration::seconds(1);
        for t in [&a, &b, &c] {
            store.insert(t).await.unwrap();
        }

        let mut tx = store.begin().await.unwrap();
        let ordered = tx.query_queued_ordered().await.unwrap();
        let names: Vec<_> = ordered.iter().map(|t| t.package_name.as_str()).collect();
        assert_eq!(names, vec!["b", "a", "c"]);
    }

    #[tokio::test]
    async fn test_retryable_skips_exhausted_failures() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir).await;

        let mut fresh = task("fresh", 0);
        let mut spent = task("spent", 0);
        spent.retry_count = spent.max_retries;
        let queued = task("queued", 0);
        for t in [&mut fresh, &mut spent] {
            t.claim(Utc::now()).unwrap();
            t.fail(
                ErrorCategory::AnalysisFailure,
                "exit 1",
                serde_json::json!({}),
                Utc::now(),
            )
            .unwrap();
        }
        for t in [&fresh, &spent, &queued] {
            store.insert(t).await.unwrap();
        }

        let mut tx = store.begin().await.unwrap();
        let retryable = tx.query_retryable().await.unwrap();
        tx.commit().await.unwrap();
        let ids: Vec<_> = retryable.iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![fresh.id]);
    }

    #[tokio::test]
    async fn test_uncommitted_transaction_rolls_back() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir).await;
        let mut t = task("lodash", 0);
        store.insert(&t).await.unwrap();

        {
            let mut tx = store.begin().await.unwrap();
            t.claim(Utc::now()).unwrap();
            tx.save(&t).await.unwrap();
        }

        let loaded = store.get(t.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, TaskStatus::Queued);

        let mut tx = store.begin().await.unwrap();
        tx.save(&t).await.unwrap();
        tx.commit().await.unwrap();
        assert!(matches!(
            tx.commit().await,
            Err(StoreError::TransactionClosed)
        ));

        let loaded = store.get(t.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, TaskStatus::Running);
    }

    #[tokio::test]
    async fn test_second_running_row_is_rejected() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir).await;
        let mut first = task("first", 0);
        let mut second = task("second", 0);
        store.insert(&first).await.unwrap();
        store.insert(&second).await.unwrap();

        let now = Utc::now();
        first.claim(now).unwrap();
        second.claim(now).unwrap();

        let mut tx = store.begin().await.unwrap();
        tx.save(&first).await.unwrap();
        let err = tx.save(&second).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_completed_by_purl_returns_latest_with_report() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir).await;
        let now = Utc::now();

        let mut older = task("lodash", 0);
        let mut newer = task("lodash", 0);
        let pending = task("lodash", 0);
        for t in [&older, &newer, &pending] {
            store.insert(t).await.unwrap();
        }

        let mut tx = store.begin().await.unwrap();
        older.claim(now).unwrap();
        older
            .complete(AnalysisReport::new(serde_json::json!({"n": 1})), 1.0, None, None, now)
            .unwrap();
        tx.save(&older).await.unwrap();
        newer.claim(now).unwrap();
        newer
            .complete(
                AnalysisReport::new(serde_json::json!({"n": 2})),
                1.0,
                None,
                None,
                now + chrono::Duration::seconds(5),
            )
            .unwrap();
        tx.save(&newer).await.unwrap();

        let found = tx
            .query_completed_by_purl("pkg:npm/lodash@1.0.0", pending.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, newer.id);

        let none = tx
            .query_completed_by_purl("pkg:npm/other@1.0.0", pending.id)
            .await
            .unwrap();
        assert!(none.is_none());
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_older_than_only_matching_status() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir).await;
        let old = Utc::now() - chrono::Duration::days(10);

        let mut done = task("done", 0);
        let queued = task("queued", 0);
        store.insert(&done).await.unwrap();
        store.insert(&queued).await.unwrap();

        done.claim(old).unwrap();
        done.fail(
            crate::scheduler::task::ErrorCategory::AnalysisFailure,
            "boom",
            serde_json::json!({}),
            old,
        )
        .unwrap();
        let mut tx = store.begin().await.unwrap();
        tx.save(&done).await.unwrap();
        tx.commit().await.unwrap();

        let cutoff = Utc::now() - chrono::Duration::days(7);
        assert_eq!(
            store.delete_older_than(TaskStatus::Completed, cutoff).await.unwrap(),
            0
        );
        assert_eq!(
            store.delete_older_than(TaskStatus::Failed, cutoff).await.unwrap(),
            1
        );
        assert!(store.get(queued.id).await.unwrap().is_some());
        assert!(store.get(done.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_filters_by_status() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir).await;
        for name in ["a", "b", "c"] {
            store.insert(&task(name, 0)).await.unwrap();
        }

        let all = store.list(None, 10).await.unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].package_name, "c");

        let running = store.list(Some(TaskStatus::Running), 10).await.unwrap();
        assert!(running.is_empty());

        let limited = store.list(Some(TaskStatus::Queued), 2).await.unwrap();
        assert_eq!(limited.len(), 2);
    }
}
