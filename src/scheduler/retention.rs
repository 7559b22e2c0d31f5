//! Retention sweeper: purges old terminal tasks.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::info;

use super::task::TaskStatus;
use crate::storage::{StoreError, TaskStore};

/// Default age after which terminal tasks are deleted.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Default interval between retention sweeps.
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Rows removed by one cleanup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetentionReport {
    pub deleted_completed: u64,
    pub deleted_failed: u64,
}

impl RetentionReport {
    pub fn total(&self) -> u64 {
        self.deleted_completed + self.deleted_failed
    }
}

/// Deletes completed and failed tasks whose `completed_at` is past retention.
///
/// Terminal tasks are never mutated again, so this runs without coordinating
/// with the dispatcher.
#[derive(Clone)]
pub struct RetentionSweeper {
    store: Arc<dyn TaskStore>,
    retention: Duration,
}

impl RetentionSweeper {
    pub fn new(store: Arc<dyn TaskStore>, retention: Duration) -> Self {
        Self { store, retention }
    }

    pub async fn cleanup(&self) -> Result<RetentionReport, StoreError> {
        let now = Utc::now();
        // A retention reaching before the earliest representable time keeps
        // everything.
        let Some(cutoff) = chrono::Duration::from_std(self.retention)
            .ok()
            .and_then(|retention| now.checked_sub_signed(retention))
        else {
            return Ok(RetentionReport::default());
        };

        let report = RetentionReport {
            deleted_completed: self
                .store
                .delete_older_than(TaskStatus::Completed, cutoff)
                .await?,
            deleted_failed: self
                .store
                .delete_older_than(TaskStatus::Failed, cutoff)
                .await?,
        };

        if report.total() > 0 {
            info!(
                deleted_completed = report.deleted_completed,
                deleted_failed = report.deleted_failed,
                cutoff = %cutoff,
                "Old tasks purged"
            );
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::task::{
        AnalysisReport, AnalysisRequest, AnalysisTask, Ecosystem, ErrorCategory, TaskOptions,
    };
    use crate::storage::SqliteTaskStore;

    fn aged(name: &str, days_ago: i64, completed: bool) -> AnalysisTask {
        let then = Utc::now() - chrono::Duration::days(days_ago);
        let mut task = AnalysisTask::new(
            AnalysisRequest::new(Ecosystem::Npm, name).with_version("1.0.0"),
            TaskOptions::default(),
        );
        task.claim(then).unwrap();
        if completed {
            task.complete(AnalysisReport::new(serde_json::json!({})), 1.0, None, None, then)
                .unwrap();
        } else {
            task.fail(ErrorCategory::AnalysisFailure, "boom", serde_json::json!({}), then)
                .unwrap();
        }
        task
    }

    #[tokio::test]
    async fn test_cleanup_deletes_only_old_terminal_tasks() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("retention.db").display());
        let store: Arc<dyn TaskStore> = Arc::new(SqliteTaskStore::open(&url).await.unwrap());

        let old_done = aged("old-done", 8, true);
        let old_failed = aged("old-failed", 10, false);
        let fresh_done = aged("fresh-done", 1, true);
        let queued = AnalysisTask::new(
            AnalysisRequest::new(Ecosystem::Npm, "queued"),
            TaskOptions::default(),
        );
        for task in [&old_done, &old_failed, &fresh_done, &queued] {
            store.insert(task).await.unwrap();
        }

        let sweeper = RetentionSweeper::new(store.clone(), DEFAULT_RETENTION);
        let report = sweeper.cleanup().await.unwrap();
        assert_eq!(
            report,
            RetentionReport {
                deleted_completed: 1,
                deleted_failed: 1
            }
        );
        assert_eq!(report.total(), 2);

        assert!(store.get(old_done.id).await.unwrap().is_none());
        assert!(store.get(old_failed.id).await.unwrap().is_none());
        assert!(store.get(fresh_done.id).await.unwrap().is_some());
        assert!(store.get(queued.id).await.unwrap().is_some());

        assert_eq!(sweeper.cleanup().await.unwrap().total(), 0);
    }

    #[tokio::test]
    async fn test_retention_beyond_calendar_keeps_everything() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("retention.db").display());
        let store: Arc<dyn TaskStore> = Arc::new(SqliteTaskStore::open(&url).await.unwrap());
        let ancient = aged("ancient", 3650, true);
        store.insert(&ancient).await.unwrap();

        // Fits a chrono duration but reaches before the earliest date.
        let retention = Duration::from_secs(280_000 * 365 * 86_400);
        let sweeper = RetentionSweeper::new(store.clone(), retention);
        assert_eq!(sweeper.cleanup().await.unwrap(), RetentionReport::default());
        assert!(store.get(ancient.id).await.unwrap().is_some());

        let sweeper = RetentionSweeper::new(store.clone(), Duration::from_secs(u64::MAX));
        assert_eq!(sweeper.cleanup().await.unwrap().total(), 0);
    }
}
