//! Timeout monitor.
//!
//! Periodic sweep over running tasks. The deadline is anchored to
//! `started_at`; heartbeats only feed the stale-liveness warning. Expired
//! tasks get their container stopped (best-effort) and are failed with
//! `timeout_error`. Each sweep also re-submits retries whose job went
//! missing, then hands the slot on.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::dispatcher::Dispatcher;
use super::retry::DEFAULT_RETRY_GRACE;
use super::task::{AnalysisTask, ErrorCategory, TaskStatus};
use crate::error::Result;

/// Default interval between sweeps.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Heartbeats older than this are reported as stale.
pub const DEFAULT_STALE_HEARTBEAT: Duration = Duration::from_secs(300);

/// Lines of container output logged for a timed-out task.
pub const TIMEOUT_LOG_TAIL: usize = 50;

/// Upper bound on each container side action during a sweep.
const CONTAINER_ACTION_TIMEOUT: Duration = Duration::from_secs(30);

/// What a sweep found and did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Running tasks inspected.
    pub checked: usize,
    /// Tasks failed for exceeding their deadline.
    pub timed_out: Vec<Uuid>,
    /// Running tasks whose heartbeat is older than the stale threshold.
    pub stale_heartbeats: Vec<Uuid>,
    /// Failed tasks whose lost retry job was submitted again.
    pub retries_resubmitted: Vec<Uuid>,
    /// Task submitted by the closing dispatch-next, if any.
    pub dispatched: Option<Uuid>,
}

/// Detects and fails running tasks that overran their deadline.
pub struct TimeoutMonitor {
    dispatcher: Arc<Dispatcher>,
    stale_heartbeat: Duration,
    retry_grace: Duration,
}

impl TimeoutMonitor {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            dispatcher,
            stale_heartbeat: DEFAULT_STALE_HEARTBEAT,
            retry_grace: DEFAULT_RETRY_GRACE,
        }
    }

    pub fn with_stale_heartbeat(mut self, threshold: Duration) -> Self {
        self.stale_heartbeat = threshold;
        self
    }

    /// How long past its due time a retry may stay unhandled before the
    /// sweep submits a new job for it.
    pub fn with_retry_grace(mut self, grace: Duration) -> Self {
        self.retry_grace = grace;
        self
    }

    /// Runs one sweep.
    pub async fn sweep(&self) -> Result<SweepReport> {
        let now = Utc::now();
        let running = {
            let mut tx = self.dispatcher.store().begin().await?;
            let running = tx.query_running().await?;
            tx.commit().await?;
            running
        };

        let mut report = SweepReport {
            checked: running.len(),
            ..Default::default()
        };

        for task in running {
            if !task.is_timed_out(now) {
                if self.heartbeat_is_stale(&task, now) {
                    warn!(
                        task_id = %task.id,
                        last_heartbeat = ?task.last_heartbeat,
                        container_id = ?task.container_id,
                        "Running task has a stale heartbeat"
                    );
                    report.stale_heartbeats.push(task.id);
                }
                continue;
            }

            let task_id = task.id;
            match self.expire(task, now).await {
                Ok(true) => report.timed_out.push(task_id),
                Ok(false) => debug!(task_id = %task_id, "Task left running before it could be expired"),
                Err(e) => error!(task_id = %task_id, error = %e, "Failed to expire timed-out task"),
            }
        }

        match self
            .dispatcher
            .retry_controller()
            .resubmit_overdue(now, self.retry_grace)
            .await
        {
            Ok(resubmitted) => report.retries_resubmitted = resubmitted,
            Err(e) => error!(error = %e, "Overdue retry check failed"),
        }

        match self.dispatcher.dispatch_next().await {
            Ok(dispatched) => report.dispatched = dispatched,
            Err(e) => error!(error = %e, "Dispatch of next task after sweep failed"),
        }

        if !report.timed_out.is_empty() {
            info!(
                checked = report.checked,
                timed_out = report.timed_out.len(),
                "Timeout sweep finished"
            );
        }
        Ok(report)
    }

    fn heartbeat_is_stale(&self, task: &AnalysisTask, now: DateTime<Utc>) -> bool {
        let Ok(threshold) = chrono::Duration::from_std(self.stale_heartbeat) else {
            return false;
        };
        match task.last_heartbeat {
            Some(beat) => now - beat > threshold,
            None => false,
        }
    }

    /// Stops the task's container and records the timeout.
    ///
    /// Returns `false` if the task is no longer running and overdue once the
    /// lock is taken.
    async fn expire(&self, task: AnalysisTask, timed_out_at: DateTime<Utc>) -> Result<bool> {
        let container_stopped = match &task.container_id {
            Some(container_id) => {
                self.log_tail(task.id, container_id).await;
                Some(self.stop_container(task.id, container_id).await)
            }
            None => None,
        };

        let mut tx = self.dispatcher.store().begin().await?;
        let Some(mut current) = tx.lock_for_update(task.id).await? else {
            tx.commit().await?;
            return Ok(false);
        };
        if current.status != TaskStatus::Running || !current.is_timed_out(timed_out_at) {
            tx.commit().await?;
            return Ok(false);
        }

        let details = json!({
            "timeout_minutes": current.timeout_minutes,
            "started_at": current.started_at.map(|t| t.to_rfc3339()),
            "timed_out_at": timed_out_at.to_rfc3339(),
            "container_id": current.container_id,
            "container_stopped": container_stopped,
        });
        let message = format!(
            "Analysis timed out after {} minutes",
            current.timeout_minutes
        );
        current.fail(ErrorCategory::TimeoutError, message, details, Utc::now())?;
        tx.save(&current).await?;
        tx.commit().await?;

        warn!(
            task_id = %current.id,
            package = %current.package_name,
            container_id = ?current.container_id,
            container_stopped = ?container_stopped,
            timeout_minutes = current.timeout_minutes,
            "Task timed out"
        );
        Ok(true)
    }

    async fn stop_container(&self, task_id: Uuid, container_id: &str) -> bool {
        let executor = self.dispatcher.executor();
        match tokio::time::timeout(CONTAINER_ACTION_TIMEOUT, executor.terminate(container_id)).await
        {
            Ok(Ok(())) => {
                info!(task_id = %task_id, container_id = %container_id, "Stopped timed-out container");
                true
            }
            Ok(Err(e)) => {
                warn!(task_id = %task_id, container_id = %container_id, error = %e, "Failed to stop container");
                false
            }
            Err(_) => {
                warn!(task_id = %task_id, container_id = %container_id, "Stopping container timed out");
                false
            }
        }
    }

    async fn log_tail(&self, task_id: Uuid, container_id: &str) {
        let executor = self.dispatcher.executor();
        match tokio::time::timeout(
            CONTAINER_ACTION_TIMEOUT,
            executor.fetch_logs(container_id, TIMEOUT_LOG_TAIL),
        )
        .await
        {
            Ok(Ok(logs)) => warn!(
                task_id = %task_id,
                container_id = %container_id,
                logs = %logs,
                "Output of timed-out container"
            ),
            Ok(Err(e)) => debug!(task_id = %task_id, error = %e, "Could not fetch container logs"),
            Err(_) => debug!(task_id = %task_id, "Fetching container logs timed out"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryResultCache;
    use crate::error::{AnalysisError, ExecutorError};
    use crate::execution::{ContainerExecutor, ExecutionEvents, ExecutionOutput};
    use crate::scheduler::dispatcher::DispatcherConfig;
    use crate::scheduler::queue::MemoryDispatchQueue;
    use crate::scheduler::task::{AnalysisRequest, Ecosystem, TaskOptions};
    use crate::storage::{SqliteTaskStore, TaskStore};
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingExecutor {
        terminated: Mutex<Vec<String>>,
        refuse_terminate: bool,
    }

    #[async_trait]
    impl ContainerExecutor for RecordingExecutor {
        async fn execute(
            &self,
            _task_id: Uuid,
            _request: &AnalysisRequest,
            _events: ExecutionEvents,
        ) -> std::result::Result<ExecutionOutput, AnalysisError> {
            Err(AnalysisError::container("not used"))
        }

        async fn terminate(&self, container_id: &str) -> std::result::Result<(), ExecutorError> {
            self.terminated.lock().unwrap().push(container_id.to_string());
            if self.refuse_terminate {
                return Err(ExecutorError::Unavailable("daemon gone".into()));
            }
            Ok(())
        }

        async fn fetch_logs(
            &self,
            _container_id: &str,
            tail: usize,
        ) -> std::result::Result<String, ExecutorError> {
            Ok(format!("last {tail} lines"))
        }
    }

    async fn setup(
        executor: RecordingExecutor,
    ) -> (tempfile::TempDir, Arc<dyn TaskStore>, Arc<RecordingExecutor>, TimeoutMonitor) {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("timeout.db").display());
        let store: Arc<dyn TaskStore> = Arc::new(SqliteTaskStore::open(&url).await.unwrap());
        let executor = Arc::new(executor);
        let dispatcher = Arc::new(Dispatcher::new(
            store.clone(),
            Arc::new(MemoryResultCache::new()),
            executor.clone(),
            Arc::new(MemoryDispatchQueue::new()),
            DispatcherConfig::default(),
        ));
        (dir, store, executor, TimeoutMonitor::new(dispatcher))
    }

    async fn running_since(
        store: &Arc<dyn TaskStore>,
        minutes_ago: i64,
        container_id: Option<&str>,
    ) -> AnalysisTask {
        let mut task = AnalysisTask::new(
            AnalysisRequest::new(Ecosystem::Npm, "slow").with_version("1.0.0"),
            TaskOptions::default().with_timeout_minutes(1),
        );
        task.claim(Utc::now() - chrono::Duration::minutes(minutes_ago)).unwrap();
        task.container_id = container_id.map(str::to_string);
        store.insert(&task).await.unwrap();
        task
    }

    #[tokio::test]
    async fn test_sweep_fails_overdue_task_and_stops_container() {
        let (_dir, store, executor, monitor) = setup(RecordingExecutor::default()).await;
        let task = running_since(&store, 2, Some("ctr-1")).await;

        let report = monitor.sweep().await.unwrap();
        assert_eq!(report.timed_out, vec![task.id]);

        let failed = store.get(task.id).await.unwrap().unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);
        assert_eq!(failed.error_category, Some(ErrorCategory::TimeoutError));
        assert!(failed.completed_at.is_some());
        let details = failed.error_details.unwrap();
        assert_eq!(details["timeout_minutes"], 1);
        assert_eq!(details["container_id"], "ctr-1");
        assert_eq!(details["container_stopped"], true);
        assert_eq!(*executor.terminated.lock().unwrap(), vec!["ctr-1".to_string()]);
    }

    #[tokio::test]
    async fn test_container_stopped_is_null_without_container() {
        let (_dir, store, executor, monitor) = setup(RecordingExecutor::default()).await;
        let task = running_since(&store, 5, None).await;

        monitor.sweep().await.unwrap();

        let failed = store.get(task.id).await.unwrap().unwrap();
        assert!(failed.error_details.unwrap()["container_stopped"].is_null());
        assert!(executor.terminated.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_termination_still_fails_task() {
        let (_dir, store, _executor, monitor) = setup(RecordingExecutor {
            refuse_terminate: true,
            ..Default::default()
        })
        .await;
        let task = running_since(&store, 2, Some("ctr-2")).await;

        monitor.sweep().await.unwrap();

        let failed = store.get(task.id).await.unwrap().unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);
        assert_eq!(failed.error_details.unwrap()["container_stopped"], false);
    }

    #[tokio::test]
    async fn test_task_within_deadline_is_left_alone() {
        let (_dir, store, executor, monitor) = setup(RecordingExecutor::default()).await;
        let task = running_since(&store, 0, Some("ctr-3")).await;

        let report = monitor.sweep().await.unwrap();
        assert_eq!(report.checked, 1);
        assert!(report.timed_out.is_empty());
        assert_eq!(
            store.get(task.id).await.unwrap().unwrap().status,
            TaskStatus::Running
        );
        assert!(executor.terminated.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stale_heartbeat_is_reported() {
        let (_dir, store, _executor, monitor) = setup(RecordingExecutor::default()).await;
        let mut task = AnalysisTask::new(
            AnalysisRequest::new(Ecosystem::Pypi, "quiet").with_version("0.1"),
            TaskOptions::default().with_timeout_minutes(60),
        );
        task.claim(Utc::now() - chrono::Duration::minutes(10)).unwrap();
        store.insert(&task).await.unwrap();

        let report = monitor.sweep().await.unwrap();
        assert_eq!(report.stale_heartbeats, vec![task.id]);
        assert!(report.timed_out.is_empty());
    }

    #[tokio::test]
    async fn test_sweep_resubmits_lost_retry_once() {
        let (_dir, store, _executor, monitor) = setup(RecordingExecutor::default()).await;
        let monitor = monitor.with_retry_grace(Duration::ZERO);

        let failed_at = Utc::now() - chrono::Duration::minutes(5);
        let mut lost = AnalysisTask::new(
            AnalysisRequest::new(Ecosystem::Npm, "lost").with_version("1.0.0"),
            TaskOptions::default(),
        );
        lost.claim(failed_at - chrono::Duration::minutes(1)).unwrap();
        lost.fail(ErrorCategory::AnalysisFailure, "exit 1", json!({}), failed_at)
            .unwrap();
        let mut spent = lost.clone();
        spent.id = Uuid::new_v4();
        spent.retry_count = spent.max_retries;
        store.insert(&lost).await.unwrap();
        store.insert(&spent).await.unwrap();

        let report = monitor.sweep().await.unwrap();
        assert_eq!(report.retries_resubmitted, vec![lost.id]);

        let report = monitor.sweep().await.unwrap();
        assert!(report.retries_resubmitted.is_empty());
        assert_eq!(
            store.get(lost.id).await.unwrap().unwrap().status,
            TaskStatus::Failed
        );
    }
}
