//! Retry controller.
//!
//! Failed runs are recorded as a failure snapshot first. If the task still
//! has retries left a delayed [`DispatchKind::Retry`] job is submitted; when
//! it fires the task is moved `failed -> queued` (the one backwards edge of
//! the state machine, taken only here) and attempted again under the same id.
//!
//! A retry job that never reached the queue, or was dropped by a worker, is
//! found again by [`RetryController::resubmit_overdue`], which the timeout
//! sweep runs every time.
//!
//! [`DispatchKind::Retry`]: super::queue::DispatchKind::Retry

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{error, info, warn};
use uuid::Uuid;

use super::queue::{DispatchJob, DispatchKind, DispatchQueue, QueueError};
use super::task::{AnalysisTask, TaskStatus, DEFAULT_MAX_RETRIES};
use crate::error::{Result, SchedulerError};
use crate::storage::TaskStore;

/// Default delay before the first retry.
pub const DEFAULT_RETRY_BASE_DELAY: Duration = Duration::from_secs(60);

/// Time past a retry's due time after which its job counts as lost.
pub const DEFAULT_RETRY_GRACE: Duration = Duration::from_secs(300);

/// Longest shift applied to the base delay.
const MAX_BACKOFF_EXPONENT: u32 = 16;

/// Submissions tried for one retry job before it is left to the sweep.
const SUBMIT_ATTEMPTS: u32 = 3;

/// Pause after the first failed submission, doubled after each one.
const SUBMIT_PAUSE: Duration = Duration::from_millis(200);

/// Exponential backoff policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delay before the first retry; doubled for every retry already taken.
    pub base_delay: Duration,
    /// Retries granted to newly enqueued tasks.
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: DEFAULT_RETRY_BASE_DELAY,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt_index` (0-based).
    pub fn delay_for(&self, attempt_index: u32) -> Duration {
        let factor = 1u32 << attempt_index.min(MAX_BACKOFF_EXPONENT);
        self.base_delay.saturating_mul(factor)
    }
}

/// What the controller decided for a failed task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// A retry job was submitted and fires after `delay`.
    Scheduled { delay: Duration, attempt: u32 },
    /// The retry job could not be submitted. The task stays failed with its
    /// retry intact until the sweep re-submits it.
    Unsubmitted,
    /// Retries are used up; the failure stands.
    Exhausted,
    /// The task is not in a retryable state (gone, or not failed).
    NotApplicable,
}

/// Records failures and schedules deferred re-attempts.
#[derive(Clone)]
pub struct RetryController {
    store: Arc<dyn TaskStore>,
    queue: Arc<dyn DispatchQueue>,
    policy: RetryPolicy,
}

impl RetryController {
    pub fn new(
        store: Arc<dyn TaskStore>,
        queue: Arc<dyn DispatchQueue>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            store,
            queue,
            policy,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Persists the failure snapshot for a task that is still running.
    ///
    /// Returns the task as it stands afterwards. A task that was already
    /// moved on (for instance failed by the timeout monitor) is returned
    /// untouched.
    pub async fn record_failure(
        &self,
        task_id: Uuid,
        error: &SchedulerError,
    ) -> Result<Option<AnalysisTask>> {
        let mut tx = self.store.begin().await?;
        let Some(mut task) = tx.lock_for_update(task_id).await? else {
            tx.commit().await?;
            warn!(task_id = %task_id, "Failed task no longer exists");
            return Ok(None);
        };

        if task.status != TaskStatus::Running {
            tx.commit().await?;
            info!(
                task_id = %task_id,
                status = %task.status,
                error = %error,
                "Failure arrived after task left running, keeping existing outcome"
            );
            return Ok(Some(task));
        }

        task.fail(error.category(), error.message(), error.details(), Utc::now())?;
        tx.save(&task).await?;
        tx.commit().await?;

        warn!(
            task_id = %task_id,
            category = %task.error_category.unwrap_or_default(),
            retry_count = task.retry_count,
            error = %error,
            "Analysis failed"
        );
        Ok(Some(task))
    }

    /// Submits a delayed retry when `task` is failed and has retries left.
    pub async fn schedule(&self, task: &AnalysisTask) -> Result<RetryDecision> {
        if task.status != TaskStatus::Failed {
            return Ok(RetryDecision::NotApplicable);
        }

        if !task.can_retry() {
            warn!(
                task_id = %task.id,
                retry_count = task.retry_count,
                max_retries = task.max_retries,
                "Retries exhausted, failure is final"
            );
            return Ok(RetryDecision::Exhausted);
        }

        let delay = self.policy.delay_for(task.retry_count);
        if let Err(e) = self.submit_retry(task.id, delay).await {
            error!(
                task_id = %task.id,
                error = %e,
                "Retry job could not be submitted, leaving it to the timeout sweep"
            );
            return Ok(RetryDecision::Unsubmitted);
        }

        info!(
            task_id = %task.id,
            delay_secs = delay.as_secs(),
            attempt = task.retry_count + 1,
            max_retries = task.max_retries,
            "Retry scheduled"
        );
        Ok(RetryDecision::Scheduled {
            delay,
            attempt: task.retry_count + 1,
        })
    }

    async fn submit_retry(&self, task_id: Uuid, delay: Duration) -> std::result::Result<(), QueueError> {
        let mut pause = SUBMIT_PAUSE;
        let mut attempt = 1;
        loop {
            match self.queue.submit(DispatchJob::retry(task_id).delayed(delay)).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < SUBMIT_ATTEMPTS => {
                    warn!(task_id = %task_id, attempt, error = %e, "Retry submit failed, trying again");
                    tokio::time::sleep(pause).await;
                    pause = pause.saturating_mul(2);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Submits a retry job for every failed task whose retry is more than
    /// `grace` past due and has no retry job waiting.
    ///
    /// Returns the ids of the tasks a job was submitted for.
    pub async fn resubmit_overdue(
        &self,
        now: DateTime<Utc>,
        grace: Duration,
    ) -> Result<Vec<Uuid>> {
        let candidates = {
            let mut tx = self.store.begin().await?;
            let candidates = tx.query_retryable().await?;
            tx.commit().await?;
            candidates
        };

        let mut resubmitted = Vec::new();
        for task in candidates {
            if !self.retry_overdue(&task, now, grace) {
                continue;
            }
            match self.queue.has_pending(task.id, DispatchKind::Retry).await {
                Ok(false) => {}
                Ok(true) => continue,
                Err(e) => {
                    warn!(task_id = %task.id, error = %e, "Could not inspect queue for retry job");
                    continue;
                }
            }
            match self.queue.submit(DispatchJob::retry(task.id)).await {
                Ok(()) => {
                    warn!(
                        task_id = %task.id,
                        retry_count = task.retry_count,
                        "Overdue retry re-submitted"
                    );
                    resubmitted.push(task.id);
                }
                Err(e) => error!(task_id = %task.id, error = %e, "Failed to re-submit overdue retry"),
            }
        }
        Ok(resubmitted)
    }

    fn retry_overdue(&self, task: &AnalysisTask, now: DateTime<Utc>, grace: Duration) -> bool {
        let Some(failed_at) = task.completed_at else {
            return false;
        };
        let wait = self.policy.delay_for(task.retry_count).saturating_add(grace);
        chrono::Duration::from_std(wait)
            .ok()
            .and_then(|wait| failed_at.checked_add_signed(wait))
            .is_some_and(|due| due <= now)
    }

    /// Moves a failed task back to `queued` so it can be attempted again.
    ///
    /// Returns `false` when the task is gone, no longer failed, or out of
    /// retries; the caller then has nothing to attempt.
    pub async fn requeue(&self, task_id: Uuid) -> Result<bool> {
        let mut tx = self.store.begin().await?;
        let Some(mut task) = tx.lock_for_update(task_id).await? else {
            tx.commit().await?;
            return Ok(false);
        };

        if task.status != TaskStatus::Failed || !task.can_retry() {
            tx.commit().await?;
            info!(
                task_id = %task_id,
                status = %task.status,
                "Retry no longer applicable"
            );
            return Ok(false);
        }

        task.requeue_for_retry()?;
        tx.save(&task).await?;
        tx.commit().await?;

        info!(task_id = %task_id, retry_count = task.retry_count, "Task re-queued for retry");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AnalysisError;
    use crate::scheduler::queue::{DispatchKind, MemoryDispatchQueue};
    use crate::scheduler::task::{AnalysisRequest, Ecosystem, ErrorCategory, TaskOptions};
    use crate::storage::SqliteTaskStore;

    #[test]
    fn test_backoff_doubles() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(0), Duration::from_secs(60));
        assert_eq!(policy.delay_for(1), Duration::from_secs(120));
        assert_eq!(policy.delay_for(3), Duration::from_secs(480));
        assert_eq!(policy.max_retries, 1);
    }

    #[test]
    fn test_backoff_saturates() {
        let policy = RetryPolicy {
            base_delay: Duration::from_secs(u64::MAX / 2),
            max_retries: 100,
        };
        assert_eq!(policy.delay_for(99), Duration::MAX);
    }

    async fn setup() -> (
        tempfile::TempDir,
        Arc<dyn TaskStore>,
        Arc<MemoryDispatchQueue>,
        RetryController,
    ) {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("retry.db").display());
        let store: Arc<dyn TaskStore> = Arc::new(SqliteTaskStore::open(&url).await.unwrap());
        let queue = Arc::new(MemoryDispatchQueue::new());
        let controller = RetryController::new(store.clone(), queue.clone(), RetryPolicy::default());
        (dir, store, queue, controller)
    }

    async fn running_task(store: &Arc<dyn TaskStore>) -> AnalysisTask {
        let mut task = AnalysisTask::new(
            AnalysisRequest::new(Ecosystem::Pypi, "requests").with_version("2.31.0"),
            TaskOptions::default(),
        );
        task.claim(Utc::now()).unwrap();
        store.insert(&task).await.unwrap();
        task
    }

    #[tokio::test]
    async fn test_failure_snapshot_and_retry_cycle() {
        let (_dir, store, queue, controller) = setup().await;
        let task = running_task(&store).await;

        let error = SchedulerError::Analysis(AnalysisError::analysis_failure("exit 1"));
        let failed = controller.record_failure(task.id, &error).await.unwrap().unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);
        assert_eq!(failed.error_category, Some(ErrorCategory::AnalysisFailure));
        assert!(failed.completed_at.is_some());

        let decision = controller.schedule(&failed).await.unwrap();
        assert_eq!(
            decision,
            RetryDecision::Scheduled {
                delay: Duration::from_secs(60),
                attempt: 1
            }
        );
        let jobs = queue.pending();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].kind, DispatchKind::Retry);
        assert!(jobs[0].not_before - jobs[0].enqueued_at >= chrono::Duration::seconds(60));

        assert!(controller.requeue(task.id).await.unwrap());
        let requeued = store.get(task.id).await.unwrap().unwrap();
        assert_eq!(requeued.status, TaskStatus::Queued);
        assert_eq!(requeued.retry_count, 1);
        assert_eq!(requeued.queued_at, task.queued_at);
        assert!(requeued.error_message.is_none());

        // A second requeue finds the task queued and does nothing.
        assert!(!controller.requeue(task.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_exhausted_retries_are_final() {
        let (_dir, store, queue, controller) = setup().await;
        let mut task = running_task(&store).await;
        task.retry_count = 1;
        let mut tx = store.begin().await.unwrap();
        tx.save(&task).await.unwrap();
        tx.commit().await.unwrap();

        let error = SchedulerError::InvalidRequest("boom".into());
        let failed = controller.record_failure(task.id, &error).await.unwrap().unwrap();
        assert_eq!(failed.error_category, Some(ErrorCategory::UnknownError));
        assert_eq!(controller.schedule(&failed).await.unwrap(), RetryDecision::Exhausted);
        assert!(queue.pending().is_empty());
        assert!(!controller.requeue(task.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_late_failure_keeps_existing_outcome() {
        let (_dir, store, _queue, controller) = setup().await;
        let mut task = running_task(&store).await;
        task.fail(
            ErrorCategory::TimeoutError,
            "timed out",
            serde_json::json!({}),
            Utc::now(),
        )
        .unwrap();
        let mut tx = store.begin().await.unwrap();
        tx.save(&task).await.unwrap();
        tx.commit().await.unwrap();

        let error = SchedulerError::Analysis(AnalysisError::container("killed"));
        let current = controller.record_failure(task.id, &error).await.unwrap().unwrap();
        assert_eq!(current.error_category, Some(ErrorCategory::TimeoutError));
        assert_eq!(current.error_message.as_deref(), Some("timed out"));
    }
}
