//! Dispatcher: the single-flight scheduling engine.
//!
//! An attempt claims the global execution slot for one queued task inside a
//! store transaction, releases the lock, and only then runs the analysis. The
//! "is anything else running" check and the claim share that transaction, so
//! two racing attempts can never both start a run. Every attempt that gives
//! up the slot ends with [`Dispatcher::dispatch_next`], which hands the slot
//! to the head of the queue.
//!
//! ```text
//!   attempt(id)
//!     ├─ other task running ──────────────► defer (30s)
//!     ├─ completed / running / failed ────► no-op
//!     ├─ completed task with same purl ───► reuse report ─► dispatch_next
//!     └─ claim ─► cache hit? ─► executor ─► success ─► cache + persist ─► dispatch_next
//!                                        └► failure ─► retry controller ─► dispatch_next
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::json;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::positions::QueueMaintainer;
use super::queue::{DispatchJob, DispatchKind, DispatchQueue};
use super::retry::{RetryController, RetryDecision, RetryPolicy};
use super::task::{AnalysisReport, AnalysisRequest, AnalysisTask, ErrorCategory, TaskStatus};
use crate::cache::{CacheKey, ResultCache, DEFAULT_CACHE_TTL};
use crate::error::{AnalysisError, Result, SchedulerError};
use crate::execution::{ContainerExecutor, ExecutionEvent, ExecutionEvents, ExecutionOutput};
use crate::storage::{StoreError, TaskStore};

/// Delay before an attempt blocked by another running task is tried again.
pub const DEFAULT_CONTENTION_DELAY: Duration = Duration::from_secs(30);

/// Interval between heartbeat refreshes while an analysis runs.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Slack past a task's own timeout before the dispatcher stops waiting.
pub const DEFAULT_EXECUTION_GRACE: Duration = Duration::from_secs(60);

/// Duration recorded for tasks completed from the result cache.
pub const CACHE_HIT_DURATION_SECS: f64 = 0.1;

/// Tunables for the dispatcher.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub contention_delay: Duration,
    pub heartbeat_interval: Duration,
    /// Added to a task's timeout to get the hard deadline of the executor call.
    pub execution_grace: Duration,
    pub cache_ttl: Duration,
    /// Base of report download links; no link is recorded when unset.
    pub base_url: Option<String>,
    pub retry: RetryPolicy,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            contention_delay: DEFAULT_CONTENTION_DELAY,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            execution_grace: DEFAULT_EXECUTION_GRACE,
            cache_ttl: DEFAULT_CACHE_TTL,
            base_url: None,
            retry: RetryPolicy::default(),
        }
    }
}

impl DispatcherConfig {
    pub fn with_contention_delay(mut self, delay: Duration) -> Self {
        self.contention_delay = delay;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_execution_grace(mut self, grace: Duration) -> Self {
        self.execution_grace = grace;
        self
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    /// Download link for a report, when a base URL is configured.
    pub fn download_url(&self, report_id: Uuid) -> Option<String> {
        self.base_url
            .as_ref()
            .map(|base| format!("{}/reports/{}/download", base.trim_end_matches('/'), report_id))
    }
}

/// Result of a single dispatcher attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    /// No task with that id exists.
    NotFound,
    /// Another task holds the slot; the attempt was re-submitted after `delay`.
    Deferred { delay: Duration },
    /// The task was already completed; its report is returned unchanged.
    AlreadyCompleted { report: Option<AnalysisReport> },
    /// The task is already running (duplicate delivery).
    AlreadyRunning,
    /// The task is not in a state this job acts on.
    Skipped,
    /// Completed by copying the report of an earlier task with the same purl.
    Reused { source: Uuid },
    /// The analysis ran (or was served from the cache) and was recorded.
    Completed { report_id: Uuid, from_cache: bool },
    /// The run finished after the task had already been failed elsewhere.
    Discarded,
    /// The run failed; `retry` says what happens next.
    Failed {
        category: ErrorCategory,
        retry: RetryDecision,
    },
}

impl AttemptOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            AttemptOutcome::NotFound => "not_found",
            AttemptOutcome::Deferred { .. } => "deferred",
            AttemptOutcome::AlreadyCompleted { .. } => "already_completed",
            AttemptOutcome::AlreadyRunning => "already_running",
            AttemptOutcome::Skipped => "skipped",
            AttemptOutcome::Reused { .. } => "reused",
            AttemptOutcome::Completed { .. } => "completed",
            AttemptOutcome::Discarded => "discarded",
            AttemptOutcome::Failed { .. } => "failed",
        }
    }

    /// Returns whether the attempt ended in a failed run.
    pub fn is_failure(&self) -> bool {
        matches!(self, AttemptOutcome::Failed { .. })
    }
}

enum Claim {
    Ready(AnalysisTask),
    Done(AttemptOutcome),
}

/// Scheduling engine shared by all workers of a process.
pub struct Dispatcher {
    store: Arc<dyn TaskStore>,
    cache: Arc<dyn ResultCache>,
    executor: Arc<dyn ContainerExecutor>,
    queue: Arc<dyn DispatchQueue>,
    maintainer: QueueMaintainer,
    retry: RetryController,
    config: DispatcherConfig,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn TaskStore>,
        cache: Arc<dyn ResultCache>,
        executor: Arc<dyn ContainerExecutor>,
        queue: Arc<dyn DispatchQueue>,
        config: DispatcherConfig,
    ) -> Self {
        let maintainer = QueueMaintainer::new(store.clone());
        let retry = RetryController::new(store.clone(), queue.clone(), config.retry);
        Self {
            store,
            cache,
            executor,
            queue,
            maintainer,
            retry,
            config,
        }
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    pub fn queue(&self) -> &Arc<dyn DispatchQueue> {
        &self.queue
    }

    pub fn executor(&self) -> &Arc<dyn ContainerExecutor> {
        &self.executor
    }

    pub fn maintainer(&self) -> &QueueMaintainer {
        &self.maintainer
    }

    pub fn retry_controller(&self) -> &RetryController {
        &self.retry
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Runs the action a dispatch job asks for.
    pub async fn handle(&self, job: &DispatchJob) -> Result<AttemptOutcome> {
        match job.kind {
            DispatchKind::Attempt => self.attempt(job.task_id).await,
            DispatchKind::Retry => self.retry(job.task_id).await,
        }
    }

    /// Advances a task to running (and on to a terminal state), or defers it.
    pub async fn attempt(&self, task_id: Uuid) -> Result<AttemptOutcome> {
        let task = match self.claim(task_id).await? {
            Claim::Ready(task) => task,
            Claim::Done(outcome @ AttemptOutcome::Reused { .. }) => {
                self.maintainer.refresh().await;
                self.dispatch_next_logged().await;
                return Ok(outcome);
            }
            Claim::Done(outcome) => return Ok(outcome),
        };

        info!(
            task_id = %task.id,
            ecosystem = %task.ecosystem,
            package = %task.package_name,
            version = task.package_version.as_deref().unwrap_or("latest"),
            retry_count = task.retry_count,
            "Task claimed"
        );
        self.maintainer.refresh().await;

        self.run(task).await
    }

    /// Re-queues a failed task whose retry delay elapsed and attempts it.
    pub async fn retry(&self, task_id: Uuid) -> Result<AttemptOutcome> {
        if !self.retry.requeue(task_id).await? {
            return Ok(AttemptOutcome::Skipped);
        }
        self.maintainer.refresh().await;
        self.attempt(task_id).await
    }

    /// Hands the free execution slot to the head of the queue.
    ///
    /// Queued tasks that can be completed from an earlier result are resolved
    /// on the spot; the first one that needs a run is submitted as an attempt.
    /// Returns the id of the submitted task, if any.
    pub async fn dispatch_next(&self) -> Result<Option<Uuid>> {
        loop {
            let mut tx = self.store.begin().await?;

            if !tx.query_running().await?.is_empty() {
                tx.commit().await?;
                debug!("Execution slot busy, nothing to dispatch");
                return Ok(None);
            }

            let Some(mut next) = tx.query_queued_ordered().await?.into_iter().next() else {
                tx.commit().await?;
                debug!("Queue empty");
                return Ok(None);
            };

            let reusable = match next.purl.clone() {
                Some(purl) => tx.query_completed_by_purl(&purl, next.id).await?,
                None => None,
            };

            match reusable {
                Some(source) => {
                    next.reuse_from(&source, Utc::now())?;
                    tx.save(&next).await?;
                    tx.commit().await?;
                    info!(
                        task_id = %next.id,
                        source_task = %source.id,
                        "Queued task resolved from earlier result"
                    );
                    self.maintainer.refresh().await;
                }
                None => {
                    tx.commit().await?;
                    self.queue.submit(DispatchJob::attempt(next.id)).await?;
                    debug!(task_id = %next.id, priority = next.priority, "Next task submitted");
                    return Ok(Some(next.id));
                }
            }
        }
    }

    /// [`dispatch_next`](Self::dispatch_next), logging instead of failing.
    pub(crate) async fn dispatch_next_logged(&self) {
        if let Err(e) = self.dispatch_next().await {
            error!(error = %e, "Dispatch of next task failed");
        }
    }

    async fn claim(&self, task_id: Uuid) -> Result<Claim> {
        let mut tx = self.store.begin().await?;

        let Some(mut task) = tx.lock_for_update(task_id).await? else {
            tx.commit().await?;
            warn!(task_id = %task_id, "Dispatch attempt for unknown task");
            return Ok(Claim::Done(AttemptOutcome::NotFound));
        };

        match task.status {
            TaskStatus::Queued => {}
            TaskStatus::Completed => {
                tx.commit().await?;
                debug!(task_id = %task_id, "Task already completed");
                return Ok(Claim::Done(AttemptOutcome::AlreadyCompleted {
                    report: task.report,
                }));
            }
            TaskStatus::Running => {
                tx.commit().await?;
                debug!(task_id = %task_id, "Task already running");
                return Ok(Claim::Done(AttemptOutcome::AlreadyRunning));
            }
            TaskStatus::Failed => {
                tx.commit().await?;
                debug!(task_id = %task_id, "Failed task is not re-queued, skipping");
                return Ok(Claim::Done(AttemptOutcome::Skipped));
            }
        }

        let other_running = tx
            .query_running()
            .await?
            .into_iter()
            .find(|running| running.id != task_id)
            .map(|running| running.id);
        if let Some(running) = other_running {
            tx.commit().await?;
            return self.defer(task_id, Some(running)).await.map(Claim::Done);
        }

        if let Some(purl) = task.purl.clone() {
            if let Some(source) = tx.query_completed_by_purl(&purl, task_id).await? {
                task.reuse_from(&source, Utc::now())?;
                tx.save(&task).await?;
                tx.commit().await?;
                info!(
                    task_id = %task_id,
                    source_task = %source.id,
                    purl = %purl,
                    "Reused completed analysis"
                );
                return Ok(Claim::Done(AttemptOutcome::Reused { source: source.id }));
            }
        }

        task.claim(Utc::now())?;
        match tx.save(&task).await {
            Ok(()) => {}
            // The store's single-running constraint caught a racing claim.
            Err(StoreError::Conflict(reason)) => {
                drop(tx);
                debug!(task_id = %task_id, reason = %reason, "Claim lost to a concurrent attempt");
                return self.defer(task_id, None).await.map(Claim::Done);
            }
            Err(e) => return Err(e.into()),
        }
        tx.commit().await?;

        Ok(Claim::Ready(task))
    }

    async fn defer(&self, task_id: Uuid, running: Option<Uuid>) -> Result<AttemptOutcome> {
        let delay = self.config.contention_delay;
        self.queue
            .submit(DispatchJob::attempt(task_id).delayed(delay))
            .await?;
        debug!(
            task_id = %task_id,
            running_task = ?running,
            delay_secs = delay.as_secs(),
            "Execution slot busy, attempt deferred"
        );
        Ok(AttemptOutcome::Deferred { delay })
    }

    /// Runs a claimed task: cache first, then the executor.
    async fn run(&self, task: AnalysisTask) -> Result<AttemptOutcome> {
        let request = task.request();
        // Local artifacts have no stable identity to cache under.
        let cache_key = request
            .local_artifact
            .is_none()
            .then(|| CacheKey::for_request(&request));

        if let Some(key) = &cache_key {
            match self.cache.get(key).await {
                Ok(Some(report)) => {
                    info!(task_id = %task.id, cache_key = %key, "Result cache hit");
                    return self
                        .finish_success(task.id, report, CACHE_HIT_DURATION_SECS, None, true)
                        .await;
                }
                Ok(None) => debug!(task_id = %task.id, cache_key = %key, "Result cache miss"),
                Err(e) => warn!(
                    task_id = %task.id,
                    cache_key = %key,
                    error = %e,
                    "Result cache lookup failed, running analysis"
                ),
            }
        }

        let started = Instant::now();
        let (result, observed_container) = self.execute_supervised(&task, &request).await;

        match result {
            Ok(ExecutionOutput { data, container_id }) => {
                let duration = started.elapsed().as_secs_f64();
                let report = AnalysisReport::new(data);

                if let Some(key) = &cache_key {
                    if let Err(e) = self.cache.set(key, &report, self.config.cache_ttl).await {
                        warn!(task_id = %task.id, cache_key = %key, error = %e, "Failed to cache report");
                    }
                }

                let container_id = container_id.or(observed_container);
                self.finish_success(task.id, report, duration, container_id, false)
                    .await
            }
            Err(err) => {
                self.finish_failure(task.id, SchedulerError::Analysis(err))
                    .await
            }
        }
    }

    /// Calls the executor while refreshing the heartbeat.
    ///
    /// Returns the executor result and the container id reported through the
    /// event channel. Gives up (and stops the container) once the task's
    /// timeout plus the configured grace has passed.
    async fn execute_supervised(
        &self,
        task: &AnalysisTask,
        request: &AnalysisRequest,
    ) -> (std::result::Result<ExecutionOutput, AnalysisError>, Option<String>) {
        let (events, mut rx) = ExecutionEvents::channel();
        let execution = self.executor.execute(task.id, request, events);
        tokio::pin!(execution);

        let deadline = tokio::time::sleep(task.timeout() + self.config.execution_grace);
        tokio::pin!(deadline);

        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick completes immediately; the claim already set the heartbeat.
        heartbeat.tick().await;

        let mut container_id: Option<String> = None;
        let mut events_open = true;

        loop {
            tokio::select! {
                result = &mut execution => return (result, container_id),
                event = rx.recv(), if events_open => {
                    match event {
                        Some(ExecutionEvent::ContainerStarted { container_id: id }) => {
                            debug!(task_id = %task.id, container_id = %id, "Analysis container started");
                            self.heartbeat(task.id, Some(&id)).await;
                            container_id = Some(id);
                        }
                        None => events_open = false,
                    }
                }
                _ = heartbeat.tick() => {
                    self.heartbeat(task.id, container_id.as_deref()).await;
                }
                _ = &mut deadline => {
                    warn!(
                        task_id = %task.id,
                        container_id = ?container_id,
                        timeout_minutes = task.timeout_minutes,
                        "Analysis overran its deadline, abandoning run"
                    );
                    if let Some(id) = &container_id {
                        if let Err(e) = self.executor.terminate(id).await {
                            warn!(task_id = %task.id, container_id = %id, error = %e, "Failed to stop container");
                        }
                    }
                    let err = AnalysisError::timeout(format!(
                        "Analysis exceeded {} minutes",
                        task.timeout_minutes
                    ))
                    .with_details(json!({
                        "timeout_minutes": task.timeout_minutes,
                        "container_id": container_id,
                    }));
                    return (Err(err), container_id);
                }
            }
        }
    }

    async fn heartbeat(&self, task_id: Uuid, container_id: Option<&str>) {
        if let Err(e) = self.try_heartbeat(task_id, container_id).await {
            warn!(task_id = %task_id, error = %e, "Failed to refresh heartbeat");
        }
    }

    async fn try_heartbeat(
        &self,
        task_id: Uuid,
        container_id: Option<&str>,
    ) -> std::result::Result<(), StoreError> {
        let mut tx = self.store.begin().await?;
        if let Some(mut task) = tx.lock_for_update(task_id).await? {
            if task.touch_heartbeat(Utc::now(), container_id) {
                tx.save(&task).await?;
            }
        }
        tx.commit().await
    }

    /// Records a successful run, then hands the slot on.
    async fn finish_success(
        &self,
        task_id: Uuid,
        report: AnalysisReport,
        duration_seconds: f64,
        container_id: Option<String>,
        from_cache: bool,
    ) -> Result<AttemptOutcome> {
        let report_id = report.id;

        match self
            .persist_success(task_id, report, duration_seconds, container_id)
            .await
        {
            Ok(true) => {
                info!(
                    task_id = %task_id,
                    report_id = %report_id,
                    duration_secs = duration_seconds,
                    from_cache = from_cache,
                    "Analysis completed"
                );
                self.dispatch_next_logged().await;
                Ok(AttemptOutcome::Completed {
                    report_id,
                    from_cache,
                })
            }
            Ok(false) => {
                warn!(
                    task_id = %task_id,
                    report_id = %report_id,
                    "Result arrived after task left running, not recorded on the task"
                );
                self.dispatch_next_logged().await;
                Ok(AttemptOutcome::Discarded)
            }
            Err(err) => {
                let err = match err {
                    SchedulerError::Store(e) => SchedulerError::Persistence(e),
                    other => other,
                };
                error!(task_id = %task_id, error = %err, "Failed to record analysis result");
                self.finish_failure(task_id, err).await
            }
        }
    }

    /// Writes the completion onto a task that is still running.
    ///
    /// Returns `false` when the task has moved on in the meantime.
    async fn persist_success(
        &self,
        task_id: Uuid,
        report: AnalysisReport,
        duration_seconds: f64,
        container_id: Option<String>,
    ) -> Result<bool> {
        let mut tx = self.store.begin().await?;
        let Some(mut task) = tx.lock_for_update(task_id).await? else {
            tx.commit().await?;
            return Ok(false);
        };
        if task.status != TaskStatus::Running {
            tx.commit().await?;
            return Ok(false);
        }

        let download_url = self.config.download_url(report.id);
        task.complete(report, duration_seconds, container_id, download_url, Utc::now())?;
        tx.save(&task).await?;
        tx.commit().await?;
        Ok(true)
    }

    /// Failure path: snapshot, hand the slot on, then decide on a retry.
    async fn finish_failure(&self, task_id: Uuid, error: SchedulerError) -> Result<AttemptOutcome> {
        let snapshot = self.retry.record_failure(task_id, &error).await;

        self.dispatch_next_logged().await;

        let Some(task) = snapshot? else {
            return Ok(AttemptOutcome::NotFound);
        };
        let retry = self.retry.schedule(&task).await?;

        Ok(AttemptOutcome::Failed {
            category: task.error_category.unwrap_or_default(),
            retry,
        })
    }
}
