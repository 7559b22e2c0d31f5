//! Scheduler facade.
//!
//! [`Scheduler`] wires the store, cache, queue and executor together and
//! exposes the entry points callers use: `enqueue`, the two periodic
//! triggers, and read-only views of the queue.

use std::sync::Arc;

use anyhow::Context;
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use super::dispatcher::{Dispatcher, DispatcherConfig};
use super::queue::{DispatchJob, DispatchQueue, MemoryDispatchQueue, RedisDispatchQueue};
use super::retention::{RetentionReport, RetentionSweeper};
use super::retry::RetryPolicy;
use super::task::{AnalysisRequest, AnalysisTask, TaskOptions, TaskStatus};
use super::timeout::{SweepReport, TimeoutMonitor};
use super::worker_pool::{WorkerPool, WorkerPoolConfig};
use crate::cache::{MemoryResultCache, RedisResultCache, ResultCache};
use crate::config::SchedulerConfig;
use crate::error::{Result, SchedulerError};
use crate::execution::{ContainerExecutor, DockerExecutor};
use crate::storage::{self, TaskStore};

/// Queue state as seen by operators.
#[derive(Debug, Clone, Serialize)]
pub struct QueueSnapshot {
    /// The task holding the execution slot, if any.
    pub running: Option<AnalysisTask>,
    /// Queued tasks in dispatch order.
    pub queued: Vec<AnalysisTask>,
    /// Dispatch jobs waiting in the work queue (including delayed ones).
    pub pending_jobs: usize,
}

/// Entry point of the scheduling system.
pub struct Scheduler {
    dispatcher: Arc<Dispatcher>,
    monitor: Arc<TimeoutMonitor>,
    sweeper: Arc<RetentionSweeper>,
    task_defaults: TaskOptions,
    pool_config: WorkerPoolConfig,
}

impl Scheduler {
    /// Builds a scheduler from already-connected backends.
    pub fn assemble(
        store: Arc<dyn TaskStore>,
        cache: Arc<dyn ResultCache>,
        executor: Arc<dyn ContainerExecutor>,
        queue: Arc<dyn DispatchQueue>,
        config: &SchedulerConfig,
    ) -> Self {
        let mut dispatcher_config = DispatcherConfig::default()
            .with_contention_delay(config.contention_delay)
            .with_heartbeat_interval(config.heartbeat_interval)
            .with_cache_ttl(config.cache_ttl)
            .with_retry_policy(RetryPolicy {
                base_delay: config.retry_base_delay,
                max_retries: config.max_retries,
            });
        if let Some(base_url) = &config.base_url {
            dispatcher_config = dispatcher_config.with_base_url(base_url.clone());
        }

        let dispatcher = Arc::new(Dispatcher::new(
            store.clone(),
            cache,
            executor,
            queue,
            dispatcher_config,
        ));
        let monitor = Arc::new(
            TimeoutMonitor::new(dispatcher.clone())
                .with_stale_heartbeat(config.stale_heartbeat)
                .with_retry_grace(config.retry_grace),
        );
        let sweeper = Arc::new(RetentionSweeper::new(store, config.retention));
        let pool_config = WorkerPoolConfig::new(config.workers)
            .with_poll_interval(config.poll_interval)
            .with_sweep_interval(config.sweep_interval)
            .with_cleanup_interval(config.cleanup_interval);

        Self {
            dispatcher,
            monitor,
            sweeper,
            task_defaults: config.task_defaults(),
            pool_config,
        }
    }

    /// Connects every backend named by `config`.
    ///
    /// Uses Redis for the cache and queue when `redis_url` is set, the
    /// in-process versions otherwise, and the local Docker daemon for runs.
    pub async fn from_config(config: &SchedulerConfig) -> anyhow::Result<Self> {
        let store = storage::connect(&config.database_url)
            .await
            .context("Failed to open task store")?;
        store.migrate().await.context("Failed to migrate task store")?;

        let (cache, queue): (Arc<dyn ResultCache>, Arc<dyn DispatchQueue>) =
            match &config.redis_url {
                Some(url) => {
                    let cache = RedisResultCache::connect(url)
                        .await
                        .context("Failed to connect result cache")?;
                    let queue = RedisDispatchQueue::connect(url, &config.queue_name)
                        .await
                        .context("Failed to connect dispatch queue")?;
                    (Arc::new(cache), Arc::new(queue))
                }
                None => {
                    warn!("REDIS_URL not set, using in-process result cache and dispatch queue");
                    (
                        Arc::new(MemoryResultCache::new()),
                        Arc::new(MemoryDispatchQueue::new()),
                    )
                }
            };

        let executor = DockerExecutor::connect(config.runner_config())
            .context("Failed to connect to Docker")?;

        Ok(Self::assemble(store, cache, Arc::new(executor), queue, config))
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Options applied by [`enqueue`](Self::enqueue) when none are given.
    pub fn task_defaults(&self) -> TaskOptions {
        self.task_defaults
    }

    /// Records a new analysis request and submits its first attempt.
    pub async fn enqueue(
        &self,
        request: AnalysisRequest,
        options: Option<TaskOptions>,
    ) -> Result<Uuid> {
        request.validate().map_err(SchedulerError::InvalidRequest)?;

        let options = options.unwrap_or(self.task_defaults);
        if options.timeout_minutes == 0 {
            return Err(SchedulerError::InvalidRequest(
                "timeout_minutes must be greater than 0".to_string(),
            ));
        }

        let task = AnalysisTask::new(request, options);
        self.dispatcher.store().insert(&task).await?;
        self.dispatcher.maintainer().refresh().await;

        info!(
            task_id = %task.id,
            ecosystem = %task.ecosystem,
            package = %task.package_name,
            version = task.package_version.as_deref().unwrap_or("latest"),
            purl = ?task.purl,
            priority = task.priority,
            "Task enqueued"
        );

        self.dispatcher
            .queue()
            .submit(DispatchJob::attempt(task.id))
            .await?;
        Ok(task.id)
    }

    /// Periodic trigger: fail tasks that overran their deadline.
    pub async fn sweep_timeouts(&self) -> Result<SweepReport> {
        self.monitor.sweep().await
    }

    /// Periodic trigger: purge terminal tasks past retention.
    pub async fn cleanup_old_tasks(&self) -> Result<RetentionReport> {
        Ok(self.sweeper.cleanup().await?)
    }

    /// Returns a task by id.
    pub async fn get(&self, task_id: Uuid) -> Result<AnalysisTask> {
        self.dispatcher
            .store()
            .get(task_id)
            .await?
            .ok_or(SchedulerError::NotFound(task_id))
    }

    /// Returns recent tasks, newest first.
    pub async fn list(&self, status: Option<TaskStatus>, limit: u32) -> Result<Vec<AnalysisTask>> {
        Ok(self.dispatcher.store().list(status, limit).await?)
    }

    /// Returns the running task and the queue in dispatch order.
    pub async fn queue_snapshot(&self) -> Result<QueueSnapshot> {
        let (running, queued) = {
            let mut tx = self.dispatcher.store().begin().await?;
            let running = tx.query_running().await?.into_iter().next();
            let queued = tx.query_queued_ordered().await?;
            tx.commit().await?;
            (running, queued)
        };
        let pending_jobs = self.dispatcher.queue().len().await?;

        Ok(QueueSnapshot {
            running,
            queued,
            pending_jobs,
        })
    }

    /// Creates the worker pool that drives this scheduler.
    pub fn worker_pool(&self) -> WorkerPool {
        WorkerPool::new(
            self.pool_config.clone(),
            self.dispatcher.clone(),
            self.monitor.clone(),
            self.sweeper.clone(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{AnalysisError, ExecutorError};
    use crate::execution::{ExecutionEvents, ExecutionOutput};
    use crate::scheduler::task::Ecosystem;
    use crate::storage::SqliteTaskStore;
    use async_trait::async_trait;

    struct NeverRuns;

    #[async_trait]
    impl ContainerExecutor for NeverRuns {
        async fn execute(
            &self,
            _task_id: Uuid,
            _request: &AnalysisRequest,
            _events: ExecutionEvents,
        ) -> std::result::Result<ExecutionOutput, AnalysisError> {
            Err(AnalysisError::container("not used"))
        }

        async fn terminate(&self, _container_id: &str) -> std::result::Result<(), ExecutorError> {
            Ok(())
        }

        async fn fetch_logs(
            &self,
            _container_id: &str,
            _tail: usize,
        ) -> std::result::Result<String, ExecutorError> {
            Ok(String::new())
        }
    }

    async fn scheduler() -> (tempfile::TempDir, Arc<MemoryDispatchQueue>, Scheduler) {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("service.db").display());
        let store = Arc::new(SqliteTaskStore::open(&url).await.unwrap());
        let queue = Arc::new(MemoryDispatchQueue::new());
        let config = SchedulerConfig::default().with_database_url(url);
        let scheduler = Scheduler::assemble(
            store,
            Arc::new(MemoryResultCache::new()),
            Arc::new(NeverRuns),
            queue.clone(),
            &config,
        );
        (dir, queue, scheduler)
    }

    #[tokio::test]
    async fn test_enqueue_persists_and_submits() {
        let (_dir, queue, scheduler) = scheduler().await;
        let request = AnalysisRequest::new(Ecosystem::Npm, "lodash").with_version("4.17.21");

        let id = scheduler.enqueue(request, None).await.unwrap();

        let task = scheduler.get(id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Queued);
        assert_eq!(task.queue_position, Some(1));
        assert_eq!(task.purl.as_deref(), Some("pkg:npm/lodash@4.17.21"));
        assert_eq!(task.max_retries, 1);
        assert_eq!(task.timeout_minutes, 30);

        let jobs = queue.pending();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].task_id, id);
    }

    #[tokio::test]
    async fn test_enqueue_rejects_invalid_request() {
        let (_dir, queue, scheduler) = scheduler().await;
        let err = scheduler
            .enqueue(AnalysisRequest::new(Ecosystem::Pypi, ""), None)
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidRequest(_)));
        assert!(queue.pending().is_empty());
    }

    #[tokio::test]
    async fn test_queue_snapshot_order() {
        let (_dir, _queue, scheduler) = scheduler().await;
        let low = scheduler
            .enqueue(AnalysisRequest::new(Ecosystem::Npm, "low"), None)
            .await
            .unwrap();
        let high = scheduler
            .enqueue(
                AnalysisRequest::new(Ecosystem::Npm, "high"),
                Some(TaskOptions::default().with_priority(10)),
            )
            .await
            .unwrap();

        let snapshot = scheduler.queue_snapshot().await.unwrap();
        assert!(snapshot.running.is_none());
        let order: Vec<Uuid> = snapshot.queued.iter().map(|t| t.id).collect();
        assert_eq!(order, vec![high, low]);
        assert_eq!(snapshot.pending_jobs, 2);
    }

    #[tokio::test]
    async fn test_get_unknown_task() {
        let (_dir, _queue, scheduler) = scheduler().await;
        assert!(matches!(
            scheduler.get(Uuid::new_v4()).await,
            Err(SchedulerError::NotFound(_))
        ));
    }
}
