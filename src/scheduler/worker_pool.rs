//! Long-running side of the scheduler.
//!
//! `serve` starts `num_workers` tasks that pull [`DispatchJob`]s off the
//! queue and hand them to the [`Dispatcher`], plus one loop for the timeout
//! sweep and one for retention cleanup. All of them stop on the same
//! broadcast signal.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::dispatcher::{AttemptOutcome, Dispatcher};
use super::queue::{DispatchJob, DispatchKind, DispatchQueue};
use super::retention::{RetentionSweeper, DEFAULT_CLEANUP_INTERVAL};
use super::timeout::{TimeoutMonitor, DEFAULT_SWEEP_INTERVAL};

/// Lifecycle errors of [`WorkerPool`].
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("Pool is already running")]
    AlreadyRunning,

    #[error("Pool is not running")]
    NotRunning,

    /// Workers were still busy when the grace period ran out.
    #[error("Workers did not stop within {0:?}")]
    ShutdownTimeout(Duration),
}

/// Sizing and timing of a [`WorkerPool`].
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Concurrent dispatch workers. Only one of them runs an analysis at a time.
    pub num_workers: usize,
    /// How long a worker waits on an empty queue before checking for shutdown.
    pub poll_interval: Duration,
    /// Interval between timeout sweeps.
    pub sweep_interval: Duration,
    /// Interval between retention cleanups.
    pub cleanup_interval: Duration,
    /// Grace period for in-flight jobs on shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            num_workers: 2,
            poll_interval: Duration::from_secs(1),
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
            shutdown_timeout: Duration::from_secs(60),
        }
    }
}

impl WorkerPoolConfig {
    pub fn new(num_workers: usize) -> Self {
        Self {
            num_workers,
            ..Default::default()
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn with_cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

/// Counters of what the pool has done since it started.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub num_workers: usize,
    /// Workers currently inside [`Dispatcher::handle`].
    pub busy_workers: usize,
    /// Analyses that ran in a container and were recorded.
    pub analyses_completed: u64,
    /// Tasks completed from the result cache.
    pub cache_hits: u64,
    /// Tasks completed by copying an earlier report.
    pub reused: u64,
    /// Attempts pushed back because the slot was taken.
    pub deferred: u64,
    /// Runs that ended in a failure snapshot.
    pub failed_runs: u64,
    /// Jobs whose handling returned an error.
    pub job_errors: u64,
    pub tasks_timed_out: u64,
    pub tasks_purged: u64,
}

impl PoolStats {
    /// Tasks that reached `completed` through this pool.
    pub fn tasks_completed(&self) -> u64 {
        self.analyses_completed + self.cache_hits + self.reused
    }
}

#[derive(Default)]
struct SharedPoolStats {
    busy_workers: AtomicU64,
    analyses_completed: AtomicU64,
    cache_hits: AtomicU64,
    reused: AtomicU64,
    deferred: AtomicU64,
    failed_runs: AtomicU64,
    job_errors: AtomicU64,
    tasks_timed_out: AtomicU64,
    tasks_purged: AtomicU64,
}

impl SharedPoolStats {
    fn record(&self, outcome: &AttemptOutcome) {
        let counter = match outcome {
            AttemptOutcome::Completed {
                from_cache: false, ..
            } => &self.analyses_completed,
            AttemptOutcome::Completed {
                from_cache: true, ..
            } => &self.cache_hits,
            AttemptOutcome::Reused { .. } => &self.reused,
            AttemptOutcome::Deferred { .. } => &self.deferred,
            AttemptOutcome::Failed { .. } => &self.failed_runs,
            _ => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self, num_workers: usize) -> PoolStats {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        PoolStats {
            num_workers,
            busy_workers: load(&self.busy_workers) as usize,
            analyses_completed: load(&self.analyses_completed),
            cache_hits: load(&self.cache_hits),
            reused: load(&self.reused),
            deferred: load(&self.deferred),
            failed_runs: load(&self.failed_runs),
            job_errors: load(&self.job_errors),
            tasks_timed_out: load(&self.tasks_timed_out),
            tasks_purged: load(&self.tasks_purged),
        }
    }
}

/// Worker pool that runs dispatch jobs and the periodic maintenance loops.
pub struct WorkerPool {
    config: WorkerPoolConfig,
    dispatcher: Arc<Dispatcher>,
    monitor: Arc<TimeoutMonitor>,
    sweeper: Arc<RetentionSweeper>,
    shutdown_tx: broadcast::Sender<()>,
    handles: Vec<JoinHandle<()>>,
    stats: Arc<SharedPoolStats>,
    is_running: AtomicBool,
}

impl WorkerPool {
    pub fn new(
        config: WorkerPoolConfig,
        dispatcher: Arc<Dispatcher>,
        monitor: Arc<TimeoutMonitor>,
        sweeper: Arc<RetentionSweeper>,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            config,
            dispatcher,
            monitor,
            sweeper,
            shutdown_tx,
            handles: Vec::new(),
            stats: Arc::new(SharedPoolStats::default()),
            is_running: AtomicBool::new(false),
        }
    }

    /// Recovers abandoned jobs, runs Dispatch-Next once for tasks queued
    /// while nothing was serving, then spawns the workers and both loops.
    pub async fn start(&mut self) -> Result<(), PoolError> {
        if self.is_running.load(Ordering::SeqCst) {
            return Err(PoolError::AlreadyRunning);
        }

        // Jobs a crashed process had dequeued but never acked.
        match self.dispatcher.queue().recover().await {
            Ok(recovered) if recovered > 0 => {
                info!(recovered = recovered, "Recovered jobs from processing queue");
            }
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "Could not recover abandoned jobs");
            }
        }

        // Tasks queued while no process was running need a first attempt.
        self.dispatcher.dispatch_next_logged().await;

        for i in 0..self.config.num_workers {
            let worker = Worker::new(
                format!("worker-{}", i),
                Arc::clone(&self.dispatcher),
                self.shutdown_tx.subscribe(),
                self.config.poll_interval,
                Arc::clone(&self.stats),
            );
            self.handles.push(tokio::spawn(worker.run()));
        }

        self.handles.push(tokio::spawn(sweep_loop(
            Arc::clone(&self.monitor),
            self.config.sweep_interval,
            self.shutdown_tx.subscribe(),
            Arc::clone(&self.stats),
        )));
        self.handles.push(tokio::spawn(cleanup_loop(
            Arc::clone(&self.sweeper),
            self.config.cleanup_interval,
            self.shutdown_tx.subscribe(),
            Arc::clone(&self.stats),
        )));

        self.is_running.store(true, Ordering::SeqCst);
        info!(num_workers = self.config.num_workers, "Dispatch workers started");

        Ok(())
    }

    /// Signals every worker and loop to stop, then waits up to
    /// `shutdown_timeout` for them. An analysis in progress runs to the end.
    ///
    /// # Errors
    ///
    /// `PoolError::ShutdownTimeout` when the grace period runs out first.
    pub async fn shutdown(&mut self) -> Result<(), PoolError> {
        if !self.is_running.load(Ordering::SeqCst) {
            return Err(PoolError::NotRunning);
        }

        info!("Stopping dispatch workers");

        // No receivers left means everything already exited.
        let _ = self.shutdown_tx.send(());

        let shutdown_future = async {
            for handle in self.handles.drain(..) {
                if let Err(e) = handle.await {
                    error!(error = %e, "Worker panicked");
                }
            }
        };

        let result = tokio::time::timeout(self.config.shutdown_timeout, shutdown_future).await;
        self.is_running.store(false, Ordering::SeqCst);
        match result {
            Ok(()) => {
                info!("Dispatch workers stopped");
                Ok(())
            }
            Err(_) => Err(PoolError::ShutdownTimeout(self.config.shutdown_timeout)),
        }
    }

    /// Snapshot of the outcome counters.
    pub fn stats(&self) -> PoolStats {
        self.stats.snapshot(self.config.num_workers)
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    pub fn num_workers(&self) -> usize {
        self.config.num_workers
    }
}

async fn sweep_loop(
    monitor: Arc<TimeoutMonitor>,
    interval: Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
    stats: Arc<SharedPoolStats>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = ticker.tick() => match monitor.sweep().await {
                Ok(report) => {
                    stats
                        .tasks_timed_out
                        .fetch_add(report.timed_out.len() as u64, Ordering::Relaxed);
                }
                Err(e) => error!(error = %e, "Timeout sweep failed"),
            },
        }
    }
    debug!("Timeout sweep loop stopped");
}

async fn cleanup_loop(
    sweeper: Arc<RetentionSweeper>,
    interval: Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
    stats: Arc<SharedPoolStats>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = ticker.tick() => match sweeper.cleanup().await {
                Ok(report) => {
                    stats.tasks_purged.fetch_add(report.total(), Ordering::Relaxed);
                }
                Err(e) => error!(error = %e, "Retention cleanup failed"),
            },
        }
    }
    debug!("Retention loop stopped");
}

/// Pulls jobs off the dispatch queue one at a time.
pub struct Worker {
    id: String,
    dispatcher: Arc<Dispatcher>,
    shutdown_rx: broadcast::Receiver<()>,
    /// Longest blocking dequeue before the shutdown signal is checked again.
    poll_interval: Duration,
    stats: Arc<SharedPoolStats>,
}

impl Worker {
    fn new(
        id: String,
        dispatcher: Arc<Dispatcher>,
        shutdown_rx: broadcast::Receiver<()>,
        poll_interval: Duration,
        stats: Arc<SharedPoolStats>,
    ) -> Self {
        Self {
            id,
            dispatcher,
            shutdown_rx,
            poll_interval,
            stats,
        }
    }

    async fn run(mut self) {
        info!(worker_id = %self.id, "Worker started");

        loop {
            match self.shutdown_rx.try_recv() {
                Ok(()) | Err(broadcast::error::TryRecvError::Closed) => {
                    info!(worker_id = %self.id, "Shutdown signal received");
                    break;
                }
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(broadcast::error::TryRecvError::Empty) => {}
            }

            match self.dispatcher.queue().dequeue(self.poll_interval).await {
                Ok(Some(job)) => self.process_job(job).await,
                Ok(None) => {}
                Err(e) => {
                    error!(worker_id = %self.id, error = %e, "Dequeue failed");
                    tokio::time::sleep(self.poll_interval).await;
                }
            }
        }

        info!(worker_id = %self.id, "Worker stopped");
    }

    async fn process_job(&self, job: DispatchJob) {
        let started = Instant::now();
        debug!(
            worker_id = %self.id,
            job_id = %job.id,
            task_id = %job.task_id,
            kind = ?job.kind,
            "Handling dispatch job"
        );

        self.stats.busy_workers.fetch_add(1, Ordering::Relaxed);
        let result = self.dispatcher.handle(&job).await;
        self.stats.busy_workers.fetch_sub(1, Ordering::Relaxed);

        match result {
            Ok(outcome) => {
                self.stats.record(&outcome);
                // Deferrals repeat every contention delay; keep them at debug.
                if matches!(outcome, AttemptOutcome::Deferred { .. }) {
                    debug!(worker_id = %self.id, task_id = %job.task_id, "Attempt deferred");
                } else {
                    info!(
                        worker_id = %self.id,
                        task_id = %job.task_id,
                        outcome = outcome.label(),
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "Dispatch job handled"
                    );
                }
            }
            Err(e) => {
                self.stats.job_errors.fetch_add(1, Ordering::Relaxed);
                error!(
                    worker_id = %self.id,
                    job_id = %job.id,
                    task_id = %job.task_id,
                    error = %e,
                    "Dispatch job failed"
                );
                if job.kind == DispatchKind::Retry {
                    self.redeliver_retry(&job).await;
                }
            }
        }

        // An errored attempt needs no redelivery. Its task is either still
        // queued, which the sweep's Dispatch-Next picks up, or running, which
        // the sweep's deadline check covers.
        if let Err(e) = self.dispatcher.queue().ack(&job).await {
            warn!(worker_id = %self.id, job_id = %job.id, error = %e, "Failed to acknowledge job");
        }
    }

    /// Puts a retry job that errored back on the queue after the contention
    /// delay. If even that fails the sweep re-submits it once overdue.
    async fn redeliver_retry(&self, job: &DispatchJob) {
        let delay = self.dispatcher.config().contention_delay;
        let again = DispatchJob::retry(job.task_id).delayed(delay);
        match self.dispatcher.queue().submit(again).await {
            Ok(()) => info!(
                worker_id = %self.id,
                task_id = %job.task_id,
                delay_secs = delay.as_secs(),
                "Retry job re-submitted"
            ),
            Err(e) => warn!(
                worker_id = %self.id,
                task_id = %job.task_id,
                error = %e,
                "Could not re-submit retry job, leaving it to the timeout sweep"
            ),
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults_follow_maintenance_intervals() {
        let config = WorkerPoolConfig::new(4).with_poll_interval(Duration::from_millis(50));

        assert_eq!(config.num_workers, 4);
        assert_eq!(config.poll_interval, Duration::from_millis(50));
        assert_eq!(config.sweep_interval, DEFAULT_SWEEP_INTERVAL);
        assert_eq!(config.cleanup_interval, DEFAULT_CLEANUP_INTERVAL);
    }

    #[test]
    fn test_stats_count_outcomes() {
        let stats = SharedPoolStats::default();
        let report_id = uuid::Uuid::new_v4();

        stats.record(&AttemptOutcome::Completed {
            report_id,
            from_cache: false,
        });
        stats.record(&AttemptOutcome::Completed {
            report_id,
            from_cache: true,
        });
        stats.record(&AttemptOutcome::Reused {
            source: uuid::Uuid::new_v4(),
        });
        stats.record(&AttemptOutcome::Deferred {
            delay: Duration::from_secs(30),
        });
        stats.record(&AttemptOutcome::Failed {
            category: crate::scheduler::task::ErrorCategory::AnalysisFailure,
            retry: crate::scheduler::retry::RetryDecision::Exhausted,
        });
        stats.record(&AttemptOutcome::AlreadyRunning);

        let snapshot = stats.snapshot(3);
        assert_eq!(snapshot.num_workers, 3);
        assert_eq!(snapshot.analyses_completed, 1);
        assert_eq!(snapshot.cache_hits, 1);
        assert_eq!(snapshot.reused, 1);
        assert_eq!(snapshot.deferred, 1);
        assert_eq!(snapshot.failed_runs, 1);
        assert_eq!(snapshot.tasks_completed(), 3);
        assert_eq!(snapshot.job_errors, 0);
    }

    #[test]
    fn test_pool_error_display() {
        assert!(PoolError::AlreadyRunning.to_string().contains("already running"));
        assert!(PoolError::NotRunning.to_string().contains("not running"));
        assert!(PoolError::ShutdownTimeout(Duration::from_secs(60))
            .to_string()
            .contains("60"));
    }
}
