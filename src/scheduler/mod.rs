//! Single-flight analysis scheduler.
//!
//! At most one analysis container runs system-wide. Requests are queued by
//! priority and age, identical package versions are analysed once, hung runs
//! are failed by a periodic sweep, and failed runs are retried with
//! exponential backoff.
//!
//! - **task**: data model and the task state machine
//! - **dispatcher**: claims the execution slot and runs analyses
//! - **retry**: failure snapshots and delayed re-attempts
//! - **timeout**: periodic sweep for overdue runs
//! - **positions**: display-only queue positions
//! - **retention**: purge of old terminal tasks
//! - **queue**: work queue of dispatch jobs (in-memory or Redis)
//! - **worker_pool**: workers pulling dispatch jobs, plus the periodic loops
//! - **service**: the [`Scheduler`] facade
//!
//! # Architecture
//!
//! ```text
//!   enqueue ──► Task Store ◄───────────────┐
//!      │                                   │ one transaction per mutation
//!      ▼                                   │
//!   Dispatch queue ──► Worker ──► Dispatcher ──► Result cache
//!      ▲                              │
//!      │ deferrals / retries          ▼
//!      └──────────────────────── Container executor
//!
//!   Timeout monitor (60s) ──┐
//!   Retention sweeper (1h) ─┴──► Task Store
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use packamal_scheduler::config::SchedulerConfig;
//! use packamal_scheduler::scheduler::{AnalysisRequest, Ecosystem, Scheduler};
//!
//! let config = SchedulerConfig::from_env()?;
//! let scheduler = Scheduler::from_config(&config).await?;
//!
//! let id = scheduler
//!     .enqueue(AnalysisRequest::new(Ecosystem::Npm, "lodash").with_version("4.17.21"), None)
//!     .await?;
//!
//! let mut pool = scheduler.worker_pool();
//! pool.start().await?;
//! // ...
//! pool.shutdown().await?;
//! ```

pub mod dispatcher;
pub mod positions;
pub mod queue;
pub mod retention;
pub mod retry;
pub mod service;
pub mod task;
pub mod timeout;
pub mod worker_pool;

// Re-export main types for convenience
pub use dispatcher::{AttemptOutcome, Dispatcher, DispatcherConfig};
pub use positions::QueueMaintainer;
pub use queue::{
    DispatchJob, DispatchKind, DispatchQueue, MemoryDispatchQueue, QueueError, RedisDispatchQueue,
};
pub use retention::{RetentionReport, RetentionSweeper};
pub use retry::{RetryController, RetryDecision, RetryPolicy};
pub use service::{QueueSnapshot, Scheduler};
pub use task::{
    AnalysisMode, AnalysisReport, AnalysisRequest, AnalysisTask, Ecosystem, ErrorCategory,
    TaskEvent, TaskOptions, TaskStatus, TransitionError,
};
pub use timeout::{SweepReport, TimeoutMonitor};
pub use worker_pool::{PoolError, PoolStats, Worker, WorkerPool, WorkerPoolConfig};
