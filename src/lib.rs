//! packamal-scheduler: single-flight scheduler for containerized package analyses.
//!
//! This library queues package analysis requests, runs at most one analysis
//! container at a time, reuses results for package versions that were already
//! analysed, fails hung runs and retries failures with backoff.

// Core modules
pub mod cache;
pub mod cli;
pub mod config;
pub mod error;
pub mod execution;
pub mod scheduler;
pub mod storage;

// Re-export commonly used error types
pub use error::{AnalysisError, DockerError, ExecutorError, Result, SchedulerError};

pub use config::SchedulerConfig;
pub use scheduler::Scheduler;
