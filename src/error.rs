//! Error types for scheduler operations.
//!
//! Each subsystem owns its own error enum (`StoreError`, `CacheError`,
//! `QueueError`, `ConfigError` live next to the code that raises them). This
//! module holds the errors shared across subsystems:
//! - Docker container management
//! - Container executor failures
//! - Structured analysis failures carrying a persisted category
//! - The top-level scheduler error

use thiserror::Error;

use crate::cache::CacheError;
use crate::scheduler::queue::QueueError;
use crate::scheduler::task::{ErrorCategory, TransitionError};
use crate::storage::StoreError;

/// Errors that can occur during Docker operations.
#[derive(Debug, Error)]
pub enum DockerError {
    #[error("Docker daemon not available: {0}")]
    DaemonUnavailable(String),

    #[error("Container '{id}' not found")]
    ContainerNotFound { id: String },

    #[error("Failed to create container: {0}")]
    CreateFailed(String),

    #[error("Docker run failed: {0}")]
    RunFailed(String),

    #[error("Failed to pull image '{image}': {reason}")]
    PullFailed { image: String, reason: String },

    #[error("Failed to create volume '{name}': {reason}")]
    VolumeFailed { name: String, reason: String },

    #[error("Failed to copy files from container: {0}")]
    CopyFailed(String),

    #[error("Container exited with non-zero code {code}: {stderr}")]
    NonZeroExit { code: i64, stderr: String },

    #[error("Container operation timed out after {seconds} seconds")]
    Timeout { seconds: u64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors returned by the best-effort executor operations (terminate, logs).
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("Docker error: {0}")]
    Docker(#[from] DockerError),

    #[error("Executor unavailable: {0}")]
    Unavailable(String),
}

/// A failed analysis run carrying the category to persist on the task.
#[derive(Debug, Clone, Error)]
#[error("{category}: {message}")]
pub struct AnalysisError {
    pub category: ErrorCategory,
    pub message: String,
    /// Structured details persisted in `error_details`.
    pub details: serde_json::Value,
}

impl AnalysisError {
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
            details: serde_json::json!({}),
        }
    }

    /// Failure of the analysis itself (non-zero exit, missing result).
    pub fn analysis_failure(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::AnalysisFailure, message)
    }

    /// Failure of the container runtime.
    pub fn container(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::ContainerError, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::TimeoutError, message)
    }

    /// Attaches structured details.
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }
}

impl From<DockerError> for AnalysisError {
    fn from(err: DockerError) -> Self {
        let message = err.to_string();
        match &err {
            DockerError::NonZeroExit { code, .. } => AnalysisError::analysis_failure(&message)
                .with_details(serde_json::json!({ "exit_code": code, "docker_error": message })),
            DockerError::Timeout { .. } => AnalysisError::timeout(&message)
                .with_details(serde_json::json!({ "docker_error": message })),
            _ => AnalysisError::container(&message)
                .with_details(serde_json::json!({ "docker_error": message })),
        }
    }
}

/// Top-level error for scheduler operations.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Task store error: {0}")]
    Store(#[from] StoreError),

    #[error("Dispatch queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Result cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Analysis failed: {0}")]
    Analysis(#[from] AnalysisError),

    /// The store rejected a write after the analysis itself succeeded.
    #[error("Failed to persist analysis result: {0}")]
    Persistence(StoreError),

    #[error("Invalid state transition: {0}")]
    Transition(#[from] TransitionError),

    #[error("Task {0} not found")]
    NotFound(uuid::Uuid),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl SchedulerError {
    /// Returns the category persisted on a task failed by this error.
    pub fn category(&self) -> ErrorCategory {
        match self {
            SchedulerError::Analysis(err) => err.category,
            SchedulerError::Persistence(_) => ErrorCategory::PersistenceError,
            _ => ErrorCategory::UnknownError,
        }
    }

    /// Returns the structured details persisted on a task failed by this error.
    pub fn details(&self) -> serde_json::Value {
        match self {
            SchedulerError::Analysis(err) => err.details.clone(),
            other => serde_json::json!({ "error": other.to_string() }),
        }
    }

    /// Returns the message persisted on a task failed by this error.
    pub fn message(&self) -> String {
        match self {
            SchedulerError::Analysis(err) => err.message.clone(),
            other => other.to_string(),
        }
    }
}

/// Result type alias for scheduler operations.
pub type Result<T> = std::result::Result<T, SchedulerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_analysis_error_keeps_category() {
        let err: SchedulerError = AnalysisError::analysis_failure("exit 2")
            .with_details(serde_json::json!({"exit_code": 2}))
            .into();
        assert_eq!(err.category(), ErrorCategory::AnalysisFailure);
        assert_eq!(err.details()["exit_code"], 2);
        assert_eq!(err.message(), "exit 2");
    }

    #[test]
    fn test_persistence_error_category() {
        let err = SchedulerError::Persistence(StoreError::Conflict("status changed".into()));
        assert_eq!(err.category(), ErrorCategory::PersistenceError);
        assert!(err.message().contains("persist"));
    }

    #[test]
    fn test_other_errors_are_unknown() {
        let err = SchedulerError::NotFound(uuid::Uuid::nil());
        assert_eq!(err.category(), ErrorCategory::UnknownError);
        assert!(err.details()["error"].as_str().unwrap().contains("not found"));

        let err = SchedulerError::InvalidRequest("empty package".into());
        assert_eq!(err.category(), ErrorCategory::UnknownError);
    }

    #[test]
    fn test_docker_error_mapping() {
        let err: AnalysisError = DockerError::NonZeroExit {
            code: 3,
            stderr: "boom".into(),
        }
        .into();
        assert_eq!(err.category, ErrorCategory::AnalysisFailure);
        assert_eq!(err.details["exit_code"], 3);

        let err: AnalysisError = DockerError::DaemonUnavailable("socket".into()).into();
        assert_eq!(err.category, ErrorCategory::ContainerError);

        let err: AnalysisError = DockerError::Timeout { seconds: 5 }.into();
        assert_eq!(err.category, ErrorCategory::TimeoutError);
    }
}
