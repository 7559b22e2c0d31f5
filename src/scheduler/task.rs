//! Analysis task definitions for the scheduler.
//!
//! This module defines the unit of work tracked by the task store:
//!
//! - `AnalysisRequest`: What to analyze (ecosystem, package, version, mode)
//! - `AnalysisTask`: A persisted request with scheduling, execution and outcome fields
//! - `TaskStatus` / `TaskEvent`: The forward-only lifecycle state machine
//! - `AnalysisReport`: The report produced by a completed analysis
//!
//! # Lifecycle
//!
//! ```text
//!            Claimed              Completed
//!   QUEUED ──────────▶ RUNNING ──────────────▶ COMPLETED
//!     │  ▲                │
//!     │  │                │ Failed
//!     │  │                ▼
//!     │  └──────────── FAILED
//!     │   RetryScheduled
//!     │
//!     └──────────────────────────────────────▶ COMPLETED
//!                        Reused
//! ```
//!
//! `RetryScheduled` is the only backwards edge and is raised exclusively by the
//! retry controller.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Default number of automatic retries after a failed analysis.
pub const DEFAULT_MAX_RETRIES: u32 = 1;

/// Default per-task deadline in minutes.
pub const DEFAULT_TIMEOUT_MINUTES: u32 = 30;

/// Default priority (higher values are served first).
const DEFAULT_PRIORITY: i32 = 0;

/// Version label used when no explicit version was requested.
pub const LATEST_VERSION: &str = "latest";

/// Lifecycle status of an analysis task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting for the single execution slot.
    Queued,
    /// Holding the execution slot.
    Running,
    /// Finished with a report.
    Completed,
    /// Finished without a report.
    Failed,
}

impl TaskStatus {
    /// Returns the persisted string form of the status.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    /// Applies a lifecycle event and returns the resulting status.
    ///
    /// # Errors
    ///
    /// Returns `TransitionError` when the event is not allowed from this status.
    pub fn apply(self, event: TaskEvent) -> Result<TaskStatus, TransitionError> {
        let next = match (self, event) {
            (TaskStatus::Queued, TaskEvent::Claimed) => TaskStatus::Running,
            (TaskStatus::Queued, TaskEvent::Reused) => TaskStatus::Completed,
            (TaskStatus::Running, TaskEvent::Completed) => TaskStatus::Completed,
            (TaskStatus::Running, TaskEvent::Failed) => TaskStatus::Failed,
            (TaskStatus::Failed, TaskEvent::RetryScheduled) => TaskStatus::Queued,
            (from, event) => return Err(TransitionError { from, event }),
        };
        Ok(next)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(TaskStatus::Queued),
            "running" => Ok(TaskStatus::Running),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            other => Err(ParseEnumError::new("task status", other)),
        }
    }
}

/// Events that drive the task state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskEvent {
    /// The dispatcher took the execution slot for the task.
    Claimed,
    /// The analysis produced a report.
    Completed,
    /// A report from an earlier task with the same purl was copied over.
    Reused,
    /// The analysis failed or timed out.
    Failed,
    /// The retry controller put a failed task back in the queue.
    RetryScheduled,
}

impl std::fmt::Display for TaskEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskEvent::Claimed => write!(f, "claimed"),
            TaskEvent::Completed => write!(f, "completed"),
            TaskEvent::Reused => write!(f, "reused"),
            TaskEvent::Failed => write!(f, "failed"),
            TaskEvent::RetryScheduled => write!(f, "retry_scheduled"),
        }
    }
}

/// A lifecycle event that is not allowed from the current status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("event '{event}' is not allowed for a task in status '{from}'")]
pub struct TransitionError {
    pub from: TaskStatus,
    pub event: TaskEvent,
}

/// Failure to parse one of the string-backed enums of this module.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {kind} '{value}'")]
pub struct ParseEnumError {
    kind: &'static str,
    value: String,
}

impl ParseEnumError {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

/// Package ecosystems supported by the analysis image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Ecosystem {
    Npm,
    Pypi,
    Rubygems,
    Packagist,
    #[serde(rename = "crates.io")]
    CratesIo,
    Maven,
}

impl Ecosystem {
    /// Returns the name the analysis image expects for `-ecosystem`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Ecosystem::Npm => "npm",
            Ecosystem::Pypi => "pypi",
            Ecosystem::Rubygems => "rubygems",
            Ecosystem::Packagist => "packagist",
            Ecosystem::CratesIo => "crates.io",
            Ecosystem::Maven => "maven",
        }
    }

    /// Returns the package-url type for the ecosystem.
    pub fn purl_type(&self) -> &'static str {
        match self {
            Ecosystem::Npm => "npm",
            Ecosystem::Pypi => "pypi",
            Ecosystem::Rubygems => "gem",
            Ecosystem::Packagist => "composer",
            Ecosystem::CratesIo => "cargo",
            Ecosystem::Maven => "maven",
        }
    }
}

impl std::fmt::Display for Ecosystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Ecosystem {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "npm" => Ok(Ecosystem::Npm),
            "pypi" => Ok(Ecosystem::Pypi),
            "rubygems" | "gem" => Ok(Ecosystem::Rubygems),
            "packagist" | "composer" => Ok(Ecosystem::Packagist),
            "crates.io" | "cargo" | "crates" => Ok(Ecosystem::CratesIo),
            "maven" => Ok(Ecosystem::Maven),
            _ => Err(ParseEnumError::new("ecosystem", s)),
        }
    }
}

/// Analysis mode passed to the analysis image.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnalysisMode {
    #[default]
    Dynamic,
    Static,
}

impl AnalysisMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnalysisMode::Dynamic => "dynamic",
            AnalysisMode::Static => "static",
        }
    }
}

impl std::fmt::Display for AnalysisMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for AnalysisMode {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "dynamic" => Ok(AnalysisMode::Dynamic),
            "static" => Ok(AnalysisMode::Static),
            _ => Err(ParseEnumError::new("analysis mode", s)),
        }
    }
}

/// Category persisted in `error_category` for failed tasks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Failure that carried no category of its own.
    #[default]
    UnknownError,
    /// The analysis container exited non-zero or produced no usable result.
    AnalysisFailure,
    /// The task exceeded its deadline.
    TimeoutError,
    /// The store rejected a write after a successful run.
    PersistenceError,
    /// The container runtime could not run the analysis.
    ContainerError,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::UnknownError => "unknown_error",
            ErrorCategory::AnalysisFailure => "analysis_failure",
            ErrorCategory::TimeoutError => "timeout_error",
            ErrorCategory::PersistenceError => "persistence_error",
            ErrorCategory::ContainerError => "container_error",
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ErrorCategory {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unknown_error" => Ok(ErrorCategory::UnknownError),
            "analysis_failure" => Ok(ErrorCategory::AnalysisFailure),
            "timeout_error" => Ok(ErrorCategory::TimeoutError),
            "persistence_error" => Ok(ErrorCategory::PersistenceError),
            "container_error" => Ok(ErrorCategory::ContainerError),
            other => Err(ParseEnumError::new("error category", other)),
        }
    }
}

/// Report produced by a completed analysis.
///
/// Reports are shared by reference: a task completed through result reuse or a
/// cache hit points at the same report id as the task that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisReport {
    /// Identifier of the report record.
    pub id: Uuid,
    /// Raw JSON emitted by the analysis image.
    pub data: serde_json::Value,
    /// When the analysis produced the report.
    pub generated_at: DateTime<Utc>,
}

impl AnalysisReport {
    /// Wraps raw analysis output in a new report record.
    pub fn new(data: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            data,
            generated_at: Utc::now(),
        }
    }
}

/// Description of the package to analyze.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisRequest {
    /// Package ecosystem.
    pub ecosystem: Ecosystem,
    /// Package name as published in the ecosystem.
    pub package_name: String,
    /// Pinned version, `None` for the latest release.
    #[serde(default)]
    pub version: Option<String>,
    /// Analysis mode.
    #[serde(default)]
    pub mode: AnalysisMode,
    /// Path to a local package archive to analyze instead of a registry download.
    #[serde(default)]
    pub local_artifact: Option<PathBuf>,
}

impl AnalysisRequest {
    /// Creates a request for the latest version of a package.
    pub fn new(ecosystem: Ecosystem, package_name: impl Into<String>) -> Self {
        Self {
            ecosystem,
            package_name: package_name.into(),
            version: None,
            mode: AnalysisMode::default(),
            local_artifact: None,
        }
    }

    /// Pins the version. `"latest"` and empty strings mean unpinned.
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        let version = version.into();
        let trimmed = version.trim();
        self.version = if trimmed.is_empty() || trimmed.eq_ignore_ascii_case(LATEST_VERSION) {
            None
        } else {
            Some(trimmed.to_string())
        };
        self
    }

    /// Sets the analysis mode.
    pub fn with_mode(mut self, mode: AnalysisMode) -> Self {
        self.mode = mode;
        self
    }

    /// Analyzes a local archive instead of downloading from the registry.
    pub fn with_local_artifact(mut self, path: impl Into<PathBuf>) -> Self {
        self.local_artifact = Some(path.into());
        self
    }

    /// Returns the version, or `"latest"` when unpinned.
    pub fn version_label(&self) -> &str {
        self.version.as_deref().unwrap_or(LATEST_VERSION)
    }

    /// Derives the package-url used for result reuse.
    ///
    /// Only registry packages with a pinned version get a purl; `latest` moves
    /// over time and a local archive is not identified by its name.
    pub fn purl(&self) -> Option<String> {
        if self.local_artifact.is_some() {
            return None;
        }
        let version = self.version.as_deref()?;
        let name = match self.ecosystem {
            // Scoped npm packages keep the scope as namespace with an encoded '@'.
            Ecosystem::Npm => self.package_name.replacen('@', "%40", 1),
            Ecosystem::Pypi => self.package_name.to_lowercase().replace('_', "-"),
            // group:artifact becomes the namespace/name pair.
            Ecosystem::Maven => self.package_name.replacen(':', "/", 1),
            _ => self.package_name.clone(),
        };
        Some(format!(
            "pkg:{}/{}@{}",
            self.ecosystem.purl_type(),
            name,
            version
        ))
    }

    /// Checks that the request names a package.
    pub fn validate(&self) -> Result<(), String> {
        if self.package_name.trim().is_empty() {
            return Err("package name cannot be empty".to_string());
        }
        if self.package_name.chars().any(|c| c.is_whitespace()) {
            return Err(format!(
                "package name '{}' must not contain whitespace",
                self.package_name
            ));
        }
        Ok(())
    }
}

/// Scheduling options supplied at enqueue time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskOptions {
    /// Priority (higher values are served first).
    pub priority: i32,
    /// Number of automatic retries after a failure.
    pub max_retries: u32,
    /// Deadline for a single run, in minutes.
    pub timeout_minutes: u32,
}

impl Default for TaskOptions {
    fn default() -> Self {
        Self {
            priority: DEFAULT_PRIORITY,
            max_retries: DEFAULT_MAX_RETRIES,
            timeout_minutes: DEFAULT_TIMEOUT_MINUTES,
        }
    }
}

impl TaskOptions {
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_timeout_minutes(mut self, minutes: u32) -> Self {
        self.timeout_minutes = minutes;
        self
    }
}

/// A persisted analysis request and its lifecycle state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisTask {
    /// Immutable identifier assigned at creation.
    pub id: Uuid,

    // Request descriptor
    pub ecosystem: Ecosystem,
    pub package_name: String,
    pub package_version: Option<String>,
    pub mode: AnalysisMode,
    pub local_artifact: Option<PathBuf>,
    /// Package identity used only for result reuse.
    pub purl: Option<String>,

    // Scheduling
    pub status: TaskStatus,
    pub priority: i32,
    pub queued_at: DateTime<Utc>,
    /// 1-based rank among queued tasks, `None` unless queued.
    pub queue_position: Option<u32>,

    // Execution
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub container_id: Option<String>,
    pub duration_seconds: Option<f64>,

    // Outcome
    pub report: Option<AnalysisReport>,
    pub download_url: Option<String>,
    pub error_message: Option<String>,
    pub error_category: Option<ErrorCategory>,
    pub error_details: Option<serde_json::Value>,

    // Retry bookkeeping
    pub retry_count: u32,
    pub max_retries: u32,
    pub timeout_minutes: u32,

    pub created_at: DateTime<Utc>,
}

impl AnalysisTask {
    /// Creates a new queued task for the request.
    pub fn new(request: AnalysisRequest, options: TaskOptions) -> Self {
        let now = Utc::now();
        let purl = request.purl();
        Self {
            id: Uuid::new_v4(),
            ecosystem: request.ecosystem,
            package_name: request.package_name,
            package_version: request.version,
            mode: request.mode,
            local_artifact: request.local_artifact,
            purl,
            status: TaskStatus::Queued,
            priority: options.priority,
            queued_at: now,
            queue_position: None,
            started_at: None,
            completed_at: None,
            last_heartbeat: None,
            container_id: None,
            duration_seconds: None,
            report: None,
            download_url: None,
            error_message: None,
            error_category: None,
            error_details: None,
            retry_count: 0,
            max_retries: options.max_retries,
            timeout_minutes: options.timeout_minutes,
            created_at: now,
        }
    }

    /// Rebuilds the request descriptor of this task.
    pub fn request(&self) -> AnalysisRequest {
        AnalysisRequest {
            ecosystem: self.ecosystem,
            package_name: self.package_name.clone(),
            version: self.package_version.clone(),
            mode: self.mode,
            local_artifact: self.local_artifact.clone(),
        }
    }

    /// Returns the configured deadline for a single run.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(u64::from(self.timeout_minutes) * 60)
    }

    /// Returns how long the task has been running at `now`.
    pub fn elapsed(&self, now: DateTime<Utc>) -> Option<chrono::Duration> {
        self.started_at.map(|started| now - started)
    }

    /// Returns whether a running task has exceeded its deadline at `now`.
    ///
    /// The deadline is anchored to `started_at`; heartbeats do not extend it.
    pub fn is_timed_out(&self, now: DateTime<Utc>) -> bool {
        if self.status != TaskStatus::Running {
            return false;
        }
        match self.elapsed(now) {
            Some(elapsed) => elapsed > chrono::Duration::minutes(i64::from(self.timeout_minutes)),
            None => false,
        }
    }

    /// Returns whether the retry controller may re-queue the task.
    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// Takes the execution slot.
    pub fn claim(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.status = self.status.apply(TaskEvent::Claimed)?;
        self.started_at = Some(now);
        self.last_heartbeat = Some(now);
        self.queue_position = None;
        Ok(())
    }

    /// Records a successful run.
    pub fn complete(
        &mut self,
        report: AnalysisReport,
        duration_seconds: f64,
        container_id: Option<String>,
        download_url: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        self.status = self.status.apply(TaskEvent::Completed)?;
        self.report = Some(report);
        self.duration_seconds = Some(duration_seconds);
        if container_id.is_some() {
            self.container_id = container_id;
        }
        self.download_url = download_url;
        self.completed_at = Some(now);
        self.last_heartbeat = None;
        self.queue_position = None;
        Ok(())
    }

    /// Completes a queued task with the report of an earlier task.
    pub fn reuse_from(
        &mut self,
        source: &AnalysisTask,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        self.status = self.status.apply(TaskEvent::Reused)?;
        self.report = source.report.clone();
        self.download_url = source.download_url.clone();
        self.completed_at = Some(now);
        self.queue_position = None;
        Ok(())
    }

    /// Records a failed run.
    pub fn fail(
        &mut self,
        category: ErrorCategory,
        message: impl Into<String>,
        details: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        self.status = self.status.apply(TaskEvent::Failed)?;
        self.error_message = Some(message.into());
        self.error_category = Some(category);
        self.error_details = Some(details);
        self.completed_at = Some(now);
        self.last_heartbeat = None;
        self.queue_position = None;
        Ok(())
    }

    /// Puts a failed task back in the queue for another attempt.
    ///
    /// The original `queued_at` is kept so the task keeps its FIFO standing.
    pub fn requeue_for_retry(&mut self) -> Result<(), TransitionError> {
        self.status = self.status.apply(TaskEvent::RetryScheduled)?;
        self.retry_count += 1;
        self.started_at = None;
        self.completed_at = None;
        self.last_heartbeat = None;
        self.container_id = None;
        self.duration_seconds = None;
        self.error_message = None;
        self.error_category = None;
        self.error_details = None;
        Ok(())
    }

    /// Refreshes the liveness timestamp of a running task.
    ///
    /// Returns `false` when the task is no longer running.
    pub fn touch_heartbeat(&mut self, now: DateTime<Utc>, container_id: Option<&str>) -> bool {
        if self.status != TaskStatus::Running {
            return false;
        }
        self.last_heartbeat = Some(now);
        if let Some(id) = container_id {
            self.container_id = Some(id.to_string());
        }
        true
    }
}
