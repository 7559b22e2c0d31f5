//! Row mapping between `analysis_tasks` and [`AnalysisTask`].

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use sqlx::types::Json;
use uuid::Uuid;

use super::store::StoreError;
use crate::scheduler::task::{AnalysisReport, AnalysisTask};

/// One `analysis_tasks` row, decodable from both backends.
#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct TaskRow {
    pub id: Uuid,
    pub ecosystem: String,
    pub package_name: String,
    pub package_version: Option<String>,
    pub mode: String,
    pub local_artifact: Option<String>,
    pub purl: Option<String>,
    pub status: String,
    pub priority: i32,
    pub queued_at: DateTime<Utc>,
    pub queue_position: Option<i32>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub container_id: Option<String>,
    pub duration_seconds: Option<f64>,
    pub report: Option<Json<AnalysisReport>>,
    pub download_url: Option<String>,
    pub error_message: Option<String>,
    pub error_category: Option<String>,
    pub error_details: Option<Json<serde_json::Value>>,
    pub retry_count: i32,
    pub max_retries: i32,
    pub timeout_minutes: i32,
    pub created_at: DateTime<Utc>,
}

fn to_i32(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

fn to_u32(id: Uuid, column: &str, value: i32) -> Result<u32, StoreError> {
    u32::try_from(value).map_err(|_| StoreError::Corrupt {
        id,
        reason: format!("negative {column}: {value}"),
    })
}

impl From<&AnalysisTask> for TaskRow {
    fn from(task: &AnalysisTask) -> Self {
        Self {
            id: task.id,
            ecosystem: task.ecosystem.as_str().to_string(),
            package_name: task.package_name.clone(),
            package_version: task.package_version.clone(),
            mode: task.mode.as_str().to_string(),
            local_artifact: task
                .local_artifact
                .as_ref()
                .map(|p| p.to_string_lossy().into_owned()),
            purl: task.purl.clone(),
            status: task.status.as_str().to_string(),
            priority: task.priority,
            queued_at: task.queued_at,
            queue_position: task.queue_position.map(to_i32),
            started_at: task.started_at,
            completed_at: task.completed_at,
            last_heartbeat: task.last_heartbeat,
            container_id: task.container_id.clone(),
            duration_seconds: task.duration_seconds,
            report: task.report.clone().map(Json),
            download_url: task.download_url.clone(),
            error_message: task.error_message.clone(),
            error_category: task.error_category.map(|c| c.as_str().to_string()),
            error_details: task.error_details.clone().map(Json),
            retry_count: to_i32(task.retry_count),
            max_retries: to_i32(task.max_retries),
            timeout_minutes: to_i32(task.timeout_minutes),
            created_at: task.created_at,
        }
    }
}

impl TryFrom<TaskRow> for AnalysisTask {
    type Error = StoreError;

    fn try_from(row: TaskRow) -> Result<Self, Self::Error> {
        let id = row.id;
        let corrupt = |err: crate::scheduler::task::ParseEnumError| StoreError::Corrupt {
            id,
            reason: err.to_string(),
        };

        Ok(AnalysisTask {
            id,
            ecosystem: row.ecosystem.parse().map_err(corrupt)?,
            package_name: row.package_name,
            package_version: row.package_version,
            mode: row.mode.parse().map_err(corrupt)?,
            local_artifact: row.local_artifact.map(PathBuf::from),
            purl: row.purl,
            status: row.status.parse().map_err(corrupt)?,
            priority: row.priority,
            queued_at: row.queued_at,
            queue_position: row
                .queue_position
                .map(|p| to_u32(id, "queue_position", p))
                .transpose()?,
            started_at: row.started_at,
            completed_at: row.completed_at,
            last_heartbeat: row.last_heartbeat,
            container_id: row.container_id,
            duration_seconds: row.duration_seconds,
            report: row.report.map(|r| r.0),
            download_url: row.download_url,
            error_message: row.error_message,
            error_category: row
                .error_category
                .map(|c| c.parse())
                .transpose()
                .map_err(corrupt)?,
            error_details: row.error_details.map(|d| d.0),
            retry_count: to_u32(id, "retry_count", row.retry_count)?,
            max_retries: to_u32(id, "max_retries", row.max_retries)?,
            timeout_minutes: to_u32(id, "timeout_minutes", row.timeout_minutes)?,
            created_at: row.created_at,
        })
    }
}

/// Converts fetched rows into tasks.
pub(crate) fn into_tasks(rows: Vec<TaskRow>) -> Result<Vec<AnalysisTask>, StoreError> {
    rows.into_iter().map(AnalysisTask::try_from).collect()
}

/// Binds every column of `INSERT_TASK` in statement order.
macro_rules! bind_insert {
    ($query:expr, $row:expr) => {{
        let row = $row;
        $query
            .bind(row.id)
            .bind(row.ecosystem)
            .bind(row.package_name)
            .bind(row.package_version)
            .bind(row.mode)
            .bind(row.local_artifact)
            .bind(row.purl)
            .bind(row.status)
            .bind(row.priority)
            .bind(row.queued_at)
            .bind(row.queue_position)
            .bind(row.started_at)
            .bind(row.completed_at)
            .bind(row.last_heartbeat)
            .bind(row.container_id)
            .bind(row.duration_seconds)
            .bind(row.report)
            .bind(row.download_url)
            .bind(row.error_message)
            .bind(row.error_category)
            .bind(row.error_details)
            .bind(row.retry_count)
            .bind(row.max_retries)
            .bind(row.timeout_minutes)
            .bind(row.created_at)
    }};
}

/// Binds every parameter of `UPDATE_TASK` in statement order.
macro_rules! bind_update {
    ($query:expr, $row:expr) => {{
        let row = $row;
        $query
            .bind(row.id)
            .bind(row.status)
            .bind(row.priority)
            .bind(row.queued_at)
            .bind(row.queue_position)
            .bind(row.started_at)
            .bind(row.completed_at)
            .bind(row.last_heartbeat)
            .bind(row.container_id)
            .bind(row.duration_seconds)
            .bind(row.report)
            .bind(row.download_url)
            .bind(row.error_message)
            .bind(row.error_category)
            .bind(row.error_details)
            .bind(row.retry_count)
            .bind(row.max_retries)
            .bind(row.timeout_minutes)
    }};
}

pub(crate) use bind_insert;
pub(crate) use bind_update;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::task::{
        AnalysisRequest, Ecosystem, ErrorCategory, TaskOptions, TaskStatus,
    };

    #[test]
    fn test_row_conversion_preserves_fields() {
        let mut task = AnalysisTask::new(
            AnalysisRequest::new(Ecosystem::CratesIo, "serde")
                .with_version("1.0.200")
                .with_local_artifact("/tmp/serde.crate"),
            TaskOptions::default().with_priority(7),
        );
        task.queue_position = Some(2);
        task.error_category = Some(ErrorCategory::ContainerError);
        task.error_details = Some(serde_json::json!({"k": "v"}));

        let row = TaskRow::from(&task);
        assert_eq!(row.ecosystem, "crates.io");
        assert_eq!(row.status, "queued");
        assert_eq!(row.error_category.as_deref(), Some("container_error"));

        let back = AnalysisTask::try_from(row).unwrap();
        assert_eq!(back, task);
    }

    #[test]
    fn test_unknown_status_is_corrupt() {
        let task = AnalysisTask::new(
            AnalysisRequest::new(Ecosystem::Npm, "left-pad"),
            TaskOptions::default(),
        );
        let mut row = TaskRow::from(&task);
        row.status = "paused".to_string();

        let err = AnalysisTask::try_from(row).unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { .. }));
        assert!(err.to_string().contains("paused"));
        assert_eq!(task.status, TaskStatus::Queued);
    }

    #[test]
    fn test_negative_counter_is_corrupt() {
        let task = AnalysisTask::new(
            AnalysisRequest::new(Ecosystem::Npm, "left-pad"),
            TaskOptions::default(),
        );
        let mut row = TaskRow::from(&task);
        row.retry_count = -1;
        assert!(AnalysisTask::try_from(row).is_err());
    }
}
