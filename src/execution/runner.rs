//! Docker-backed executor running the package analysis image.
//!
//! One analysis is one container:
//!
//! ```text
//! ensure volumes → pull image (if absent) → create → start → wait
//!     → exit 0: read /results/<package>.json → remove
//!     → exit n: capture log tail → remove → analysis_failure
//! ```

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::OnceCell;
use uuid::Uuid;

use super::docker_client::{ContainerConfig, DockerClient};
use super::executor::{ContainerExecutor, ExecutionEvents, ExecutionOutput};
use super::resources::ExecutionLimits;
use crate::error::{AnalysisError, DockerError, ExecutorError};
use crate::scheduler::task::AnalysisRequest;

/// Default analysis image.
pub const DEFAULT_ANALYSIS_IMAGE: &str = "docker.io/pakaremon/analysis";

/// Lines of container output attached to a failed analysis.
const FAILURE_LOG_TAIL: usize = 50;

/// Seconds between SIGTERM and SIGKILL when terminating a container.
const STOP_GRACE_SECS: i64 = 10;

/// Named volumes mounted into every analysis container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnalysisVolumes {
    pub results: String,
    pub static_results: String,
    pub file_write_results: String,
    pub analyzed_packages: String,
    pub logs: String,
    pub strace_logs: String,
    pub container_data: String,
}

impl Default for AnalysisVolumes {
    fn default() -> Self {
        Self {
            results: "analysis_results".to_string(),
            static_results: "analysis_static_results".to_string(),
            file_write_results: "analysis_write_results".to_string(),
            analyzed_packages: "analysis_analyzed_packages".to_string(),
            logs: "analysis_logs".to_string(),
            strace_logs: "analysis_strace_logs".to_string(),
            container_data: "analysis_container_data".to_string(),
        }
    }
}

impl AnalysisVolumes {
    /// All volume names, in mount order.
    pub fn names(&self) -> [&str; 7] {
        [
            self.container_data.as_str(),
            self.results.as_str(),
            self.static_results.as_str(),
            self.file_write_results.as_str(),
            self.logs.as_str(),
            self.analyzed_packages.as_str(),
            self.strace_logs.as_str(),
        ]
    }

    /// Bind specifications for the container.
    pub fn binds(&self) -> Vec<String> {
        vec![
            format!("{}:/var/lib/containers", self.container_data),
            format!("{}:/results", self.results),
            format!("{}:/staticResults", self.static_results),
            format!("{}:/writeResults", self.file_write_results),
            format!("{}:/tmp", self.logs),
            format!("{}:/analyzedPackages", self.analyzed_packages),
            format!("{}:/straceLogs", self.strace_logs),
        ]
    }
}

/// Settings of the Docker executor.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub image: String,
    pub volumes: AnalysisVolumes,
    pub limits: ExecutionLimits,
    /// Run the analysis without network access.
    pub offline: bool,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            image: DEFAULT_ANALYSIS_IMAGE.to_string(),
            volumes: AnalysisVolumes::default(),
            limits: ExecutionLimits::default(),
            offline: false,
        }
    }
}

/// Builds the arguments passed to the analysis image.
pub fn analysis_args(request: &AnalysisRequest, no_pull: bool) -> Vec<String> {
    let mut args: Vec<String> = [
        "analyze",
        "-dynamic-bucket",
        "file:///results/",
        "-file-writes-bucket",
        "file:///writeResults/",
        "-static-bucket",
        "file:///staticResults/",
        "-analyzed-pkg-bucket",
        "file:///analyzedPackages/",
        "-execution-log-bucket",
        "file:///results",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();

    args.extend(["-ecosystem".to_string(), request.ecosystem.to_string()]);
    args.extend(["-package".to_string(), request.package_name.clone()]);
    if let Some(version) = &request.version {
        args.extend(["-version".to_string(), version.clone()]);
    }
    args.extend(["-mode".to_string(), request.mode.to_string()]);
    if let Some(mounted) = request.local_artifact.as_deref().and_then(mounted_artifact_path) {
        args.extend(["-local".to_string(), mounted]);
    }
    if no_pull {
        args.push("-nopull".to_string());
    }
    args
}

/// Path a local artifact is mounted at inside the container.
fn mounted_artifact_path(path: &Path) -> Option<String> {
    path.file_name()
        .map(|name| format!("/{}", name.to_string_lossy()))
}

/// Path of the result file the analysis writes for a package.
pub fn result_file_path(package_name: &str) -> String {
    format!("/results/{}.json", package_name.to_lowercase())
}

/// Container executor running the analysis image through Docker.
pub struct DockerExecutor {
    client: DockerClient,
    config: RunnerConfig,
    volumes_ready: OnceCell<()>,
}

impl DockerExecutor {
    pub fn new(client: DockerClient, config: RunnerConfig) -> Self {
        Self {
            client,
            config,
            volumes_ready: OnceCell::new(),
        }
    }

    /// Connects to the local Docker daemon.
    pub fn connect(config: RunnerConfig) -> Result<Self, DockerError> {
        Ok(Self::new(DockerClient::new()?, config))
    }

    async fn ensure_volumes(&self) -> Result<(), DockerError> {
        self.volumes_ready
            .get_or_try_init(|| async {
                for name in self.config.volumes.names() {
                    if self.client.ensure_volume(name).await? {
                        tracing::info!(volume = name, "Created Docker volume");
                    }
                }
                Ok::<(), DockerError>(())
            })
            .await?;
        Ok(())
    }

    /// Pulls the image when absent. Returns whether it was already present.
    async fn ensure_image(&self) -> Result<bool, DockerError> {
        if self.client.image_exists(&self.config.image).await {
            return Ok(true);
        }
        tracing::info!(image = %self.config.image, "Pulling analysis image");
        self.client.pull_image(&self.config.image).await?;
        Ok(false)
    }

    async fn validate_local_artifact(path: &Path) -> Result<PathBuf, AnalysisError> {
        let invalid = |reason: String| {
            AnalysisError::analysis_failure(reason)
                .with_details(serde_json::json!({ "local_artifact": path.display().to_string() }))
        };
        let metadata = tokio::fs::metadata(path).await.map_err(|e| {
            invalid(format!(
                "Local package path {} is not readable: {e}",
                path.display()
            ))
        })?;
        if !metadata.is_file() {
            return Err(invalid(format!(
                "Local package path {} is not a file",
                path.display()
            )));
        }
        tokio::fs::canonicalize(path)
            .await
            .map_err(|e| invalid(format!("Cannot resolve {}: {e}", path.display())))
    }

    fn container_config(
        &self,
        task_id: Uuid,
        request: &AnalysisRequest,
        local_artifact: Option<&Path>,
        no_pull: bool,
    ) -> ContainerConfig {
        let mut volumes = self.config.volumes.binds();
        if let Some(path) = local_artifact {
            if let Some(mounted) = mounted_artifact_path(path) {
                volumes.push(format!("{}:{}", path.display(), mounted));
            }
        }

        let mut config = ContainerConfig::new(format!("packamal-analysis-{task_id}"), &self.config.image)
            .with_cmd(analysis_args(request, no_pull))
            .with_volumes(volumes)
            .with_limits(self.config.limits.clone())
            .with_sandbox_privileges()
            .with_label("packamal.task_id", task_id.to_string())
            .with_label("packamal.package", request.package_name.clone());
        if self.config.offline {
            config = config.with_network_mode("none");
        }
        config
    }

    /// Removes a finished container, logging failures.
    async fn cleanup(&self, container_id: &str) {
        if let Err(e) = self.client.remove_container(container_id, true).await {
            tracing::warn!(container_id, error = %e, "Failed to remove analysis container");
        }
    }

    async fn run_container(
        &self,
        container_id: &str,
        request: &AnalysisRequest,
    ) -> Result<serde_json::Value, AnalysisError> {
        self.client.start_container(container_id).await?;
        let exit_code = self.client.wait_container(container_id).await?;

        if exit_code != 0 {
            let log_tail = self
                .client
                .get_logs(container_id, Some(FAILURE_LOG_TAIL))
                .await
                .unwrap_or_else(|e| format!("<logs unavailable: {e}>"));
            return Err(AnalysisError::analysis_failure(format!(
                "Analysis container exited with code {exit_code}"
            ))
            .with_details(serde_json::json!({
                "exit_code": exit_code,
                "container_id": container_id,
                "log_tail": log_tail,
            })));
        }

        let result_path = result_file_path(&request.package_name);
        let bytes = self.client.read_file(container_id, &result_path).await.map_err(|e| {
            AnalysisError::analysis_failure(format!("Failed to retrieve analysis result: {e}"))
                .with_details(serde_json::json!({ "result_file": result_path }))
        })?;

        serde_json::from_slice(&bytes).map_err(|e| {
            AnalysisError::analysis_failure(format!("Failed to parse analysis result: {e}"))
                .with_details(serde_json::json!({ "result_file": result_path }))
        })
    }
}

#[async_trait]
impl ContainerExecutor for DockerExecutor {
    async fn execute(
        &self,
        task_id: Uuid,
        request: &AnalysisRequest,
        events: ExecutionEvents,
    ) -> Result<ExecutionOutput, AnalysisError> {
        let local_artifact = match &request.local_artifact {
            Some(path) => Some(Self::validate_local_artifact(path).await?),
            None => None,
        };

        self.ensure_volumes().await?;
        let no_pull = self.ensure_image().await?;

        let config = self.container_config(task_id, request, local_artifact.as_deref(), no_pull);
        let container_id = self.client.create_container(config).await?;
        events.container_started(&container_id);

        tracing::info!(
            task_id = %task_id,
            container_id = %container_id,
            ecosystem = %request.ecosystem,
            package = %request.package_name,
            version = request.version_label(),
            "Analysis container created"
        );

        let result = self.run_container(&container_id, request).await;
        self.cleanup(&container_id).await;

        result.map(|data| ExecutionOutput {
            data,
            container_id: Some(container_id),
        })
    }

    async fn terminate(&self, container_id: &str) -> Result<(), ExecutorError> {
        match self.client.stop_container(container_id, STOP_GRACE_SECS).await {
            Ok(()) => {}
            Err(DockerError::ContainerNotFound { .. }) => return Ok(()),
            Err(e) => return Err(e.into()),
        }
        match self.client.remove_container(container_id, true).await {
            Ok(()) | Err(DockerError::ContainerNotFound { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn fetch_logs(&self, container_id: &str, tail: usize) -> Result<String, ExecutorError> {
        Ok(self.client.get_logs(container_id, Some(tail)).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::task::{AnalysisMode, Ecosystem};

    #[test]
    fn test_analysis_args_for_registry_package() {
        let request = AnalysisRequest::new(Ecosystem::Pypi, "Requests").with_version("2.31.0");
        let args = analysis_args(&request, true);

        assert_eq!(args[0], "analyze");
        let joined = args.join(" ");
        assert!(joined.contains("-dynamic-bucket file:///results/"));
        assert!(joined.contains("-ecosystem pypi -package Requests -version 2.31.0 -mode dynamic"));
        assert!(joined.ends_with("-nopull"));
        assert!(!joined.contains("-local"));
    }

    #[test]
    fn test_analysis_args_latest_and_local() {
        let request = AnalysisRequest::new(Ecosystem::Npm, "pkg")
            .with_mode(AnalysisMode::Static)
            .with_local_artifact("/srv/uploads/pkg-1.0.0.tgz");
        let args = analysis_args(&request, false);
        let joined = args.join(" ");

        assert!(!joined.contains("-version"));
        assert!(joined.contains("-mode static"));
        assert!(joined.contains("-local /pkg-1.0.0.tgz"));
        assert!(!joined.contains("-nopull"));
    }

    #[test]
    fn test_result_file_path_is_lowercase() {
        assert_eq!(result_file_path("Django"), "/results/django.json");
    }

    #[test]
    fn test_volume_binds() {
        let volumes = AnalysisVolumes::default();
        let binds = volumes.binds();
        assert_eq!(binds.len(), 7);
        assert!(binds.contains(&"analysis_results:/results".to_string()));
        assert!(binds.contains(&"analysis_container_data:/var/lib/containers".to_string()));
        assert!(binds.contains(&"analysis_logs:/tmp".to_string()));
        assert_eq!(volumes.names().len(), 7);
    }

    #[tokio::test]
    async fn test_missing_local_artifact_fails_analysis() {
        let dir = tempfile::tempdir().unwrap();
        let err = DockerExecutor::validate_local_artifact(&dir.path().join("missing.tgz"))
            .await
            .unwrap_err();
        assert_eq!(err.category, crate::scheduler::task::ErrorCategory::AnalysisFailure);

        let err = DockerExecutor::validate_local_artifact(dir.path())
            .await
            .unwrap_err();
        assert!(err.message.contains("not a file"));
    }
}
