//! Thin layer over bollard for the container calls an analysis run needs.
//!
//! This module provides a high-level interface to the Docker operations the
//! analysis runner needs: volumes, images, the container lifecycle, logs and
//! copying result files out of a container.

use std::collections::HashMap;
use std::io::Read;

use bollard::container::{
    Config, CreateContainerOptions, DownloadFromContainerOptions, InspectContainerOptions,
    LogOutput, LogsOptions, RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
    WaitContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::image::CreateImageOptions;
use bollard::models::{HostConfig, HostConfigCgroupnsModeEnum};
use bollard::volume::CreateVolumeOptions;
use bollard::Docker;
use futures::StreamExt;

use crate::error::DockerError;
use crate::execution::resources::ExecutionLimits;

/// Everything needed to create one analysis container.
#[derive(Debug, Clone)]
pub struct ContainerConfig {
    /// Unique name for the container.
    pub name: String,
    /// Docker image to use.
    pub image: String,
    /// Command (arguments to the image entrypoint).
    pub cmd: Option<Vec<String>>,
    pub limits: ExecutionLimits,
    /// Volume mounts (`source:target` format).
    pub volumes: Vec<String>,
    /// Run with extended privileges.
    pub privileged: bool,
    /// Share the host cgroup namespace.
    pub host_cgroupns: bool,
    /// Docker network mode; `None` keeps the daemon default.
    pub network_mode: Option<String>,
    /// Labels attached to the container.
    pub labels: HashMap<String, String>,
}

impl ContainerConfig {
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            cmd: None,
            limits: ExecutionLimits::default(),
            volumes: Vec::new(),
            privileged: false,
            host_cgroupns: false,
            network_mode: None,
            labels: HashMap::new(),
        }
    }

    pub fn with_limits(mut self, limits: ExecutionLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_cmd(mut self, cmd: Vec<String>) -> Self {
        self.cmd = Some(cmd);
        self
    }

    /// Adds volume mounts.
    pub fn with_volumes(mut self, volumes: Vec<String>) -> Self {
        self.volumes = volumes;
        self
    }

    /// Runs the container privileged in the host cgroup namespace.
    ///
    /// The analysis sandbox starts nested containers and needs both.
    pub fn with_sandbox_privileges(mut self) -> Self {
        self.privileged = true;
        self.host_cgroupns = true;
        self
    }

    pub fn with_network_mode(mut self, mode: impl Into<String>) -> Self {
        self.network_mode = Some(mode.into());
        self
    }

    /// Adds a label.
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }
}

/// Returns whether a bollard error is a 404 from the daemon.
fn is_not_found(err: &BollardError) -> bool {
    matches!(
        err,
        BollardError::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

/// Handle to the local Docker daemon.
#[derive(Clone)]
pub struct DockerClient {
    docker: Docker,
}

impl DockerClient {
    /// Connects using `DOCKER_HOST` or the platform socket.
    ///
    /// # Errors
    ///
    /// `DockerError::DaemonUnavailable` when no daemon answers.
    pub fn new() -> Result<Self, DockerError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| DockerError::DaemonUnavailable(format!("Failed to connect: {e}")))?;

        Ok(Self { docker })
    }

    /// Creates a named volume unless it already exists.
    ///
    /// # Returns
    ///
    /// `true` if the volume was created.
    pub async fn ensure_volume(&self, name: &str) -> Result<bool, DockerError> {
        match self.docker.inspect_volume(name).await {
            Ok(_) => return Ok(false),
            Err(e) if is_not_found(&e) => {}
            Err(e) => {
                return Err(DockerError::VolumeFailed {
                    name: name.to_string(),
                    reason: e.to_string(),
                })
            }
        }

        let options = CreateVolumeOptions {
            name: name.to_string(),
            ..Default::default()
        };
        self.docker
            .create_volume(options)
            .await
            .map_err(|e| DockerError::VolumeFailed {
                name: name.to_string(),
                reason: e.to_string(),
            })?;

        Ok(true)
    }

    /// Creates (but does not start) the container, returning its id.
    pub async fn create_container(&self, config: ContainerConfig) -> Result<String, DockerError> {
        let host_config = HostConfig {
            memory: Some(config.limits.memory_bytes()),
            cpu_period: Some(config.limits.cpu_period()),
            cpu_quota: Some(config.limits.cpu_quota()),
            pids_limit: config.limits.max_processes.map(|p| p as i64),
            network_mode: config.network_mode.clone(),
            privileged: Some(config.privileged),
            cgroupns_mode: config
                .host_cgroupns
                .then_some(HostConfigCgroupnsModeEnum::HOST),
            binds: if config.volumes.is_empty() {
                None
            } else {
                Some(config.volumes.clone())
            },
            ..Default::default()
        };

        let container_config = Config {
            image: Some(config.image.clone()),
            cmd: config.cmd.clone(),
            labels: if config.labels.is_empty() {
                None
            } else {
                Some(config.labels.clone())
            },
            host_config: Some(host_config),
            tty: Some(false),
            attach_stdin: Some(false),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: config.name.clone(),
            platform: None,
        };

        let response = self
            .docker
            .create_container(Some(options), container_config)
            .await
            .map_err(|e| DockerError::CreateFailed(e.to_string()))?;

        for warning in &response.warnings {
            tracing::warn!(container = %config.name, warning = %warning, "Docker create warning");
        }

        Ok(response.id)
    }

    pub async fn start_container(&self, id: &str) -> Result<(), DockerError> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| DockerError::RunFailed(format!("start {id}: {e}")))?;

        Ok(())
    }

    /// Sends SIGTERM, then SIGKILL after `grace_secs`. A container that has
    /// already exited counts as stopped.
    pub async fn stop_container(&self, id: &str, grace_secs: i64) -> Result<(), DockerError> {
        let options = StopContainerOptions { t: grace_secs };

        match self.docker.stop_container(id, Some(options)).await {
            Ok(()) => Ok(()),
            // 304: already stopped
            Err(BollardError::DockerResponseServerError {
                status_code: 304, ..
            }) => Ok(()),
            Err(e) if is_not_found(&e) => Err(DockerError::ContainerNotFound { id: id.to_string() }),
            Err(e) => Err(DockerError::RunFailed(format!("stop {id}: {e}"))),
        }
    }

    /// Removes a container; `force` also kills it if still running.
    pub async fn remove_container(&self, id: &str, force: bool) -> Result<(), DockerError> {
        let options = RemoveContainerOptions {
            force,
            // Named volumes hold the results and must survive the container.
            v: false,
            ..Default::default()
        };

        self.docker
            .remove_container(id, Some(options))
            .await
            .map_err(|e| {
                if is_not_found(&e) {
                    DockerError::ContainerNotFound { id: id.to_string() }
                } else {
                    DockerError::RunFailed(format!("Failed to remove container: {e}"))
                }
            })?;

        Ok(())
    }

    /// Collects stdout and stderr of a container, interleaved in arrival
    /// order. `tail` keeps only the last lines; `None` returns everything.
    pub async fn get_logs(&self, id: &str, tail: Option<usize>) -> Result<String, DockerError> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            follow: false,
            timestamps: false,
            tail: tail.map_or_else(|| "all".to_string(), |n| n.to_string()),
            ..Default::default()
        };

        let mut logs = self.docker.logs(id, Some(options));
        let mut output = String::new();

        while let Some(chunk) = logs.next().await {
            match chunk {
                Ok(LogOutput::StdOut { message }) | Ok(LogOutput::StdErr { message }) => {
                    output.push_str(&String::from_utf8_lossy(&message));
                }
                Ok(_) => {}
                Err(e) if is_not_found(&e) => {
                    return Err(DockerError::ContainerNotFound { id: id.to_string() });
                }
                Err(e) => {
                    return Err(DockerError::RunFailed(format!("log stream broke: {e}")));
                }
            }
        }

        Ok(output)
    }

    /// Returns whether a container exists and is running.
    pub async fn is_running(&self, id: &str) -> Result<bool, DockerError> {
        let info = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .map_err(|e| {
                if is_not_found(&e) {
                    DockerError::ContainerNotFound { id: id.to_string() }
                } else {
                    DockerError::RunFailed(format!("inspect {id}: {e}"))
                }
            })?;

        Ok(info.state.and_then(|s| s.running).unwrap_or(false))
    }

    /// Pulls `image`, draining the progress stream.
    ///
    /// # Arguments
    ///
    /// * `image` - Image name with optional tag (e.g., "docker.io/pakaremon/analysis")
    pub async fn pull_image(&self, image: &str) -> Result<(), DockerError> {
        let options = CreateImageOptions {
            from_image: image,
            ..Default::default()
        };

        let mut stream = self.docker.create_image(Some(options), None, None);

        while let Some(result) = stream.next().await {
            result.map_err(|e| DockerError::PullFailed {
                image: image.to_string(),
                reason: e.to_string(),
            })?;
        }

        Ok(())
    }

    pub async fn image_exists(&self, image: &str) -> bool {
        self.docker.inspect_image(image).await.is_ok()
    }

    /// Blocks until the container exits and returns its exit code.
    pub async fn wait_container(&self, id: &str) -> Result<i64, DockerError> {
        let options = WaitContainerOptions {
            condition: "not-running",
        };

        let mut stream = self.docker.wait_container(id, Some(options));

        match stream.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            // bollard reports a non-zero exit as an error carrying the code.
            Some(Err(BollardError::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(e)) if is_not_found(&e) => {
                Err(DockerError::ContainerNotFound { id: id.to_string() })
            }
            Some(Err(e)) => Err(DockerError::RunFailed(format!(
                "Error waiting for container: {e}"
            ))),
            None => Err(DockerError::RunFailed(
                "Container wait stream ended without a status".to_string(),
            )),
        }
    }

    /// Copies a single file out of a (possibly stopped) container.
    pub async fn read_file(&self, id: &str, path: &str) -> Result<Vec<u8>, DockerError> {
        let options = DownloadFromContainerOptions { path };
        let mut stream = self.docker.download_from_container(id, Some(options));

        let mut archive_bytes = Vec::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| {
                if is_not_found(&e) {
                    DockerError::CopyFailed(format!("{path} not found in container {id}"))
                } else {
                    DockerError::CopyFailed(e.to_string())
                }
            })?;
            archive_bytes.extend_from_slice(&chunk);
        }

        extract_first_file(&archive_bytes)
            .ok_or_else(|| DockerError::CopyFailed(format!("{path} is not a regular file")))
    }
}

/// Returns the contents of the first regular file in a tar archive.
fn extract_first_file(archive_bytes: &[u8]) -> Option<Vec<u8>> {
    let mut archive = tar::Archive::new(archive_bytes);
    let entries = archive.entries().ok()?;
    for entry in entries {
        let mut entry = entry.ok()?;
        if entry.header().entry_type().is_file() {
            let mut contents = Vec::new();
            entry.read_to_end(&mut contents).ok()?;
            return Some(contents);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_container_config_builder() {
        let config = ContainerConfig::new("analysis-1", "docker.io/pakaremon/analysis")
            .with_cmd(vec!["analyze".to_string(), "-mode".to_string(), "dynamic".to_string()])
            .with_volumes(vec!["analysis_results:/results".to_string()])
            .with_sandbox_privileges()
            .with_network_mode("bridge")
            .with_label("packamal.task_id", "abc");

        assert_eq!(config.name, "analysis-1");
        assert_eq!(config.limits.memory_mb, 4096);
        assert_eq!(config.limits.cpu_cores, 2.0);
        assert_eq!(config.cmd.unwrap().len(), 3);
        assert_eq!(config.volumes.len(), 1);
        assert!(config.privileged);
        assert!(config.host_cgroupns);
        assert_eq!(config.network_mode.unwrap(), "bridge");
        assert_eq!(config.labels["packamal.task_id"], "abc");
    }

    #[test]
    fn test_container_config_with_limits() {
        let config = ContainerConfig::new("test", "alpine").with_limits(ExecutionLimits::new(512, 0.5));
        assert_eq!(config.limits.memory_mb, 512);
        assert!(!config.privileged);
    }

    #[test]
    fn test_extract_first_file_from_tar() {
        let mut builder = tar::Builder::new(Vec::new());
        let data = br#"{"ok":true}"#;
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, "lodash.json", &data[..])
            .unwrap();
        let bytes = builder.into_inner().unwrap();

        assert_eq!(extract_first_file(&bytes).unwrap(), data.to_vec());
    }

    #[test]
    fn test_extract_from_empty_archive() {
        let bytes = tar::Builder::new(Vec::new()).into_inner().unwrap();
        assert!(extract_first_file(&bytes).is_none());
    }

    /// Requires a local Docker daemon.
    #[tokio::test]
    #[ignore]
    async fn test_docker_volume_round_trip() {
        let client = DockerClient::new().unwrap();
        client.ensure_volume("packamal_test_volume").await.unwrap();
        assert!(!client.ensure_volume("packamal_test_volume").await.unwrap());
    }
}
