//! Container execution layer.
//!
//! The scheduler only sees the [`ContainerExecutor`] trait. [`DockerExecutor`]
//! implements it with the bollard crate by running the analysis image in a
//! privileged container with the result volumes mounted.
//!
//! # Example
//!
//! ```ignore
//! use packamal_scheduler::execution::{DockerExecutor, ExecutionEvents, RunnerConfig};
//!
//! let executor = DockerExecutor::connect(RunnerConfig::default())?;
//! let output = executor
//!     .execute(task_id, &request, ExecutionEvents::noop())
//!     .await?;
//! ```

pub mod docker_client;
pub mod executor;
pub mod resources;
pub mod runner;

pub use docker_client::{ContainerConfig, DockerClient};
pub use executor::{ContainerExecutor, ExecutionEvent, ExecutionEvents, ExecutionOutput};
pub use resources::ExecutionLimits;
pub use runner::{AnalysisVolumes, DockerExecutor, RunnerConfig, DEFAULT_ANALYSIS_IMAGE};
