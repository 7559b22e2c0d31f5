//! Container executor interface consumed by the scheduler.

use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::{AnalysisError, ExecutorError};
use crate::scheduler::task::AnalysisRequest;

/// Progress reported by an executor while an analysis runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionEvent {
    /// The analysis container exists and has an id.
    ContainerStarted { container_id: String },
}

/// Sender half handed to [`ContainerExecutor::execute`].
///
/// Sending never fails the analysis: if nobody listens any more the event is
/// dropped.
#[derive(Debug, Clone)]
pub struct ExecutionEvents {
    tx: Option<mpsc::UnboundedSender<ExecutionEvent>>,
}

impl ExecutionEvents {
    /// Creates a connected sender/receiver pair.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ExecutionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// Creates a sender that discards every event.
    pub fn noop() -> Self {
        Self { tx: None }
    }

    /// Reports the id of the container running the analysis.
    pub fn container_started(&self, container_id: impl Into<String>) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(ExecutionEvent::ContainerStarted {
                container_id: container_id.into(),
            });
        }
    }
}

/// Output of a successful analysis run.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionOutput {
    /// Raw JSON emitted by the analysis.
    pub data: serde_json::Value,
    /// Container that produced the result, when known.
    pub container_id: Option<String>,
}

/// Runs one analysis to completion inside an isolated container.
#[async_trait]
pub trait ContainerExecutor: Send + Sync {
    /// Runs the analysis described by `request` and returns its report data.
    ///
    /// Implementations report the container id through `events` as soon as it
    /// is known so the run can be stopped from outside.
    async fn execute(
        &self,
        task_id: Uuid,
        request: &AnalysisRequest,
        events: ExecutionEvents,
    ) -> Result<ExecutionOutput, AnalysisError>;

    /// Stops and removes a container.
    async fn terminate(&self, container_id: &str) -> Result<(), ExecutorError>;

    /// Returns the last `tail` lines of a container's output.
    async fn fetch_logs(&self, container_id: &str, tail: usize) -> Result<String, ExecutorError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_events_channel_delivers() {
        let (events, mut rx) = ExecutionEvents::channel();
        events.container_started("abc123");
        assert_eq!(
            rx.recv().await,
            Some(ExecutionEvent::ContainerStarted {
                container_id: "abc123".to_string()
            })
        );
    }

    #[test]
    fn test_events_survive_dropped_receiver() {
        let (events, rx) = ExecutionEvents::channel();
        drop(rx);
        events.container_started("abc123");
        ExecutionEvents::noop().container_started("abc123");
    }
}
