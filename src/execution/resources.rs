//! Resource limits for analysis containers.

use serde::{Deserialize, Serialize};

/// Resource limits applied to an analysis container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionLimits {
    /// Memory limit in megabytes.
    pub memory_mb: u64,
    /// CPU cores available (e.g., 0.5, 1.0, 2.0).
    pub cpu_cores: f64,
    /// Maximum number of processes allowed, unlimited when `None`.
    pub max_processes: Option<u64>,
}

impl Default for ExecutionLimits {
    /// Two cores and 4 GiB, the footprint the analysis sandbox is sized for.
    fn default() -> Self {
        Self {
            memory_mb: 4096,
            cpu_cores: 2.0,
            max_processes: None,
        }
    }
}

impl ExecutionLimits {
    /// Creates new execution limits with the given parameters.
    pub fn new(memory_mb: u64, cpu_cores: f64) -> Self {
        Self {
            memory_mb,
            cpu_cores,
            max_processes: None,
        }
    }

    /// Caps the number of processes in the container.
    pub fn with_max_processes(mut self, max: u64) -> Self {
        self.max_processes = Some(max);
        self
    }

    /// Returns memory limit in bytes.
    pub fn memory_bytes(&self) -> i64 {
        (self.memory_mb * 1024 * 1024) as i64
    }

    /// Returns CPU period in microseconds (fixed at 100ms).
    pub fn cpu_period(&self) -> i64 {
        100_000
    }

    /// Returns CPU quota based on cores allocated.
    ///
    /// Formula: quota = period * cores
    /// e.g., 2.0 cores = 200000 quota (200% of one CPU)
    pub fn cpu_quota(&self) -> i64 {
        (self.cpu_period() as f64 * self.cpu_cores) as i64
    }
}
