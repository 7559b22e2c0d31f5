//! Queue position maintenance.
//!
//! `queue_position` is display-only state: a dense 1-based rank over queued
//! tasks in dispatch order. Nothing in the scheduler reads it back.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::storage::{StoreError, TaskStore, TaskTransaction};

/// Recomputes queue positions after the queued set changes.
#[derive(Clone)]
pub struct QueueMaintainer {
    store: Arc<dyn TaskStore>,
}

impl QueueMaintainer {
    pub fn new(store: Arc<dyn TaskStore>) -> Self {
        Self { store }
    }

    /// Assigns positions 1..N to the queued tasks in one transaction.
    ///
    /// Returns the number of queued tasks.
    pub async fn recompute(&self) -> Result<usize, StoreError> {
        let mut tx = self.store.begin().await?;
        let count = Self::recompute_in(tx.as_mut()).await?;
        tx.commit().await?;
        debug!(queued = count, "Queue positions recomputed");
        Ok(count)
    }

    /// Same as [`recompute`](Self::recompute) inside a caller's transaction.
    pub async fn recompute_in(tx: &mut dyn TaskTransaction) -> Result<usize, StoreError> {
        let queued = tx.query_queued_ordered().await?;
        for (rank, task) in queued.iter().enumerate() {
            let position = position_for_rank(rank);
            if task.queue_position != Some(position) {
                tx.set_queue_position(task.id, Some(position)).await?;
            }
        }
        Ok(queued.len())
    }

    /// Recomputes positions, logging instead of failing.
    pub async fn refresh(&self) {
        if let Err(e) = self.recompute().await {
            warn!(error = %e, "Failed to recompute queue positions");
        }
    }
}

/// 1-based position of the task at `rank`, saturating at `u32::MAX`.
fn position_for_rank(rank: usize) -> u32 {
    rank.checked_add(1)
        .and_then(|position| u32::try_from(position).ok())
        .unwrap_or(u32::MAX)
}
