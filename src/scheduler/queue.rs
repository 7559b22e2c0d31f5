//! Work queue of dispatch jobs.
//!
//! Workers pull [`DispatchJob`]s from a [`DispatchQueue`] and hand them to the
//! dispatcher. A job is either a plain attempt (new task, contention deferral,
//! dispatch-next hand-off) or a retry of a failed task. Jobs may carry a
//! `not_before` instant and are invisible to `dequeue` until it passes.
//!
//! # Redis layout
//!
//! - `{queue_name}`: ready jobs (LPUSH / BRPOPLPUSH, FIFO)
//! - `{queue_name}:delayed`: sorted set of future jobs scored by due time in ms
//! - `{queue_name}:processing`: jobs handed to a worker (for crash recovery)
//!
//! Jobs are atomically moved from the ready list to the processing list when
//! dequeued. If a worker crashes, jobs left in the processing list are moved
//! back on the next pool start.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Notify;
use uuid::Uuid;

/// Failures of a [`DispatchQueue`] backend.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Redis connection failed: {0}")]
    ConnectionFailed(String),

    /// Redis operation failed.
    #[error("Redis operation failed: {0}")]
    RedisError(#[from] redis::RedisError),

    /// A job did not survive the trip through JSON.
    #[error("Serialization failed: {0}")]
    SerializationFailed(#[from] serde_json::Error),

    /// The in-memory queue lock was poisoned by a panicking holder.
    #[error("Queue state poisoned")]
    Poisoned,
}

/// What the dispatcher should do with a job's task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchKind {
    /// Run the dispatcher's attempt for a queued task.
    Attempt,
    /// Re-queue a failed task and attempt it again.
    Retry,
}

/// A unit of work for a scheduler worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchJob {
    /// Unique job id (not the task id).
    pub id: Uuid,
    /// Task this job acts on.
    pub task_id: Uuid,
    pub kind: DispatchKind,
    /// Earliest instant the job may be handed to a worker.
    pub not_before: DateTime<Utc>,
    pub enqueued_at: DateTime<Utc>,
}

impl DispatchJob {
    fn new(task_id: Uuid, kind: DispatchKind) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            task_id,
            kind,
            not_before: now,
            enqueued_at: now,
        }
    }

    /// An immediate dispatch attempt.
    pub fn attempt(task_id: Uuid) -> Self {
        Self::new(task_id, DispatchKind::Attempt)
    }

    /// An immediate retry of a failed task.
    pub fn retry(task_id: Uuid) -> Self {
        Self::new(task_id, DispatchKind::Retry)
    }

    /// Pushes the due time `delay` into the future.
    pub fn delayed(mut self, delay: Duration) -> Self {
        if let Some(not_before) = chrono::Duration::from_std(delay)
            .ok()
            .and_then(|delay| self.enqueued_at.checked_add_signed(delay))
        {
            self.not_before = not_before;
        }
        self
    }

    /// Returns whether the job may run at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.not_before <= now
    }

    /// Time left until the job is due, zero when already due.
    pub fn remaining_delay(&self, now: DateTime<Utc>) -> Duration {
        (self.not_before - now).to_std().unwrap_or(Duration::ZERO)
    }
}

/// A queue of dispatch jobs shared by producers and the worker pool.
#[async_trait]
pub trait DispatchQueue: Send + Sync {
    /// Adds a job. Jobs whose `not_before` lies in the future are held back.
    async fn submit(&self, job: DispatchJob) -> Result<(), QueueError>;

    /// Takes the next due job, waiting up to `wait` for one to become due.
    async fn dequeue(&self, wait: Duration) -> Result<Option<DispatchJob>, QueueError>;

    /// Marks a dequeued job as handled.
    async fn ack(&self, job: &DispatchJob) -> Result<(), QueueError>;

    /// Number of jobs waiting, due or not.
    async fn len(&self) -> Result<usize, QueueError>;

    /// Returns whether a job of `kind` for `task_id` is waiting or being
    /// handled.
    async fn has_pending(&self, task_id: Uuid, kind: DispatchKind) -> Result<bool, QueueError>;

    /// Returns jobs abandoned by crashed workers to the ready set.
    async fn recover(&self) -> Result<usize, QueueError> {
        Ok(0)
    }
}

/// In-process dispatch queue.
///
/// Used when no Redis URL is configured and by the tests. Jobs are lost on
/// restart; the task store remains the source of truth, so a restart only
/// loses pending deferrals.
#[derive(Debug, Default)]
pub struct MemoryDispatchQueue {
    jobs: Mutex<VecDeque<DispatchJob>>,
    notify: Notify,
}

impl MemoryDispatchQueue {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every waiting job in submission order.
    pub fn pending(&self) -> Vec<DispatchJob> {
        self.jobs
            .lock()
            .map(|jobs| jobs.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Removes and returns every waiting job, due or not.
    pub fn drain(&self) -> Vec<DispatchJob> {
        self.jobs
            .lock()
            .map(|mut jobs| jobs.drain(..).collect())
            .unwrap_or_default()
    }

    /// Pops the next due job, or reports how long until the earliest one is due.
    fn pop_due(
        &self,
        now: DateTime<Utc>,
    ) -> Result<(Option<DispatchJob>, Option<Duration>), QueueError> {
        let mut jobs = self.jobs.lock().map_err(|_| QueueError::Poisoned)?;

        // Earliest due time first, submission order among equals.
        let due = jobs
            .iter()
            .enumerate()
            .filter(|(_, job)| job.is_due(now))
            .min_by_key(|(idx, job)| (job.not_before, *idx))
            .map(|(idx, _)| idx);

        if let Some(idx) = due {
            return Ok((jobs.remove(idx), None));
        }

        let next = jobs.iter().map(|job| job.remaining_delay(now)).min();
        Ok((None, next))
    }
}

#[async_trait]
impl DispatchQueue for MemoryDispatchQueue {
    async fn submit(&self, job: DispatchJob) -> Result<(), QueueError> {
        self.jobs
            .lock()
            .map_err(|_| QueueError::Poisoned)?
            .push_back(job);
        self.notify.notify_one();
        Ok(())
    }

    async fn dequeue(&self, wait: Duration) -> Result<Option<DispatchJob>, QueueError> {
        let deadline = tokio::time::Instant::now() + wait;

        loop {
            let (job, next_due) = self.pop_due(Utc::now())?;
            if job.is_some() {
                return Ok(job);
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }

            let mut sleep_for = deadline - now;
            if let Some(next_due) = next_due {
                sleep_for = sleep_for.min(next_due.max(Duration::from_millis(1)));
            }

            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(sleep_for) => {}
            }
        }
    }

    async fn ack(&self, _job: &DispatchJob) -> Result<(), QueueError> {
        Ok(())
    }

    async fn len(&self) -> Result<usize, QueueError> {
        Ok(self.jobs.lock().map_err(|_| QueueError::Poisoned)?.len())
    }

    async fn has_pending(&self, task_id: Uuid, kind: DispatchKind) -> Result<bool, QueueError> {
        let jobs = self.jobs.lock().map_err(|_| QueueError::Poisoned)?;
        Ok(jobs
            .iter()
            .any(|job| job.task_id == task_id && job.kind == kind))
    }
}

/// Moves due members of the delayed set onto the ready list.
const PROMOTE_DUE_SCRIPT: &str = r"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, 100)
for _, job in ipairs(due) do
    redis.call('ZREM', KEYS[1], job)
    redis.call('LPUSH', KEYS[2], job)
end
return #due
";

/// Dispatch queue shared by every scheduler process through Redis.
///
/// Ready jobs live in a list and delayed jobs in a sorted set scored by
/// `not_before`. Dequeue moves a job into `<name>:processing` with
/// BRPOPLPUSH; it stays there until acked, so `recover` can requeue it after
/// a crash.
pub struct RedisDispatchQueue {
    redis: ConnectionManager,
    queue_name: String,
    delayed_queue: String,
    processing_queue: String,
    promote: redis::Script,
}

impl RedisDispatchQueue {
    /// `QueueError::ConnectionFailed` covers both a bad URL and an
    /// unreachable server.
    pub async fn connect(redis_url: &str, queue_name: &str) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;

        let redis = ConnectionManager::new(client)
            .await
            .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;

        Ok(Self::from_connection(redis, queue_name))
    }

    pub fn from_connection(redis: ConnectionManager, queue_name: &str) -> Self {
        Self {
            redis,
            queue_name: queue_name.to_string(),
            delayed_queue: format!("{}:delayed", queue_name),
            processing_queue: format!("{}:processing", queue_name),
            promote: redis::Script::new(PROMOTE_DUE_SCRIPT),
        }
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    async fn promote_due(&self) -> Result<usize, QueueError> {
        let mut conn = self.redis.clone();
        let promoted: usize = self
            .promote
            .key(&self.delayed_queue)
            .key(&self.queue_name)
            .arg(Utc::now().timestamp_millis())
            .invoke_async(&mut conn)
            .await?;
        Ok(promoted)
    }

    // Matched by job id: the stored JSON may differ from a re-serialization.
    async fn remove_job_from_processing(&self, job_id: Uuid) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();

        let jobs: Vec<String> = conn.lrange(&self.processing_queue, 0, -1).await?;

        for job_data in jobs {
            if let Ok(job) = serde_json::from_str::<DispatchJob>(&job_data) {
                if job.id == job_id {
                    conn.lrem::<_, _, ()>(&self.processing_queue, 1, &job_data)
                        .await?;
                    return Ok(());
                }
            }
        }

        // Already removed
        Ok(())
    }
}

#[async_trait]
impl DispatchQueue for RedisDispatchQueue {
    async fn submit(&self, job: DispatchJob) -> Result<(), QueueError> {
        let serialized = serde_json::to_string(&job)?;
        let mut conn = self.redis.clone();

        if job.is_due(Utc::now()) {
            conn.lpush::<_, _, ()>(&self.queue_name, serialized).await?;
        } else {
            conn.zadd::<_, _, _, ()>(
                &self.delayed_queue,
                serialized,
                job.not_before.timestamp_millis(),
            )
            .await?;
        }
        Ok(())
    }

    async fn dequeue(&self, wait: Duration) -> Result<Option<DispatchJob>, QueueError> {
        self.promote_due().await?;

        let mut conn = self.redis.clone();
        let timeout_secs = wait.as_secs().max(1) as usize;

        let result: Option<String> = redis::cmd("BRPOPLPUSH")
            .arg(&self.queue_name)
            .arg(&self.processing_queue)
            .arg(timeout_secs)
            .query_async(&mut conn)
            .await?;

        match result {
            Some(data) => Ok(Some(serde_json::from_str(&data)?)),
            None => Ok(None),
        }
    }

    async fn ack(&self, job: &DispatchJob) -> Result<(), QueueError> {
        self.remove_job_from_processing(job.id).await
    }

    async fn len(&self) -> Result<usize, QueueError> {
        let mut conn = self.redis.clone();
        let (ready, delayed): (usize, usize) = redis::pipe()
            .llen(&self.queue_name)
            .zcard(&self.delayed_queue)
            .query_async(&mut conn)
            .await?;
        Ok(ready + delayed)
    }

    async fn has_pending(&self, task_id: Uuid, kind: DispatchKind) -> Result<bool, QueueError> {
        let mut conn = self.redis.clone();
        let (ready, delayed, processing): (Vec<String>, Vec<String>, Vec<String>) = redis::pipe()
            .lrange(&self.queue_name, 0, -1)
            .zrange(&self.delayed_queue, 0, -1)
            .lrange(&self.processing_queue, 0, -1)
            .query_async(&mut conn)
            .await?;

        Ok(ready
            .iter()
            .chain(&delayed)
            .chain(&processing)
            .filter_map(|data| serde_json::from_str::<DispatchJob>(data).ok())
            .any(|job| job.task_id == task_id && job.kind == kind))
    }

    async fn recover(&self) -> Result<usize, QueueError> {
        let mut conn = self.redis.clone();
        let mut recovered = 0;

        let jobs: Vec<String> = conn.lrange(&self.processing_queue, 0, -1).await?;

        for job_data in jobs {
            // Attempts are idempotent, so every abandoned job goes straight back.
            let mut pipe = redis::pipe();
            pipe.atomic()
                .lrem(&self.processing_queue, 1, &job_data)
                .rpush(&self.queue_name, &job_data);
            pipe.query_async::<_, ()>(&mut conn).await?;

            recovered += 1;
        }

        Ok(recovered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_error_display() {
        let err = QueueError::ConnectionFailed("timeout".to_string());
        assert!(err.to_string().contains("timeout"));

        let err = QueueError::Poisoned;
        assert!(err.to_string().contains("poisoned"));
    }

    #[test]
    fn test_delayed_job_due_time() {
        let job = DispatchJob::retry(Uuid::new_v4()).delayed(Duration::from_secs(60));
        assert_eq!(job.kind, DispatchKind::Retry);
        assert_eq!((job.not_before - job.enqueued_at).num_seconds(), 60);
        assert!(!job.is_due(job.enqueued_at));
        assert!(job.is_due(job.enqueued_at + chrono::Duration::seconds(60)));
        assert_eq!(job.remaining_delay(job.not_before), Duration::ZERO);
    }

    #[test]
    fn test_job_serialization_roundtrip() {
        let job = DispatchJob::attempt(Uuid::new_v4());
        let serialized = serde_json::to_string(&job).expect("serialization should work");
        assert!(serialized.contains("\"attempt\""));
        let parsed: DispatchJob =
            serde_json::from_str(&serialized).expect("deserialization should work");
        assert_eq!(parsed, job);
    }

    #[tokio::test]
    async fn test_memory_queue_fifo() {
        let queue = MemoryDispatchQueue::new();
        let first = DispatchJob::attempt(Uuid::new_v4());
        let second = DispatchJob::attempt(Uuid::new_v4());
        queue.submit(first.clone()).await.unwrap();
        queue.submit(second.clone()).await.unwrap();

        assert_eq!(queue.len().await.unwrap(), 2);
        let got = queue.dequeue(Duration::from_millis(10)).await.unwrap();
        assert_eq!(got.map(|j| j.id), Some(first.id));
        let got = queue.dequeue(Duration::from_millis(10)).await.unwrap();
        assert_eq!(got.map(|j| j.id), Some(second.id));
        assert!(queue.dequeue(Duration::from_millis(10)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_memory_queue_holds_back_delayed_jobs() {
        let queue = MemoryDispatchQueue::new();
        let delayed = DispatchJob::attempt(Uuid::new_v4()).delayed(Duration::from_secs(3600));
        let ready = DispatchJob::attempt(Uuid::new_v4());
        queue.submit(delayed.clone()).await.unwrap();
        queue.submit(ready.clone()).await.unwrap();

        let got = queue.dequeue(Duration::from_millis(10)).await.unwrap();
        assert_eq!(got.map(|j| j.id), Some(ready.id));
        assert!(queue.dequeue(Duration::from_millis(20)).await.unwrap().is_none());
        assert_eq!(queue.pending(), vec![delayed]);
    }

    #[tokio::test]
    async fn test_memory_queue_has_pending_matches_task_and_kind() {
        let queue = MemoryDispatchQueue::new();
        let task_id = Uuid::new_v4();
        queue
            .submit(DispatchJob::retry(task_id).delayed(Duration::from_secs(60)))
            .await
            .unwrap();

        assert!(queue.has_pending(task_id, DispatchKind::Retry).await.unwrap());
        assert!(!queue.has_pending(task_id, DispatchKind::Attempt).await.unwrap());
        assert!(!queue
            .has_pending(Uuid::new_v4(), DispatchKind::Retry)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_memory_queue_wakes_on_submit() {
        let queue = std::sync::Arc::new(MemoryDispatchQueue::new());
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.dequeue(Duration::from_secs(5)).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        let job = DispatchJob::attempt(Uuid::new_v4());
        queue.submit(job.clone()).await.unwrap();

        let got = waiter.await.unwrap().unwrap();
        assert_eq!(got.map(|j| j.id), Some(job.id));
    }

    #[tokio::test]
    async fn test_memory_queue_delivers_short_delay() {
        let queue = MemoryDispatchQueue::new();
        let job = DispatchJob::attempt(Uuid::new_v4()).delayed(Duration::from_millis(30));
        queue.submit(job.clone()).await.unwrap();

        let got = queue.dequeue(Duration::from_secs(2)).await.unwrap();
        assert_eq!(got.map(|j| j.id), Some(job.id));
    }

    #[tokio::test]
    #[ignore] // Requires a running Redis (TEST_REDIS_URL)
    async fn test_redis_queue_delayed_promotion() {
        let url = std::env::var("TEST_REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".into());
        let name = format!("test_dispatch_{}", Uuid::new_v4());
        let queue = RedisDispatchQueue::connect(&url, &name).await.unwrap();

        let job = DispatchJob::attempt(Uuid::new_v4()).delayed(Duration::from_millis(500));
        queue.submit(job.clone()).await.unwrap();
        assert_eq!(queue.len().await.unwrap(), 1);

        tokio::time::sleep(Duration::from_millis(600)).await;
        let got = queue.dequeue(Duration::from_secs(1)).await.unwrap().unwrap();
        assert_eq!(got.id, job.id);
        assert!(queue.has_pending(got.task_id, DispatchKind::Attempt).await.unwrap());
        queue.ack(&got).await.unwrap();
        assert!(!queue.has_pending(got.task_id, DispatchKind::Attempt).await.unwrap());
        assert_eq!(queue.recover().await.unwrap(), 0);
    }
}
