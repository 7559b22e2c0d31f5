//! Redis-backed result cache.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use super::{CacheError, CacheKey, ResultCache};
use crate::scheduler::task::AnalysisReport;

/// Result cache stored in Redis with `SET .. EX`.
#[derive(Clone)]
pub struct RedisResultCache {
    /// Redis connection manager (handles reconnection automatically).
    redis: ConnectionManager,
}

impl RedisResultCache {
    /// Connects to Redis.
    pub async fn connect(redis_url: &str) -> Result<Self, CacheError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| CacheError::ConnectionFailed(e.to_string()))?;
        let redis = ConnectionManager::new(client)
            .await
            .map_err(|e| CacheError::ConnectionFailed(e.to_string()))?;
        Ok(Self { redis })
    }

    /// Creates a cache from an existing ConnectionManager.
    ///
    /// Useful when sharing a connection with the dispatch queue.
    pub fn from_connection(redis: ConnectionManager) -> Self {
        Self { redis }
    }
}

#[async_trait]
impl ResultCache for RedisResultCache {
    async fn get(&self, key: &CacheKey) -> Result<Option<AnalysisReport>, CacheError> {
        let mut conn = self.redis.clone();
        let data: Option<String> = conn.get(key.as_str()).await?;
        match data {
            Some(s) => Ok(Some(serde_json::from_str(&s)?)),
            None => Ok(None),
        }
    }

    async fn set(
        &self,
        key: &CacheKey,
        report: &AnalysisReport,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let mut conn = self.redis.clone();
        let serialized = serde_json::to_string(report)?;
        redis::cmd("SET")
            .arg(key.as_str())
            .arg(serialized)
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::task::{AnalysisRequest, Ecosystem};

    /// Requires a Redis server in `TEST_REDIS_URL`.
    #[tokio::test]
    #[ignore]
    async fn test_redis_ttl_round_trip() {
        let url = std::env::var("TEST_REDIS_URL").expect("TEST_REDIS_URL not set");
        let cache = RedisResultCache::connect(&url).await.unwrap();
        let key = CacheKey::for_request(
            &AnalysisRequest::new(Ecosystem::Npm, "redis-ttl-check").with_version("0.0.1"),
        );
        let report = AnalysisReport::new(serde_json::json!({"cached": true}));

        cache.set(&key, &report, Duration::from_secs(1)).await.unwrap();
        assert_eq!(cache.get(&key).await.unwrap(), Some(report));

        tokio::time::sleep(Duration::from_millis(2100)).await;
        assert!(cache.get(&key).await.unwrap().is_none());
    }
}
