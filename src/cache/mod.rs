//! Result cache for completed analyses.
//!
//! The cache is an optimization layer in front of the container executor: a
//! hit completes a task without running the analysis again, and a miss (or any
//! cache error) falls through to normal execution. The task store stays the
//! source of truth.
//!
//! # Usage
//!
//! ```ignore
//! use packamal_scheduler::cache::{CacheKey, MemoryResultCache, ResultCache};
//!
//! let cache = MemoryResultCache::new();
//! let key = CacheKey::for_request(&request);
//! cache.set(&key, &report, Duration::from_secs(7 * 24 * 3600)).await?;
//! ```

pub mod memory;
pub mod redis;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::scheduler::task::{AnalysisReport, AnalysisRequest};

pub use memory::MemoryResultCache;
pub use self::redis::RedisResultCache;

/// Default lifetime of a cached report (7 days).
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Errors that can occur during cache operations.
#[derive(Debug, Error)]
pub enum CacheError {
    /// Failed to connect to the cache backend.
    #[error("Cache connection failed: {0}")]
    ConnectionFailed(String),

    /// Redis operation failed.
    #[error("Redis operation failed: {0}")]
    Redis(#[from] ::redis::RedisError),

    /// A cached value could not be (de)serialized.
    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Deterministic cache key derived from ecosystem, package name and version.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    /// Builds the key for a request; unpinned versions use `latest`.
    pub fn for_request(request: &AnalysisRequest) -> Self {
        Self(format!(
            "analysis_{}_{}_{}",
            request.ecosystem.as_str(),
            request.package_name,
            request.version_label()
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Key/value store of analysis reports with per-entry TTL.
#[async_trait]
pub trait ResultCache: Send + Sync {
    /// Returns the cached report, or `None` on a miss or an expired entry.
    async fn get(&self, key: &CacheKey) -> Result<Option<AnalysisReport>, CacheError>;

    /// Stores a report for `ttl`.
    async fn set(
        &self,
        key: &CacheKey,
        report: &AnalysisReport,
        ttl: Duration,
    ) -> Result<(), CacheError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::task::Ecosystem;

    #[test]
    fn test_cache_key_format() {
        let request = AnalysisRequest::new(Ecosystem::Npm, "lodash").with_version("4.17.21");
        assert_eq!(
            CacheKey::for_request(&request).as_str(),
            "analysis_npm_lodash_4.17.21"
        );

        let latest = AnalysisRequest::new(Ecosystem::Pypi, "requests");
        assert_eq!(
            CacheKey::for_request(&latest).to_string(),
            "analysis_pypi_requests_latest"
        );
    }

    #[test]
    fn test_cache_key_ignores_mode() {
        let dynamic = AnalysisRequest::new(Ecosystem::Npm, "a").with_version("1");
        let statik = dynamic
            .clone()
            .with_mode(crate::scheduler::task::AnalysisMode::Static);
        assert_eq!(CacheKey::for_request(&dynamic), CacheKey::for_request(&statik));
    }

    #[test]
    fn test_default_ttl_is_seven_days() {
        assert_eq!(DEFAULT_CACHE_TTL.as_secs(), 604_800);
    }
}
