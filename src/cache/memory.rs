//! In-process result cache with per-entry expiry.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use super::{CacheError, CacheKey, ResultCache};
use crate::scheduler::task::AnalysisReport;

#[derive(Debug, Clone)]
struct CacheEntry {
    report: AnalysisReport,
    /// `None` when the TTL reaches past what `Instant` can represent.
    expires_at: Option<Instant>,
}

impl CacheEntry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

/// Result cache kept in process memory.
///
/// Used when no Redis URL is configured and in tests. Expired entries are
/// dropped lazily on lookup and on every write.
#[derive(Debug, Default)]
pub struct MemoryResultCache {
    entries: RwLock<HashMap<CacheKey, CacheEntry>>,
}

impl MemoryResultCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of live entries.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        match self.entries.read() {
            Ok(entries) => entries.values().filter(|e| e.is_live(now)).count(),
            Err(poisoned) => poisoned
                .into_inner()
                .values()
                .filter(|e| e.is_live(now))
                .count(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ResultCache for MemoryResultCache {
    async fn get(&self, key: &CacheKey) -> Result<Option<AnalysisReport>, CacheError> {
        let now = Instant::now();
        let mut entries = self.entries.write().unwrap_or_else(|p| p.into_inner());

        match entries.get(key) {
            Some(entry) if entry.is_live(now) => Ok(Some(entry.report.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(
        &self,
        key: &CacheKey,
        report: &AnalysisReport,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let now = Instant::now();
        let mut entries = self.entries.write().unwrap_or_else(|p| p.into_inner());
        entries.retain(|_, e| e.is_live(now));
        entries.insert(
            key.clone(),
            CacheEntry {
                report: report.clone(),
                expires_at: now.checked_add(ttl),
            },
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::task::{AnalysisRequest, Ecosystem};

    fn key() -> CacheKey {
        CacheKey::for_request(&AnalysisRequest::new(Ecosystem::Npm, "lodash").with_version("1.0.0"))
    }

    #[tokio::test]
    async fn test_get_before_ttl_returns_value() {
        let cache = MemoryResultCache::new();
        let report = AnalysisReport::new(serde_json::json!({"ok": true}));

        cache.set(&key(), &report, Duration::from_secs(60)).await.unwrap();

        assert_eq!(cache.get(&key()).await.unwrap(), Some(report));
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_expired_entry_is_a_clean_miss() {
        let cache = MemoryResultCache::new();
        let report = AnalysisReport::new(serde_json::json!({"ok": true}));

        cache.set(&key(), &report, Duration::from_millis(20)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(cache.get(&key()).await.unwrap().is_none());
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_unrepresentable_ttl_never_expires() {
        let cache = MemoryResultCache::new();
        let report = AnalysisReport::new(serde_json::json!({"ok": true}));

        cache
            .set(&key(), &report, Duration::from_secs(u64::MAX))
            .await
            .unwrap();

        assert_eq!(cache.get(&key()).await.unwrap(), Some(report));
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_missing_key() {
        let cache = MemoryResultCache::new();
        assert!(cache.get(&key()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_set_overwrites() {
        let cache = MemoryResultCache::new();
        let first = AnalysisReport::new(serde_json::json!(1));
        let second = AnalysisReport::new(serde_json::json!(2));

        cache.set(&key(), &first, Duration::from_secs(60)).await.unwrap();
        cache.set(&key(), &second, Duration::from_secs(60)).await.unwrap();

        assert_eq!(cache.get(&key()).await.unwrap().map(|r| r.id), Some(second.id));
    }
}
