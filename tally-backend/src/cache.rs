//! Tabulation cache
//!
//! Memoizes aggregation results by (election, corpus version, normalized
//! query). The version counter is bumped by every committed mutation, so a
//! cache hit can never serve stale aggregates. Concurrent requests for the
//! same uncached key share one in-flight computation through a per-key
//! `OnceCell`; unrelated keys compute in parallel.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tally_common::tabulation::{AggregateResult, Filter, GroupBy};
use tokio::sync::OnceCell;
use tracing::debug;

/// Cache key: election, corpus version, and the normalized query.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    election_id: String,
    version: u64,
    filter: Filter,
    group_by: GroupBy,
}

impl CacheKey {
    pub fn new(election_id: &str, version: u64, filter: &Filter, group_by: GroupBy) -> Self {
        Self {
            election_id: election_id.to_string(),
            version,
            filter: filter.normalized(),
            group_by,
        }
    }
}

type CacheCell = Arc<OnceCell<Arc<Vec<AggregateResult>>>>;

/// Memoized aggregation results plus the per-election version counters.
pub struct TabulationCache {
    versions: Mutex<HashMap<String, u64>>,
    entries: Mutex<HashMap<CacheKey, CacheCell>>,
    full_scans: AtomicU64,
}

impl TabulationCache {
    pub fn new() -> Self {
        Self {
            versions: Mutex::new(HashMap::new()),
            entries: Mutex::new(HashMap::new()),
            full_scans: AtomicU64::new(0),
        }
    }

    /// Current corpus version for an election. Starts at zero.
    pub fn version(&self, election_id: &str) -> u64 {
        let versions = self.versions.lock().expect("version map lock poisoned");
        versions.get(election_id).copied().unwrap_or(0)
    }

    /// Record a corpus mutation: advance the version and drop entries that
    /// can no longer be served. Pure in-memory bookkeeping; cannot fail.
    pub fn bump_version(&self, election_id: &str) -> u64 {
        let new_version = {
            let mut versions = self.versions.lock().expect("version map lock poisoned");
            let version = versions.entry(election_id.to_string()).or_insert(0);
            *version += 1;
            *version
        };

        let mut entries = self.entries.lock().expect("cache map lock poisoned");
        entries.retain(|key, _| key.election_id != election_id || key.version >= new_version);
        debug!(election_id, new_version, "Invalidated tabulation cache");
        new_version
    }

    /// Look up a key, computing on miss. At most one computation runs per
    /// key: later concurrent callers await the first caller's result.
    pub async fn get_or_compute<F, Fut>(
        &self,
        key: CacheKey,
        compute: F,
    ) -> crate::error::Result<Arc<Vec<AggregateResult>>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = crate::error::Result<Vec<AggregateResult>>>,
    {
        let cell: CacheCell = {
            let mut entries = self.entries.lock().expect("cache map lock poisoned");
            entries.entry(key).or_default().clone()
        };

        let value = cell
            .get_or_try_init(|| async {
                self.full_scans.fetch_add(1, Ordering::Relaxed);
                compute().await.map(Arc::new)
            })
            .await?;
        Ok(value.clone())
    }

    /// Number of full-corpus aggregations performed. Test instrumentation
    /// for the cache-coherence property.
    pub fn full_scan_count(&self) -> u64 {
        self.full_scans.load(Ordering::Relaxed)
    }
}

impl Default for TabulationCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(version: u64) -> CacheKey {
        CacheKey::new("election-1", version, &Filter::default(), GroupBy::default())
    }

    #[tokio::test]
    async fn caches_by_version() {
        let cache = TabulationCache::new();

        let first = cache
            .get_or_compute(key(0), || async { Ok(Vec::new()) })
            .await
            .unwrap();
        let second = cache
            .get_or_compute(key(0), || async {
                panic!("cache hit must not recompute");
            })
            .await
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(cache.full_scan_count(), 1);

        cache.bump_version("election-1");
        cache
            .get_or_compute(key(1), || async { Ok(Vec::new()) })
            .await
            .unwrap();
        assert_eq!(cache.full_scan_count(), 2);
    }

    #[tokio::test]
    async fn concurrent_requests_share_one_computation() {
        let cache = Arc::new(TabulationCache::new());

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_compute(key(0), || async {
                        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                        Ok(Vec::new())
                    })
                    .await
                    .unwrap()
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(cache.full_scan_count(), 1);
    }

    #[tokio::test]
    async fn failed_computation_is_not_cached() {
        let cache = TabulationCache::new();

        let result = cache
            .get_or_compute(key(0), || async {
                Err(crate::error::Error::NoElectionConfigured)
            })
            .await;
        assert!(result.is_err());

        // The next caller retries instead of observing a poisoned entry.
        cache
            .get_or_compute(key(0), || async { Ok(Vec::new()) })
            .await
            .unwrap();
        assert_eq!(cache.full_scan_count(), 2);
    }
}
