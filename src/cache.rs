//! TTL cache with built-in single-flight request coalescing.
//!
//! `moka::future::Cache::try_get_with` already does what the teacher's
//! `app.rs` hand-rolls with a `DashMap<CacheKey, watch::Receiver<bool>>`
//! (`active_requests`): concurrent callers racing the same key block on the
//! first caller's future instead of each issuing their own upstream call,
//! and a failed fill is not cached (no negative caching). Per-method TTL
//! rides on moka's variable-expiration support: a custom [`Expiry`] reads
//! the TTL off the value itself at insertion time, since the cache builder
//! only configures a single, fixed TTL/TTI policy.

use std::sync::Arc;
use std::time::{Duration, Instant};

use moka::future::Cache;
use moka::Expiry;
use serde_json::Value;

use crate::errors::DispatchError;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub method: String,
    pub params: String,
}

#[derive(Clone)]
struct Entry {
    value: Value,
    ttl: Duration,
}

struct TtlExpiry;

impl Expiry<CacheKey, Entry> for TtlExpiry {
    fn expire_after_create(&self, _key: &CacheKey, value: &Entry, _created_at: Instant) -> Option<Duration> {
        Some(value.ttl)
    }
}

pub struct TtlCache {
    inner: Cache<CacheKey, Entry>,
}

impl TtlCache {
    pub fn new(max_capacity: u64) -> Self {
        let inner = Cache::builder()
            .max_capacity(max_capacity)
            .expire_after(TtlExpiry)
            .build();
        Self { inner }
    }

    /// `true` if `key` currently resolves to a cached (already-filled)
    /// value. Used only for the cache-hit metric; it is inherently racy
    /// against concurrent fills, which is acceptable for a counter.
    pub async fn contains(&self, key: &CacheKey) -> bool {
        self.inner.get(key).await.is_some()
    }

    /// Resolve `key`, filling it with `init` on miss. Concurrent callers for
    /// the same `key` share the first caller's `init` future; if it fails,
    /// every waiter observes the same `DispatchError` and nothing is cached.
    pub async fn get_or_try_insert_with<F, Fut>(
        &self,
        key: CacheKey,
        ttl: Duration,
        init: F,
    ) -> Result<Value, Arc<DispatchError>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<Value, DispatchError>> + Send + 'static,
    {
        self.inner
            .try_get_with(key, async move {
                let value = init().await?;
                Ok::<Entry, DispatchError>(Entry { value, ttl })
            })
            .await
            .map(|entry| entry.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc as StdArc;

    fn key(method: &str) -> CacheKey {
        CacheKey {
            method: method.to_string(),
            params: "[]".to_string(),
        }
    }

    #[tokio::test]
    async fn caches_successful_fill() {
        let cache = TtlCache::new(100);
        let calls = StdArc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let calls = calls.clone();
            let result = cache
                .get_or_try_insert_with(key("eth_blockNumber"), Duration::from_secs(5), move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(Value::String("0x1".to_string()))
                })
                .await
                .unwrap();
            assert_eq!(result, Value::String("0x1".to_string()));
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn does_not_cache_failed_fill() {
        let cache = TtlCache::new(100);
        let calls = StdArc::new(AtomicUsize::new(0));

        for _ in 0..2 {
            let calls = calls.clone();
            let result = cache
                .get_or_try_insert_with(key("eth_call"), Duration::from_secs(5), move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(DispatchError::UpstreamTimeout)
                })
                .await;
            assert!(result.is_err());
        }

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn concurrent_misses_single_flight_to_one_fill() {
        let cache = StdArc::new(TtlCache::new(100));
        let calls = StdArc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_try_insert_with(key("eth_gasPrice"), Duration::from_secs(5), move || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Ok(Value::String("0x4a817c800".to_string()))
                    })
                    .await
            }));
        }

        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
