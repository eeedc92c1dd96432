//! Time-bounded read cache with single-flight loading
//!
//! Concurrent misses for the same key wait on one loader instead of each
//! issuing its own request. Failed loads are never cached.

use dashmap::DashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::trace;

#[derive(Debug, Clone)]
struct Entry<V> {
    value: V,
    fetched_at: Instant,
}

pub struct ReadCache<K, V> {
    name: &'static str,
    ttl: Duration,
    entries: DashMap<K, Entry<V>>,
    loading: DashMap<K, Arc<Mutex<()>>>,
}

impl<K, V> ReadCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(name: &'static str, ttl: Duration) -> Self {
        Self {
            name,
            ttl,
            entries: DashMap::new(),
            loading: DashMap::new(),
        }
    }

    /// Fresh value for `key`, without touching metrics or loaders
    pub fn peek(&self, key: &K) -> Option<V> {
        self.entries
            .get(key)
            .filter(|entry| entry.fetched_at.elapsed() < self.ttl)
            .map(|entry| entry.value.clone())
    }

    /// Fresh value for `key`, counted as a hit or miss
    pub fn lookup(&self, key: &K) -> Option<V> {
        let value = self.peek(key);
        match value {
            Some(_) => crate::metrics::record_cache_hit(self.name),
            None => crate::metrics::record_cache_miss(self.name),
        }
        value
    }

    pub fn insert(&self, key: K, value: V) {
        self.entries.insert(
            key,
            Entry {
                value,
                fetched_at: Instant::now(),
            },
        );
    }

    /// Serve `key` from cache or run `loader` once for all concurrent callers
    pub async fn get_or_fetch<F, Fut, E>(&self, key: &K, loader: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        if let Some(value) = self.peek(key) {
            crate::metrics::record_cache_hit(self.name);
            return Ok(value);
        }

        let lock = self.loading.entry(key.clone()).or_default().clone();
        let guard = lock.lock().await;

        // another caller may have loaded it while we waited
        if let Some(value) = self.peek(key) {
            crate::metrics::record_cache_hit(self.name);
            return Ok(value);
        }

        crate::metrics::record_cache_miss(self.name);
        trace!("Cache {} miss, loading", self.name);
        let result = loader().await;
        if let Ok(value) = &result {
            self.insert(key.clone(), value.clone());
        }

        drop(guard);
        self.loading
            .remove_if(key, |_, entry| Arc::strong_count(entry) <= 2);
        result
    }

    pub fn invalidate(&self, key: &K) {
        self.entries.remove(key);
    }

    /// Drop every expired entry
    pub fn purge_expired(&self) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| entry.fetched_at.elapsed() < self.ttl);
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn concurrent_misses_share_one_load() {
        let cache: Arc<ReadCache<u64, String>> = Arc::new(ReadCache::new("test", Duration::from_secs(10)));
        let loads = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                let loads = loads.clone();
                tokio::spawn(async move {
                    cache
                        .get_or_fetch(&1, || async {
                            loads.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(50)).await;
                            Ok::<_, String>("value".to_string())
                        })
                        .await
                })
            })
            .collect();

        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap(), "value");
        }
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_ttl() {
        let cache: ReadCache<u64, u64> = ReadCache::new("test", Duration::from_secs(5));
        cache.insert(1, 10);
        assert_eq!(cache.peek(&1), Some(10));

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(cache.peek(&1), None);
        assert_eq!(cache.purge_expired(), 1);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn failed_loads_are_not_cached() {
        let cache: ReadCache<u64, u64> = ReadCache::new("test", Duration::from_secs(5));
        let first: Result<u64, &str> = cache.get_or_fetch(&1, || async { Err("boom") }).await;
        assert!(first.is_err());

        let second: Result<u64, &str> = cache.get_or_fetch(&1, || async { Ok(7) }).await;
        assert_eq!(second, Ok(7));
        assert_eq!(cache.peek(&1), Some(7));
    }
}
