use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use lru::LruCache;
use tokio::sync::Mutex;

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache backend error: {0}")]
    Backend(#[source] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, CacheError>;

/// Key/value cache with per-entry TTL and trailing-`*` pattern invalidation.
/// Values are serialized strings; callers own the encoding.
#[async_trait]
pub trait Cache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set_with_ttl(&self, key: &str, value: String, ttl: Duration) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;
    async fn delete_by_pattern(&self, pattern: &str) -> Result<()>;
}

#[derive(Clone, Debug)]
struct Entry {
    value: String,
    stored_at: Instant,
    ttl: Duration,
}

impl Entry {
    fn is_fresh(&self) -> bool {
        self.stored_at.elapsed() < self.ttl
    }
}

/// In-process LRU cache. Capacity bounds memory; expired entries are dropped
/// lazily on read.
#[derive(Clone)]
pub struct MemoryCache {
    inner: Arc<Mutex<LruCache<String, Entry>>>,
}

impl MemoryCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1))
            .unwrap_or_else(|| NonZeroUsize::new(1).unwrap());
        Self {
            inner: Arc::new(Mutex::new(LruCache::new(capacity))),
        }
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut guard = self.inner.lock().await;
        match guard.get(key) {
            Some(entry) if entry.is_fresh() => Ok(Some(entry.value.clone())),
            Some(_) => {
                guard.pop(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set_with_ttl(&self, key: &str, value: String, ttl: Duration) -> Result<()> {
        let mut guard = self.inner.lock().await;
        guard.put(
            key.to_string(),
            Entry {
                value,
                stored_at: Instant::now(),
                ttl,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut guard = self.inner.lock().await;
        guard.pop(key);
        Ok(())
    }

    async fn delete_by_pattern(&self, pattern: &str) -> Result<()> {
        let mut guard = self.inner.lock().await;
        let matching: Vec<String> = guard
            .iter()
            .filter(|(key, _)| matches_pattern(key, pattern))
            .map(|(key, _)| key.clone())
            .collect();
        for key in matching {
            guard.pop(&key);
        }
        Ok(())
    }
}

fn matches_pattern(key: &str, pattern: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => key.starts_with(prefix),
        None => key == pattern,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn get_returns_fresh_entry() {
        let cache = MemoryCache::new(16);
        cache
            .set_with_ttl("k", "v".into(), Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(cache.get("k").await.unwrap(), Some("v".to_string()));
    }

    #[tokio::test]
    async fn expired_entry_is_dropped() {
        let cache = MemoryCache::new(16);
        cache
            .set_with_ttl("k", "v".into(), Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(cache.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn pattern_delete_removes_prefix_matches_only() {
        let cache = MemoryCache::new(16);
        let ttl = Duration::from_secs(60);
        cache
            .set_with_ttl("gh:available:u1:p1", "a".into(), ttl)
            .await
            .unwrap();
        cache
            .set_with_ttl("gh:available:u1:p2", "b".into(), ttl)
            .await
            .unwrap();
        cache
            .set_with_ttl("gh:available:u2:p1", "c".into(), ttl)
            .await
            .unwrap();

        cache.delete_by_pattern("gh:available:u1:*").await.unwrap();

        assert_eq!(cache.get("gh:available:u1:p1").await.unwrap(), None);
        assert_eq!(cache.get("gh:available:u1:p2").await.unwrap(), None);
        assert_eq!(
            cache.get("gh:available:u2:p1").await.unwrap(),
            Some("c".to_string())
        );
    }

    #[tokio::test]
    async fn exact_pattern_deletes_single_key() {
        let cache = MemoryCache::new(16);
        let ttl = Duration::from_secs(60);
        cache
            .set_with_ttl("org:connected:o1", "x".into(), ttl)
            .await
            .unwrap();
        cache.delete_by_pattern("org:connected:o1").await.unwrap();
        assert_eq!(cache.get("org:connected:o1").await.unwrap(), None);
    }
}
