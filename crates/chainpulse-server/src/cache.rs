//! Read-through cache with confirmation-depth TTLs.
//!
//! Entries are disposable copies of chain data. Nothing is invalidated
//! explicitly; shallow blocks get a short TTL so a reorg heals on expiry.

use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub kind: &'static str,
    pub network: String,
    pub id: String,
}

impl CacheKey {
    pub fn new(kind: &'static str, network: &str, id: impl Into<String>) -> Self {
        Self {
            kind,
            network: network.to_string(),
            id: id.into(),
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.kind, self.network, self.id)
    }
}

#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &CacheKey) -> Result<Option<Value>, CacheError>;

    async fn set(&self, key: &CacheKey, value: Value, ttl: Duration) -> Result<(), CacheError>;
}

struct Entry {
    value: Value,
    expires_at: Instant,
}

/// Bounded in-process LRU. Expired entries are dropped when read.
pub struct MemoryCache {
    entries: Mutex<LruCache<CacheKey, Entry>>,
}

impl MemoryCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CacheBackend for MemoryCache {
    async fn get(&self, key: &CacheKey) -> Result<Option<Value>, CacheError> {
        let mut entries = self.entries.lock();
        let expired = match entries.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => return Ok(Some(entry.value.clone())),
            Some(_) => true,
            None => false,
        };
        if expired {
            entries.pop(key);
        }
        Ok(None)
    }

    async fn set(&self, key: &CacheKey, value: Value, ttl: Duration) -> Result<(), CacheError> {
        self.entries.lock().put(
            key.clone(),
            Entry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }
}

/// TTL by confirmation depth: deep blocks are effectively final.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TtlPolicy {
    pub deep_threshold: u64,
    pub long_ttl: Duration,
    pub short_ttl: Duration,
}

impl Default for TtlPolicy {
    fn default() -> Self {
        Self {
            deep_threshold: 12,
            long_ttl: Duration::from_secs(3600),
            short_ttl: Duration::from_secs(60),
        }
    }
}

impl TtlPolicy {
    pub fn ttl_for(&self, entity_block: u64, latest: Option<u64>) -> Duration {
        match latest {
            Some(latest) if latest.saturating_sub(entity_block) > self.deep_threshold => self.long_ttl,
            _ => self.short_ttl,
        }
    }
}

/// Cache front that never fails a read: backend errors become misses.
#[derive(Clone)]
pub struct ReadThroughCache {
    backend: Arc<dyn CacheBackend>,
    policy: TtlPolicy,
}

impl ReadThroughCache {
    pub fn new(backend: Arc<dyn CacheBackend>, policy: TtlPolicy) -> Self {
        Self { backend, policy }
    }

    pub fn policy(&self) -> &TtlPolicy {
        &self.policy
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &CacheKey) -> Option<T> {
        let value = match self.backend.get(key).await {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!("Cache read {} failed, recomputing: {}", key, e);
                None
            }
        };

        let hit = value.and_then(|v| match serde_json::from_value(v) {
            Ok(parsed) => Some(parsed),
            Err(e) => {
                tracing::warn!("Discarding unreadable cache entry {}: {}", key, e);
                None
            }
        });

        if hit.is_some() {
            metrics::counter!("chainpulse_cache_hits_total", "kind" => key.kind).increment(1);
        } else {
            metrics::counter!("chainpulse_cache_misses_total", "kind" => key.kind).increment(1);
        }
        hit
    }

    pub async fn put<T: Serialize>(&self, key: &CacheKey, value: &T, ttl: Duration) {
        let value = match serde_json::to_value(value) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!("Not caching {}: {}", key, e);
                return;
            }
        };
        if let Err(e) = self.backend.set(key, value, ttl).await {
            tracing::warn!("Cache write {} failed: {}", key, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct BrokenCache;

    #[async_trait]
    impl CacheBackend for BrokenCache {
        async fn get(&self, _key: &CacheKey) -> Result<Option<Value>, CacheError> {
            Err(CacheError::Unavailable("connection refused".into()))
        }

        async fn set(&self, _key: &CacheKey, _value: Value, _ttl: Duration) -> Result<(), CacheError> {
            Err(CacheError::Unavailable("connection refused".into()))
        }
    }

    fn key(id: &str) -> CacheKey {
        CacheKey::new("block", "testnet", id)
    }

    #[test]
    fn test_ttl_by_confirmations() {
        let policy = TtlPolicy::default();
        assert_eq!(policy.ttl_for(100, Some(113)), policy.long_ttl);
        assert_eq!(policy.ttl_for(100, Some(112)), policy.short_ttl);
        assert_eq!(policy.ttl_for(100, Some(100)), policy.short_ttl);
        assert_eq!(policy.ttl_for(100, None), policy.short_ttl);
        // Head behind the entity, e.g. a lagging node
        assert_eq!(policy.ttl_for(100, Some(90)), policy.short_ttl);
    }

    #[tokio::test(start_paused = true)]
    async fn test_entries_expire() {
        let cache = MemoryCache::new(10);
        cache.set(&key("1"), json!(1), Duration::from_secs(60)).await.unwrap();

        tokio::time::advance(Duration::from_secs(59)).await;
        assert_eq!(cache.get(&key("1")).await.unwrap(), Some(json!(1)));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(cache.get(&key("1")).await.unwrap(), None);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_capacity_evicts_least_recent() {
        let cache = MemoryCache::new(2);
        let ttl = Duration::from_secs(60);
        cache.set(&key("1"), json!(1), ttl).await.unwrap();
        cache.set(&key("2"), json!(2), ttl).await.unwrap();
        cache.get(&key("1")).await.unwrap();
        cache.set(&key("3"), json!(3), ttl).await.unwrap();

        assert!(cache.get(&key("2")).await.unwrap().is_none());
        assert!(cache.get(&key("1")).await.unwrap().is_some());
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test]
    async fn test_keys_are_scoped_by_network() {
        let cache = MemoryCache::new(10);
        let ttl = Duration::from_secs(60);
        cache.set(&CacheKey::new("block", "mainnet", "1"), json!("a"), ttl).await.unwrap();

        assert!(cache.get(&CacheKey::new("block", "testnet", "1")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_broken_backend_degrades_to_miss() {
        let cache = ReadThroughCache::new(Arc::new(BrokenCache), TtlPolicy::default());
        cache.put(&key("1"), &42u64, Duration::from_secs(1)).await;
        assert_eq!(cache.get::<u64>(&key("1")).await, None);
    }

    #[tokio::test]
    async fn test_read_through_round_trip_and_bad_shape() {
        let cache = ReadThroughCache::new(Arc::new(MemoryCache::new(10)), TtlPolicy::default());
        cache.put(&key("1"), &vec![1u64, 2], Duration::from_secs(1)).await;

        assert_eq!(cache.get::<Vec<u64>>(&key("1")).await, Some(vec![1, 2]));
        assert_eq!(cache.get::<String>(&key("1")).await, None);
    }
}
