use async_trait::async_trait;
use casegraph_core::{Cache, CacheConfig, Result};
use lru::LruCache;
use parking_lot::Mutex;
use serde_json::Value;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};
use tracing::debug;

/// A cached value plus its expiry instant.
#[derive(Debug, Clone)]
struct CacheEntry {
    value: Value,
    expires_at: Option<Instant>,
}

impl CacheEntry {
    fn new(value: Value, ttl: Option<Duration>) -> Self {
        Self {
            value,
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        }
    }

    fn is_expired(&self) -> bool {
        self.expires_at
            .map(|expires_at| Instant::now() > expires_at)
            .unwrap_or(false)
    }
}

/// Cache performance counters.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub entries: usize,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

struct Inner {
    entries: LruCache<String, CacheEntry>,
    stats: CacheStats,
}

/// In-memory LRU cache with per-entry TTL.
///
/// All mutation happens under a single mutex; no lock is ever held across
/// an await point.
pub struct MemoryCache {
    inner: Mutex<Inner>,
    default_ttl: Option<Duration>,
}

impl MemoryCache {
    pub fn new(max_size: usize) -> Self {
        let capacity = NonZeroUsize::new(max_size).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(Inner {
                entries: LruCache::new(capacity),
                stats: CacheStats::default(),
            }),
            default_ttl: None,
        }
    }

    pub fn with_config(config: &CacheConfig) -> Self {
        let mut cache = Self::new(config.max_size);
        cache.default_ttl = config.default_ttl_seconds.map(Duration::from_secs);
        cache
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            entries: inner.entries.len(),
            ..inner.stats
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::with_config(&CacheConfig::default())
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        let mut inner = self.inner.lock();
        match inner.entries.get(key) {
            Some(entry) if entry.is_expired() => {
                inner.entries.pop(key);
                inner.stats.expirations += 1;
                inner.stats.misses += 1;
                Ok(None)
            }
            Some(entry) => {
                let value = entry.value.clone();
                inner.stats.hits += 1;
                Ok(Some(value))
            }
            None => {
                inner.stats.misses += 1;
                Ok(None)
            }
        }
    }

    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<()> {
        let entry = CacheEntry::new(value, ttl.or(self.default_ttl));
        let mut inner = self.inner.lock();
        let at_capacity = inner.entries.len() == inner.entries.cap().get();
        if inner.entries.put(key.to_string(), entry).is_none() && at_capacity {
            inner.stats.evictions += 1;
            debug!(key, "cache at capacity, evicted least recently used entry");
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.inner.lock().entries.pop(key).is_some())
    }

    async fn clear(&self) -> Result<()> {
        self.inner.lock().entries.clear();
        Ok(())
    }
}
