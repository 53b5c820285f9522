use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use streamtab_macros::Component;
use tokio::time::Instant;

use crate::core::Cache;
use crate::resources::ResourceManager;

#[derive(Component, Debug, Clone, Deserialize)]
#[component(
    kind = "cache",
    name = "memory",
    summary = "In-process key/value cache with expiry and LRU eviction.",
    constructor = "MemoryCache::from_config"
)]
pub struct MemoryCacheConfig {
    /// Expiry applied when a write gives none; 0 disables expiry.
    #[field(default = "300000", min = 0.0)]
    pub default_ttl_ms: u64,

    /// Maximum entries before the least recently used one is evicted; 0 is unbounded.
    #[field(default = "0", min = 0.0, advanced)]
    pub capacity: u64,
}

struct Entry {
    value: Bytes,
    expires_at: Option<Instant>,
    last_used: u64,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, Entry>,
    clock: u64,
}

pub struct MemoryCache {
    inner: Mutex<Inner>,
    default_ttl: Option<Duration>,
    capacity: usize,
}

impl MemoryCache {
    pub fn new(default_ttl: Option<Duration>, capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            default_ttl,
            capacity,
        }
    }

    fn from_config(config: MemoryCacheConfig, _resources: &ResourceManager) -> Result<Box<dyn Cache>> {
        let ttl = (config.default_ttl_ms > 0).then(|| Duration::from_millis(config.default_ttl_ms));
        Ok(Box::new(Self::new(ttl, config.capacity as usize)))
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Inner {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn purge_expired(&mut self, now: Instant) {
        self.entries
            .retain(|_, e| e.expires_at.map_or(true, |at| at > now));
    }

    fn evict_lru(&mut self) {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|(_, e)| e.last_used)
            .map(|(k, _)| k.clone());
        if let Some(key) = oldest {
            self.entries.remove(&key);
        }
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        let mut inner = self.lock();
        let now = Instant::now();
        let tick = inner.tick();

        let expired = match inner.entries.get_mut(key) {
            None => return Ok(None),
            Some(entry) if entry.expires_at.is_some_and(|at| at <= now) => true,
            Some(entry) => {
                entry.last_used = tick;
                return Ok(Some(entry.value.clone()));
            }
        };
        if expired {
            inner.entries.remove(key);
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> Result<()> {
        let now = Instant::now();
        let expires_at = ttl.or(self.default_ttl).map(|ttl| now + ttl);
        let mut inner = self.lock();
        let tick = inner.tick();
        inner.purge_expired(now);

        if self.capacity > 0 && !inner.entries.contains_key(key) && inner.entries.len() >= self.capacity {
            inner.evict_lru();
        }
        inner.entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at,
                last_used: tick,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.lock().entries.remove(key);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.lock().entries.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_entries_expire() {
        let cache = MemoryCache::new(Some(Duration::from_millis(100)), 0);
        cache.set("k", Bytes::from_static(b"v"), None).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap(), Some(Bytes::from_static(b"v")));

        tokio::time::advance(Duration::from_millis(150)).await;
        assert_eq!(cache.get("k").await.unwrap(), None);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_lru_eviction() {
        let cache = MemoryCache::new(None, 2);
        cache.set("a", Bytes::from_static(b"1"), None).await.unwrap();
        cache.set("b", Bytes::from_static(b"2"), None).await.unwrap();
        cache.get("a").await.unwrap();
        cache.set("c", Bytes::from_static(b"3"), None).await.unwrap();

        assert!(cache.get("a").await.unwrap().is_some());
        assert!(cache.get("b").await.unwrap().is_none());
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_purges_expired_entries() {
        let cache = MemoryCache::new(Some(Duration::from_millis(10)), 0);
        for i in 0..1000 {
            cache.set(&format!("k{i}"), Bytes::from_static(b"v"), None).await.unwrap();
        }
        assert_eq!(cache.len(), 1000);

        tokio::time::advance(Duration::from_secs(3600)).await;
        cache.set("fresh", Bytes::from_static(b"v"), None).await.unwrap();
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_capacity_counts_live_entries_only() {
        let cache = MemoryCache::new(None, 2);
        cache.set("long", Bytes::from_static(b"1"), None).await.unwrap();
        cache
            .set("short", Bytes::from_static(b"2"), Some(Duration::from_millis(10)))
            .await
            .unwrap();

        tokio::time::advance(Duration::from_millis(20)).await;
        cache.set("new", Bytes::from_static(b"3"), None).await.unwrap();

        assert!(cache.get("long").await.unwrap().is_some());
        assert!(cache.get("new").await.unwrap().is_some());
        assert_eq!(cache.len(), 2);
    }
}
