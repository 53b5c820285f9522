//! Named, shared cache and rate-limit instances.
//!
//! Resources are declared by label, built once when the stream is assembled and
//! handed out as `Arc`s to every component that references them. Shutdown
//! closes each instance exactly once, after which lookups fail.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::core::{Cache, RateLimiter};
use crate::error::{ConfigError, ResourceError};
use crate::registry::{ComponentConfig, Registry, ResourceKind};

pub type CacheHandle = Arc<dyn Cache>;
pub type RateLimitHandle = Arc<dyn RateLimiter>;

enum Entry<T: ?Sized> {
    Declared(ComponentConfig),
    Live(Arc<T>),
}

struct Table<T: ?Sized> {
    entries: RwLock<BTreeMap<String, Entry<T>>>,
}

impl<T: ?Sized> Table<T> {
    fn new() -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<String, Entry<T>>> {
        self.entries.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<String, Entry<T>>> {
        self.entries.write().unwrap_or_else(|e| e.into_inner())
    }

    fn insert(&self, kind: ResourceKind, name: &str, entry: Entry<T>) -> Result<(), ResourceError> {
        let mut entries = self.write();
        if entries.contains_key(name) {
            return Err(ResourceError::Duplicate {
                kind,
                name: name.to_string(),
            });
        }
        entries.insert(name.to_string(), entry);
        Ok(())
    }

    fn resolve(&self, kind: ResourceKind, name: &str) -> Result<Arc<T>, ResourceError> {
        match self.read().get(name) {
            Some(Entry::Live(instance)) => Ok(instance.clone()),
            // Declared but not yet built; only reachable before `initialize`.
            Some(Entry::Declared(_)) | None => Err(ResourceError::Unknown {
                kind,
                name: name.to_string(),
            }),
        }
    }

    fn pending(&self) -> Vec<(String, ComponentConfig)> {
        self.read()
            .iter()
            .filter_map(|(name, entry)| match entry {
                Entry::Declared(desc) => Some((name.clone(), desc.clone())),
                Entry::Live(_) => None,
            })
            .collect()
    }

    fn drain_live(&self) -> Vec<(String, Arc<T>)> {
        std::mem::take(&mut *self.write())
            .into_iter()
            .filter_map(|(name, entry)| match entry {
                Entry::Live(instance) => Some((name, instance)),
                Entry::Declared(_) => None,
            })
            .collect()
    }
}

pub struct ResourceManager {
    caches: Table<dyn Cache>,
    rate_limits: Table<dyn RateLimiter>,
    closed: AtomicBool,
}

impl Default for ResourceManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceManager {
    pub fn new() -> Self {
        Self {
            caches: Table::new(),
            rate_limits: Table::new(),
            closed: AtomicBool::new(false),
        }
    }

    fn ensure_open(&self, name: &str) -> Result<(), ResourceError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ResourceError::Closed {
                name: name.to_string(),
            });
        }
        Ok(())
    }

    /// Declare a resource by label. It is built by [`ResourceManager::initialize`].
    pub fn register(
        &self,
        kind: ResourceKind,
        name: &str,
        descriptor: ComponentConfig,
    ) -> Result<(), ResourceError> {
        self.ensure_open(name)?;
        match kind {
            ResourceKind::Cache => self.caches.insert(kind, name, Entry::Declared(descriptor)),
            ResourceKind::RateLimit => {
                self.rate_limits
                    .insert(kind, name, Entry::Declared(descriptor))
            }
        }
    }

    /// Add an already constructed cache.
    pub fn add_cache(&self, name: &str, cache: CacheHandle) -> Result<(), ResourceError> {
        self.ensure_open(name)?;
        self.caches.insert(ResourceKind::Cache, name, Entry::Live(cache))
    }

    /// Add an already constructed rate limiter.
    pub fn add_rate_limit(&self, name: &str, limiter: RateLimitHandle) -> Result<(), ResourceError> {
        self.ensure_open(name)?;
        self.rate_limits
            .insert(ResourceKind::RateLimit, name, Entry::Live(limiter))
    }

    /// Whether `name` is declared or live for `kind`.
    pub fn contains(&self, kind: ResourceKind, name: &str) -> bool {
        match kind {
            ResourceKind::Cache => self.caches.read().contains_key(name),
            ResourceKind::RateLimit => self.rate_limits.read().contains_key(name),
        }
    }

    pub fn names(&self, kind: ResourceKind) -> Vec<String> {
        match kind {
            ResourceKind::Cache => self.caches.read().keys().cloned().collect(),
            ResourceKind::RateLimit => self.rate_limits.read().keys().cloned().collect(),
        }
    }

    /// Build every declared resource. Rate limits first, so caches may reference them.
    pub fn initialize(&self, registry: &Registry) -> Result<(), ConfigError> {
        for (name, descriptor) in self.rate_limits.pending() {
            let instance = registry.build_rate_limit(&descriptor, self)?;
            self.rate_limits.write().insert(name.clone(), Entry::Live(instance));
            tracing::debug!(resource = %name, kind = %ResourceKind::RateLimit, "resource initialized");
        }

        for (name, descriptor) in self.caches.pending() {
            let instance = registry.build_cache(&descriptor, self)?;
            self.caches.write().insert(name.clone(), Entry::Live(instance));
            tracing::debug!(resource = %name, kind = %ResourceKind::Cache, "resource initialized");
        }

        Ok(())
    }

    pub fn resolve_cache(&self, name: &str) -> Result<CacheHandle, ResourceError> {
        self.ensure_open(name)?;
        self.caches.resolve(ResourceKind::Cache, name)
    }

    pub fn resolve_rate_limit(&self, name: &str) -> Result<RateLimitHandle, ResourceError> {
        self.ensure_open(name)?;
        self.rate_limits.resolve(ResourceKind::RateLimit, name)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Close every instance once. Later calls are no-ops.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        for (name, cache) in self.caches.drain_live() {
            if let Err(e) = cache.close().await {
                tracing::warn!(resource = %name, error = %e, "failed to close cache");
            }
        }
        for (name, limiter) in self.rate_limits.drain_live() {
            if let Err(e) = limiter.close().await {
                tracing::warn!(resource = %name, error = %e, "failed to close rate limit");
            }
        }

        tracing::debug!("resources shut down");
    }
}
