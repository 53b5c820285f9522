mod common;

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use common::{CollectSink, VecSource};
use serde_json::json;
use streamtab::config::ComponentConfig;
use streamtab::core::Cache;
use streamtab::error::ResourceError;
use streamtab::registry::ResourceKind;
use streamtab::{ConfigError, Registry, ResourceManager, StreamBuilder, StreamConfig};

/// Cache that counts writes and closes.
#[derive(Default)]
struct CountingCache {
    entries: Mutex<HashMap<String, Bytes>>,
    sets: AtomicUsize,
    closes: AtomicUsize,
}

#[async_trait]
impl Cache for CountingCache {
    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        Ok(self.entries.lock().unwrap().get(key).cloned())
    }

    async fn set(&self, key: &str, value: Bytes, _ttl: Option<Duration>) -> Result<()> {
        self.sets.fetch_add(1, Ordering::SeqCst);
        self.entries.lock().unwrap().insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.lock().unwrap().remove(key);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn test_resolving_twice_shares_one_instance() {
    let resources = ResourceManager::new();
    let cache = Arc::new(CountingCache::default());
    resources.add_cache("shared", cache.clone()).unwrap();

    let a = resources.resolve_cache("shared").unwrap();
    let b = resources.resolve_cache("shared").unwrap();
    a.set("k", Bytes::from_static(b"1"), None).await.unwrap();
    b.set("k", Bytes::from_static(b"2"), None).await.unwrap();

    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(cache.sets.load(Ordering::SeqCst), 2);
    assert_eq!(a.get("k").await.unwrap(), Some(Bytes::from_static(b"2")));
}

#[test]
fn test_unknown_label_fails_lookup() {
    let resources = ResourceManager::new();
    let err = resources.resolve_cache("nope").err().unwrap();
    assert!(matches!(err, ResourceError::Unknown { kind: ResourceKind::Cache, .. }));

    let err = resources.resolve_rate_limit("nope").err().unwrap();
    assert!(matches!(err, ResourceError::Unknown { kind: ResourceKind::RateLimit, .. }));
}

#[test]
fn test_duplicate_label_is_rejected() {
    let resources = ResourceManager::new();
    resources.add_cache("c", Arc::new(CountingCache::default())).unwrap();
    let err = resources
        .add_cache("c", Arc::new(CountingCache::default()))
        .unwrap_err();
    assert!(matches!(err, ResourceError::Duplicate { .. }));
}

#[tokio::test]
async fn test_shutdown_closes_each_instance_once() {
    let resources = ResourceManager::new();
    let cache = Arc::new(CountingCache::default());
    resources.add_cache("shared", cache.clone()).unwrap();
    let _first = resources.resolve_cache("shared").unwrap();
    let _second = resources.resolve_cache("shared").unwrap();

    resources.shutdown().await;
    resources.shutdown().await;

    assert_eq!(cache.closes.load(Ordering::SeqCst), 1);
    assert!(resources.is_closed());
    assert!(matches!(
        resources.resolve_cache("shared"),
        Err(ResourceError::Closed { .. })
    ));
}

#[tokio::test]
async fn test_declared_resources_are_built_by_initialize() {
    let registry = Registry::with_builtins();
    let resources = ResourceManager::new();
    resources
        .register(
            ResourceKind::Cache,
            "users",
            ComponentConfig::new("memory").with_config(json!({ "default_ttl_ms": 0 })),
        )
        .unwrap();
    resources
        .register(
            ResourceKind::RateLimit,
            "api",
            ComponentConfig::new("local").with_config(json!({ "count": 10, "interval_ms": 1000 })),
        )
        .unwrap();

    assert!(resources.resolve_cache("users").is_err());
    resources.initialize(&registry).unwrap();

    let cache = resources.resolve_cache("users").unwrap();
    cache.set("id", Bytes::from_static(b"ada"), None).await.unwrap();
    assert_eq!(cache.get("id").await.unwrap(), Some(Bytes::from_static(b"ada")));
    assert!(resources.resolve_rate_limit("api").is_ok());
    assert_eq!(resources.names(ResourceKind::Cache), vec!["users".to_string()]);
}

#[tokio::test]
async fn test_cache_resource_declared_in_config() {
    let raw = json!({
        "inputs": [{ "type": "generate", "config": { "payload": "key", "count": 3, "interval_ms": 0 } }],
        "pipeline": {
            "threads": 1,
            "processors": [
                { "type": "cache", "label": "writer", "config": { "resource": "shared", "operator": "set" } },
                { "type": "metadata", "config": { "set": { "stage": "between" } } },
                { "type": "cache", "label": "reader", "config": { "resource": "shared", "operator": "get" } }
            ]
        },
        "outputs": [{ "type": "drop" }],
        "cache_resources": [{ "type": "memory", "label": "shared" }]
    });
    let config = StreamConfig::from_json_str(&raw.to_string()).unwrap();
    let registry = Registry::with_builtins();

    let mut stream = StreamBuilder::from_config(&config, &registry).await.unwrap();
    let report = stream.run().await.unwrap();

    assert_eq!(report.acked, 3);
    assert_eq!(report.nacked, 0);
}

#[tokio::test]
async fn test_stages_share_instance_and_stream_closes_it() {
    let registry = Registry::with_builtins();
    let resources = Arc::new(ResourceManager::new());
    let cache = Arc::new(CountingCache::default());
    resources.add_cache("shared", cache.clone()).unwrap();

    let writer = registry
        .build_stage(
            &ComponentConfig::new("cache").with_config(json!({ "resource": "shared", "operator": "set" })),
            &resources,
        )
        .unwrap();
    let reader = registry
        .build_stage(
            &ComponentConfig::new("cache").with_config(json!({ "resource": "shared" })),
            &resources,
        )
        .unwrap();

    let (source, log) = VecSource::new(vec![vec!["k1"], vec!["k2"]]);
    let (sink, out) = CollectSink::new();
    let mut stream = StreamBuilder::new(resources.clone())
        .input("vec", Box::new(source))
        .processor("writer", writer)
        .processor("reader", reader)
        .output("collect", Box::new(sink))
        .build()
        .unwrap();
    stream.run().await.unwrap();

    assert_eq!(log.lock().unwrap().acked.len(), 2);
    assert_eq!(cache.sets.load(Ordering::SeqCst), 2);
    assert_eq!(out.messages().len(), 2);
    assert_eq!(cache.closes.load(Ordering::SeqCst), 1);
    assert!(resources.is_closed());
}

#[tokio::test]
async fn test_undeclared_resource_fails_before_construction() {
    let raw = json!({
        "inputs": [{ "type": "generate", "config": { "count": 1 } }],
        "pipeline": {
            "processors": [{ "type": "rate_limit", "config": { "resource": "missing" } }]
        },
        "outputs": [{ "type": "drop" }]
    });
    let config = StreamConfig::from_json_str(&raw.to_string()).unwrap();
    let err = StreamBuilder::from_config(&config, &Registry::with_builtins())
        .await
        .err()
        .unwrap();

    assert!(matches!(
        err,
        ConfigError::UnknownResource { kind: ResourceKind::RateLimit, ref name, .. } if name == "missing"
    ));
}
