use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use streamtab_macros::Component;

use crate::core::{Batch, Context, Message, MetaValue, TransformStage};
use crate::resources::{CacheHandle, RateLimitHandle, ResourceManager};

#[derive(Component, Debug, Clone, Deserialize)]
#[component(
    kind = "processor",
    name = "noop",
    summary = "Passes batches through unchanged.",
    constructor = "Noop::from_config"
)]
pub struct NoopConfig {}

pub struct Noop;

impl Noop {
    fn from_config(_config: NoopConfig, _resources: &ResourceManager) -> Result<Box<dyn TransformStage>> {
        Ok(Box::new(Noop))
    }
}

#[async_trait]
impl TransformStage for Noop {
    async fn apply(&self, _ctx: &Context, batch: Batch) -> Result<Batch> {
        Ok(batch)
    }
}

#[derive(Component, Debug, Clone, Deserialize)]
#[component(
    kind = "processor",
    name = "metadata",
    summary = "Sets metadata keys on every message.",
    constructor = "SetMetadata::from_config"
)]
pub struct MetadataConfig {
    /// Keys and scalar values to set.
    #[field(default = "{}")]
    pub set: BTreeMap<String, Value>,

    /// Keys to remove.
    #[field(default = "[]", advanced)]
    pub delete: Vec<String>,
}

pub struct SetMetadata {
    set: Vec<(String, MetaValue)>,
    delete: Vec<String>,
}

impl SetMetadata {
    fn from_config(config: MetadataConfig, _resources: &ResourceManager) -> Result<Box<dyn TransformStage>> {
        let set: Vec<(String, MetaValue)> = config
            .set
            .into_iter()
            .map(|(key, value)| {
                MetaValue::from_json(&value)
                    .map(|v| (key.clone(), v))
                    .ok_or_else(|| anyhow!("metadata value for '{key}' must be a scalar"))
            })
            .collect::<Result<_>>()?;

        Ok(Box::new(Self {
            set,
            delete: config.delete,
        }))
    }
}

#[async_trait]
impl TransformStage for SetMetadata {
    async fn apply(&self, _ctx: &Context, mut batch: Batch) -> Result<Batch> {
        for message in batch.iter_mut() {
            for key in &self.delete {
                message.remove_meta(key);
            }
            for (key, value) in &self.set {
                message.set_meta(key.clone(), value.clone());
            }
        }
        Ok(batch)
    }
}

#[derive(Component, Debug, Clone, Deserialize)]
#[component(
    kind = "processor",
    name = "filter",
    summary = "Keeps messages whose payload contains a substring.",
    constructor = "Filter::from_config"
)]
pub struct FilterConfig {
    /// Substring to look for.
    pub contains: String,

    /// Drop matching messages instead of keeping them.
    #[field(default = "false")]
    pub invert: bool,
}

pub struct Filter {
    needle: Vec<u8>,
    invert: bool,
}

impl Filter {
    pub fn new(contains: impl Into<String>, invert: bool) -> Self {
        Self {
            needle: contains.into().into_bytes(),
            invert,
        }
    }

    fn from_config(config: FilterConfig, _resources: &ResourceManager) -> Result<Box<dyn TransformStage>> {
        Ok(Box::new(Self::new(config.contains, config.invert)))
    }

    fn matches(&self, payload: &[u8]) -> bool {
        self.needle.is_empty() || payload.windows(self.needle.len()).any(|w| w == self.needle)
    }
}

#[async_trait]
impl TransformStage for Filter {
    async fn apply(&self, _ctx: &Context, batch: Batch) -> Result<Batch> {
        Ok(batch
            .into_iter()
            .filter(|m| self.matches(m.payload()) != self.invert)
            .collect())
    }
}

#[derive(Component, Debug, Clone, Deserialize)]
#[component(
    kind = "processor",
    name = "split",
    summary = "Splits each message payload into one message per delimited part.",
    constructor = "Split::from_config"
)]
pub struct SplitConfig {
    #[field(default = "\n")]
    pub delimiter: String,
}

pub struct Split {
    delimiter: Vec<u8>,
}

impl Split {
    pub fn new(delimiter: impl Into<String>) -> Self {
        Self {
            delimiter: delimiter.into().into_bytes(),
        }
    }

    fn from_config(config: SplitConfig, _resources: &ResourceManager) -> Result<Box<dyn TransformStage>> {
        if config.delimiter.is_empty() {
            return Err(anyhow!("delimiter must not be empty"));
        }
        Ok(Box::new(Self::new(config.delimiter)))
    }

    fn parts(&self, payload: &Bytes) -> Vec<Bytes> {
        let mut parts = Vec::new();
        let mut start = 0;
        let mut i = 0;
        while i + self.delimiter.len() <= payload.len() {
            if payload[i..].starts_with(&self.delimiter) {
                parts.push(payload.slice(start..i));
                i += self.delimiter.len();
                start = i;
            } else {
                i += 1;
            }
        }
        parts.push(payload.slice(start..));
        parts.retain(|p| !p.is_empty());
        parts
    }
}

#[async_trait]
impl TransformStage for Split {
    async fn apply(&self, _ctx: &Context, batch: Batch) -> Result<Batch> {
        Ok(batch
            .iter()
            .flat_map(|message| {
                self.parts(message.payload())
                    .into_iter()
                    .map(move |part| message.derive(part))
            })
            .collect())
    }
}

#[derive(Component, Debug, Clone, Deserialize)]
#[component(
    kind = "processor",
    name = "merge",
    summary = "Joins every message of a batch into a single message.",
    constructor = "Merge::from_config"
)]
pub struct MergeConfig {
    #[field(default = "\n")]
    pub separator: String,
}

pub struct Merge {
    separator: Vec<u8>,
}

impl Merge {
    pub fn new(separator: impl Into<String>) -> Self {
        Self {
            separator: separator.into().into_bytes(),
        }
    }

    fn from_config(config: MergeConfig, _resources: &ResourceManager) -> Result<Box<dyn TransformStage>> {
        Ok(Box::new(Self::new(config.separator)))
    }
}

#[async_trait]
impl TransformStage for Merge {
    async fn apply(&self, _ctx: &Context, batch: Batch) -> Result<Batch> {
        if batch.len() < 2 {
            return Ok(batch);
        }
        let mut payload = Vec::new();
        for (i, message) in batch.iter().enumerate() {
            if i > 0 {
                payload.extend_from_slice(&self.separator);
            }
            payload.extend_from_slice(message.payload());
        }
        Ok(Batch::single(Message::merge(batch.iter(), payload)))
    }
}

#[derive(Component, Debug, Clone, Deserialize)]
#[component(
    kind = "processor",
    name = "cache",
    summary = "Reads, writes or deletes cache entries keyed per message.",
    constructor = "CacheStage::from_config"
)]
pub struct CacheConfig {
    /// Label of a cache resource.
    #[field(resource = "cache")]
    pub resource: String,

    #[field(default = "get", options = "get,set,delete")]
    pub operator: String,

    /// Metadata key holding the cache key. The payload is the key when unset.
    pub key_metadata: Option<String>,

    /// Expiry for `set`, overriding the cache default.
    #[field(advanced)]
    pub ttl_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CacheOperator {
    Get,
    Set,
    Delete,
}

/// On `get` a hit replaces the payload; every message gets a `cache_hit` flag.
pub struct CacheStage {
    cache: CacheHandle,
    operator: CacheOperator,
    key_metadata: Option<String>,
    ttl: Option<Duration>,
}

impl CacheStage {
    fn from_config(config: CacheConfig, resources: &ResourceManager) -> Result<Box<dyn TransformStage>> {
        let operator = match config.operator.as_str() {
            "get" => CacheOperator::Get,
            "set" => CacheOperator::Set,
            "delete" => CacheOperator::Delete,
            other => return Err(anyhow!("unknown cache operator '{other}'")),
        };

        Ok(Box::new(Self {
            cache: resources.resolve_cache(&config.resource)?,
            operator,
            key_metadata: config.key_metadata,
            ttl: config.ttl_ms.map(Duration::from_millis),
        }))
    }

    fn key(&self, message: &Message) -> Result<String> {
        match &self.key_metadata {
            Some(meta) => message
                .meta(meta)
                .map(|v| v.to_string())
                .ok_or_else(|| anyhow!("message has no '{meta}' metadata for the cache key")),
            None => Ok(String::from_utf8_lossy(message.payload()).into_owned()),
        }
    }
}

#[async_trait]
impl TransformStage for CacheStage {
    async fn apply(&self, _ctx: &Context, batch: Batch) -> Result<Batch> {
        let mut out = Vec::with_capacity(batch.len());
        for mut message in batch {
            let key = self.key(&message)?;
            match self.operator {
                CacheOperator::Get => match self.cache.get(&key).await? {
                    Some(value) => {
                        let mut hit = message.derive(value);
                        hit.set_meta("cache_hit", true);
                        message = hit;
                    }
                    None => message.set_meta("cache_hit", false),
                },
                CacheOperator::Set => {
                    self.cache.set(&key, message.payload().clone(), self.ttl).await?;
                }
                CacheOperator::Delete => self.cache.delete(&key).await?,
            }
            out.push(message);
        }
        Ok(Batch::new(out))
    }
}

#[derive(Component, Debug, Clone, Deserialize)]
#[component(
    kind = "processor",
    name = "rate_limit",
    summary = "Waits on a rate limit resource once per message.",
    constructor = "RateLimitStage::from_config"
)]
pub struct RateLimitConfig {
    /// Label of a rate limit resource.
    #[field(resource = "rate_limit")]
    pub resource: String,
}

pub struct RateLimitStage {
    limiter: RateLimitHandle,
}

impl RateLimitStage {
    fn from_config(config: RateLimitConfig, resources: &ResourceManager) -> Result<Box<dyn TransformStage>> {
        Ok(Box::new(Self {
            limiter: resources.resolve_rate_limit(&config.resource)?,
        }))
    }
}

#[async_trait]
impl TransformStage for RateLimitStage {
    async fn apply(&self, ctx: &Context, batch: Batch) -> Result<Batch> {
        for _ in 0..batch.len() {
            self.limiter.wait(ctx).await?;
        }
        Ok(batch)
    }
}

#[derive(Component, Debug, Clone, Deserialize)]
#[component(
    kind = "processor",
    name = "sleep",
    summary = "Delays every batch.",
    constructor = "Sleep::from_config"
)]
pub struct SleepConfig {
    #[field(default = "0", min = 0.0)]
    pub duration_ms: u64,
}

pub struct Sleep {
    duration: Duration,
}

impl Sleep {
    pub fn new(duration: Duration) -> Self {
        Self { duration }
    }

    fn from_config(config: SleepConfig, _resources: &ResourceManager) -> Result<Box<dyn TransformStage>> {
        Ok(Box::new(Self::new(Duration::from_millis(config.duration_ms))))
    }
}

#[async_trait]
impl TransformStage for Sleep {
    async fn apply(&self, ctx: &Context, batch: Batch) -> Result<Batch> {
        if !ctx.sleep(self.duration).await {
            return Err(anyhow!("sleep interrupted by shutdown"));
        }
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch(payloads: &[&str]) -> Batch {
        payloads.iter().map(|p| Message::new(p.to_string())).collect()
    }

    fn payloads(batch: &Batch) -> Vec<String> {
        batch
            .iter()
            .map(|m| String::from_utf8_lossy(m.payload()).into_owned())
            .collect()
    }

    #[tokio::test]
    async fn test_split_expands_and_keeps_metadata() {
        let ctx = Context::background();
        let input: Batch = vec![Message::new("a,b,,c").with_metadata("src", "x")]
            .into_iter()
            .collect();
        let out = Split::new(",").apply(&ctx, input).await.unwrap();
        assert_eq!(payloads(&out), vec!["a", "b", "c"]);
        assert!(out.iter().all(|m| m.meta("src") == Some(&MetaValue::from("x"))));
    }

    #[tokio::test]
    async fn test_merge_collapses_batch() {
        let ctx = Context::background();
        let out = Merge::new("+").apply(&ctx, batch(&["a", "b", "c"])).await.unwrap();
        assert_eq!(payloads(&out), vec!["a+b+c"]);
    }

    #[tokio::test]
    async fn test_filter_and_invert() {
        let ctx = Context::background();
        let kept = Filter::new("err", false)
            .apply(&ctx, batch(&["error: x", "ok", "stderr"]))
            .await
            .unwrap();
        assert_eq!(payloads(&kept), vec!["error: x", "stderr"]);

        let dropped = Filter::new("err", true)
            .apply(&ctx, batch(&["error: x"]))
            .await
            .unwrap();
        assert!(dropped.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_interrupted() {
        let (stop, ctx) = crate::core::shutdown_channel();
        stop.signal();
        let err = Sleep::new(Duration::from_secs(5))
            .apply(&ctx, batch(&["a"]))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("interrupted"));
    }
}
