use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Mutex;
use std::time::Duration;
use streamtab_macros::Component;
use tokio::time::Instant;

use crate::core::{Context, RateLimiter};
use crate::resources::ResourceManager;

#[derive(Component, Debug, Clone, Deserialize)]
#[component(
    kind = "rate_limit",
    name = "local",
    summary = "Token bucket allowing `count` operations per interval.",
    constructor = "LocalRateLimit::from_config"
)]
pub struct LocalRateLimitConfig {
    #[field(default = "1000", min = 1.0)]
    pub count: u64,

    #[field(default = "1000", min = 1.0)]
    pub interval_ms: u64,
}

struct Bucket {
    remaining: u64,
    refilled_at: Instant,
}

pub struct LocalRateLimit {
    count: u64,
    interval: Duration,
    bucket: Mutex<Bucket>,
}

impl LocalRateLimit {
    pub fn new(count: u64, interval: Duration) -> Self {
        Self {
            count: count.max(1),
            interval,
            bucket: Mutex::new(Bucket {
                remaining: count.max(1),
                refilled_at: Instant::now(),
            }),
        }
    }

    fn from_config(config: LocalRateLimitConfig, _resources: &ResourceManager) -> Result<Box<dyn RateLimiter>> {
        Ok(Box::new(Self::new(
            config.count,
            Duration::from_millis(config.interval_ms),
        )))
    }

    /// Take a token, or report how long until the bucket refills.
    fn try_acquire(&self) -> Option<Duration> {
        let mut bucket = self.bucket.lock().unwrap_or_else(|p| p.into_inner());
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.refilled_at);
        if elapsed >= self.interval {
            bucket.remaining = self.count;
            bucket.refilled_at = now;
        }

        if bucket.remaining > 0 {
            bucket.remaining -= 1;
            None
        } else {
            Some(self.interval.saturating_sub(elapsed))
        }
    }
}

#[async_trait]
impl RateLimiter for LocalRateLimit {
    async fn wait(&self, ctx: &Context) -> Result<()> {
        while let Some(delay) = self.try_acquire() {
            if !ctx.sleep(delay).await {
                bail!("rate limit wait cancelled");
            }
        }
        Ok(())
    }
}
