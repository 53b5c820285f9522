use std::sync::Arc;

use crate::core::{Batch, Context, Sink};
use crate::error::WriteError;
use crate::observability::StageMetrics;

use super::RetryPolicy;

/// Wraps a sink with the stream's retry policy and per-stage metrics.
///
/// Transient and partial failures are retried until attempts run out;
/// fatal failures are returned immediately.
pub struct RetryingSink {
    inner: Box<dyn Sink>,
    metrics: Arc<StageMetrics>,
    policy: RetryPolicy,
}

impl RetryingSink {
    pub fn new(inner: Box<dyn Sink>, metrics: Arc<StageMetrics>, policy: RetryPolicy) -> Self {
        Self {
            inner,
            metrics,
            policy,
        }
    }

    pub fn stage(&self) -> &str {
        self.metrics.stage()
    }

    pub async fn connect(&mut self, ctx: &Context) -> anyhow::Result<()> {
        self.inner.connect(ctx).await
    }

    /// Write `batch`, retrying per policy. Backoff sleeps end early if `ctx` is cancelled,
    /// in which case the last error is returned.
    pub async fn write(&mut self, ctx: &Context, batch: &Batch) -> Result<(), WriteError> {
        let mut attempt = 0;
        loop {
            let start = self.metrics.start_processing();
            let result = ctx
                .run(self.inner.write_batch(ctx, batch))
                .await
                .unwrap_or_else(|| {
                    Err(WriteError::Transient(anyhow::anyhow!("write interrupted by shutdown")))
                });
            let err = match result {
                Ok(()) => {
                    self.metrics.finish_processing(start);
                    self.metrics.record_batch(batch.len());
                    return Ok(());
                }
                Err(e) => e,
            };

            self.metrics.record_error();
            attempt += 1;
            if err.is_fatal() || attempt >= self.policy.max_attempts {
                return Err(err);
            }

            let delay = self.policy.backoff.delay_for_attempt(attempt - 1);
            tracing::warn!(
                stage = %self.metrics.stage(),
                attempt,
                delay_ms = %delay.as_millis(),
                error = %err,
                "sink write failed, retrying"
            );
            self.metrics.record_retry();
            if !ctx.sleep(delay).await {
                return Err(err);
            }
        }
    }

    pub async fn close(&mut self, ctx: &Context) -> anyhow::Result<()> {
        self.inner.close(ctx).await
    }
}
