use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use streamtab_macros::Component;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::core::{Buffer, Context, Envelope};
use crate::resources::ResourceManager;

#[derive(Component, Debug, Clone, Deserialize)]
#[component(
    kind = "buffer",
    name = "memory",
    summary = "Groups incoming batches in memory by message count or age.",
    constructor = "MemoryBuffer::from_config"
)]
pub struct MemoryBufferConfig {
    /// Flush once this many messages are held.
    #[field(default = "1", min = 1.0)]
    pub count: u64,

    /// Longest time in milliseconds to wait for more messages after the first
    /// arrives. 0 flushes whatever is immediately available.
    #[field(default = "0", min = 0.0)]
    pub period_ms: u64,

    /// Acknowledge inputs once the buffer holds their messages instead of after
    /// delivery. Messages still buffered when the process dies are lost.
    #[field(default = "false", advanced)]
    pub decouple_acks: bool,
}

/// Re-batches envelopes. The merged envelope owes acknowledgment to every input's owners.
pub struct MemoryBuffer {
    count: usize,
    period: Duration,
    decouple_acks: bool,
}

impl MemoryBuffer {
    pub fn new(count: usize, period: Duration) -> Self {
        Self {
            count: count.max(1),
            period,
            decouple_acks: false,
        }
    }

    /// Acknowledge inputs as soon as their batch is buffered.
    pub fn decoupled(mut self) -> Self {
        self.decouple_acks = true;
        self
    }

    fn from_config(config: MemoryBufferConfig, _resources: &ResourceManager) -> Result<Box<dyn Buffer>> {
        let buffer = Self::new(config.count as usize, Duration::from_millis(config.period_ms));
        Ok(Box::new(if config.decouple_acks {
            buffer.decoupled()
        } else {
            buffer
        }))
    }

    async fn next_within(
        rx: &mut mpsc::Receiver<Envelope>,
        ctx: &Context,
        deadline: Option<Instant>,
    ) -> Option<Envelope> {
        let Some(deadline) = deadline.filter(|_| !ctx.is_cancelled()) else {
            return rx.try_recv().ok();
        };
        tokio::select! {
            biased;
            _ = ctx.cancelled() => rx.try_recv().ok(),
            envelope = rx.recv() => envelope,
            _ = tokio::time::sleep_until(deadline) => None,
        }
    }
}

#[async_trait]
impl Buffer for MemoryBuffer {
    async fn run(
        self: Box<Self>,
        ctx: Context,
        mut rx: mpsc::Receiver<Envelope>,
        tx: mpsc::Sender<Envelope>,
    ) -> Result<()> {
        while let Some(first) = rx.recv().await {
            let deadline = (!self.period.is_zero()).then(|| Instant::now() + self.period);
            let mut held = first.len();
            let mut group = vec![first];

            while held < self.count {
                match Self::next_within(&mut rx, &ctx, deadline).await {
                    Some(envelope) => {
                        held += envelope.len();
                        group.push(envelope);
                    }
                    None => break,
                }
            }

            if let Some(merged) = Envelope::merge(group) {
                tracing::trace!(messages = merged.len(), owners = merged.owners().len(), "buffer flush");
                if tx.send(merged).await.is_err() {
                    anyhow::bail!("pipeline closed while the buffer was flushing");
                }
            }
        }
        Ok(())
    }

    fn decouples_acks(&self) -> bool {
        self.decouple_acks
    }
}
