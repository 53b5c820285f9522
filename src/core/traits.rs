use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;
use tokio::sync::mpsc;

use super::{Batch, Context, Envelope, Transaction};
use crate::error::{ReadError, WriteError};

/// Produces transactions from an external origin.
#[async_trait]
pub trait Source: Send {
    /// Establish any connection needed before the stream starts.
    async fn connect(&mut self, _ctx: &Context) -> Result<()> {
        Ok(())
    }

    /// Produce the next transaction, or report end of input / a read error.
    ///
    /// A `Transient` error is retried locally by the stream after a short
    /// backoff; a `Fatal` error stops the stream.
    async fn next(&mut self, ctx: &Context) -> Result<Transaction, ReadError>;

    /// Called once every transaction this source produced has been resolved.
    async fn close(&mut self, _ctx: &Context) -> Result<()> {
        Ok(())
    }
}

/// Consumes batches. Acknowledgment is handled by the stream from the write result.
#[async_trait]
pub trait Sink: Send {
    async fn connect(&mut self, _ctx: &Context) -> Result<()> {
        Ok(())
    }

    async fn write_batch(&mut self, ctx: &Context, batch: &Batch) -> Result<(), WriteError>;

    async fn close(&mut self, _ctx: &Context) -> Result<()> {
        Ok(())
    }
}

/// A pure function over batches, shared by every worker.
///
/// Returning an empty batch filters it; the owning transactions then resolve
/// as successful. Returning an error fails the owning transactions and skips
/// the remaining stages for that batch.
#[async_trait]
pub trait TransformStage: Send + Sync {
    async fn apply(&self, ctx: &Context, batch: Batch) -> Result<Batch>;

    async fn close(&self, _ctx: &Context) -> Result<()> {
        Ok(())
    }
}

/// Intermediary between sources and the transform workers.
#[async_trait]
pub trait Buffer: Send {
    /// Consume envelopes from `rx` and forward them to `tx`, possibly re-batched.
    /// Must run until `rx` is closed and flush everything it holds before returning.
    async fn run(
        self: Box<Self>,
        ctx: Context,
        rx: mpsc::Receiver<Envelope>,
        tx: mpsc::Sender<Envelope>,
    ) -> Result<()>;

    /// Whether inputs are acknowledged as soon as the buffer takes their batch,
    /// rather than once every output has delivered it.
    fn decouples_acks(&self) -> bool {
        false
    }
}

/// Key/value cache resource, shared between workers.
#[async_trait]
pub trait Cache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Bytes>>;

    /// Store `value`; `ttl` of `None` uses the cache's default expiry.
    async fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Rate limiter resource, shared between workers.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Block until an operation is permitted or the context is cancelled.
    async fn wait(&self, ctx: &Context) -> Result<()>;

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
