use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use streamtab_macros::Component;
use tokio::io::{AsyncWriteExt, Stdout};

use crate::core::{Batch, Context, Sink};
use crate::error::WriteError;
use crate::resources::ResourceManager;

#[derive(Component, Debug, Clone, Deserialize)]
#[component(
    kind = "output",
    name = "drop",
    summary = "Discards every message and acknowledges it.",
    constructor = "DropSink::from_config"
)]
pub struct DropConfig {}

pub struct DropSink;

impl DropSink {
    fn from_config(_config: DropConfig, _resources: &ResourceManager) -> Result<Box<dyn Sink>> {
        Ok(Box::new(DropSink))
    }
}

#[async_trait]
impl Sink for DropSink {
    async fn write_batch(&mut self, _ctx: &Context, _batch: &Batch) -> Result<(), WriteError> {
        Ok(())
    }
}

#[derive(Component, Debug, Clone, Deserialize)]
#[component(
    kind = "output",
    name = "stdout",
    summary = "Writes message payloads to stdout.",
    constructor = "StdoutSink::from_config"
)]
pub struct StdoutConfig {
    /// Written after every message.
    #[field(default = "\n")]
    pub delimiter: String,
}

pub struct StdoutSink {
    out: Stdout,
    delimiter: Vec<u8>,
}

impl StdoutSink {
    fn from_config(config: StdoutConfig, _resources: &ResourceManager) -> Result<Box<dyn Sink>> {
        Ok(Box::new(Self {
            out: tokio::io::stdout(),
            delimiter: config.delimiter.into_bytes(),
        }))
    }
}

#[async_trait]
impl Sink for StdoutSink {
    async fn write_batch(&mut self, _ctx: &Context, batch: &Batch) -> Result<(), WriteError> {
        let mut buf = Vec::new();
        for message in batch.iter() {
            buf.extend_from_slice(message.payload());
            buf.extend_from_slice(&self.delimiter);
        }
        self.out
            .write_all(&buf)
            .await
            .map_err(|e| WriteError::Transient(e.into()))?;
        self.out
            .flush()
            .await
            .map_err(|e| WriteError::Transient(e.into()))
    }

    async fn close(&mut self, _ctx: &Context) -> Result<()> {
        self.out.flush().await?;
        Ok(())
    }
}
