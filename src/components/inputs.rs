use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use streamtab_macros::Component;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};

use crate::core::{Ack, Batch, Context, Message, Source, Transaction};
use crate::error::ReadError;
use crate::resources::ResourceManager;

#[derive(Component, Debug, Clone, Deserialize)]
#[component(
    kind = "input",
    name = "generate",
    summary = "Emits a fixed payload on an interval.",
    constructor = "GenerateSource::from_config"
)]
pub struct GenerateConfig {
    /// Payload of every generated message.
    #[field(default = "hello world")]
    pub payload: String,

    /// Number of batches to emit before the input ends; 0 means no limit.
    #[field(default = "0", min = 0.0)]
    pub count: u64,

    /// Pause between batches in milliseconds.
    #[field(default = "1000", min = 0.0)]
    pub interval_ms: u64,

    /// Messages per batch.
    #[field(default = "1", min = 1.0, max = 10000.0, advanced)]
    pub batch_size: u64,
}

pub struct GenerateSource {
    config: GenerateConfig,
    emitted: u64,
}

impl GenerateSource {
    pub fn new(config: GenerateConfig) -> Self {
        Self { config, emitted: 0 }
    }

    fn from_config(config: GenerateConfig, _resources: &ResourceManager) -> Result<Box<dyn Source>> {
        Ok(Box::new(Self::new(config)))
    }
}

#[async_trait]
impl Source for GenerateSource {
    async fn next(&mut self, ctx: &Context) -> Result<Transaction, ReadError> {
        if self.config.count > 0 && self.emitted >= self.config.count {
            return Err(ReadError::EndOfInput);
        }
        if self.emitted > 0 && self.config.interval_ms > 0 {
            let interval = Duration::from_millis(self.config.interval_ms);
            if !ctx.sleep(interval).await {
                return Err(ReadError::EndOfInput);
            }
        }

        let batch: Batch = (0..self.config.batch_size.max(1))
            .map(|i| {
                Message::new(self.config.payload.clone())
                    .with_metadata("generate_index", (self.emitted * self.config.batch_size + i) as i64)
            })
            .collect();
        self.emitted += 1;

        Ok(Transaction::with_ack(batch, Ack::noop()))
    }
}

#[derive(Component, Debug, Clone, Deserialize)]
#[component(
    kind = "input",
    name = "stdin",
    summary = "Reads newline delimited messages from stdin.",
    constructor = "StdinSource::from_config"
)]
pub struct StdinConfig {}

pub struct StdinSource {
    lines: Lines<BufReader<Stdin>>,
}

impl StdinSource {
    fn from_config(_config: StdinConfig, _resources: &ResourceManager) -> Result<Box<dyn Source>> {
        Ok(Box::new(Self {
            lines: BufReader::new(tokio::io::stdin()).lines(),
        }))
    }
}

#[async_trait]
impl Source for StdinSource {
    async fn next(&mut self, _ctx: &Context) -> Result<Transaction, ReadError> {
        match self.lines.next_line().await {
            Ok(Some(line)) => Ok(Transaction::with_ack(
                Batch::single(Message::new(line)),
                Ack::noop(),
            )),
            Ok(None) => Err(ReadError::EndOfInput),
            Err(e) => Err(ReadError::Fatal(e.into())),
        }
    }
}
