#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use streamtab::core::{AckOutcome, Batch, Context, Message, MetaValue, Sink, Source, Transaction, TransformStage};
use streamtab::error::{BatchError, ReadError, WriteError};
use tokio::sync::Notify;

pub fn text(message: &Message) -> String {
    String::from_utf8_lossy(message.payload()).into_owned()
}

pub fn payloads(batch: &Batch) -> Vec<String> {
    batch.iter().map(text).collect()
}

/// What a [`VecSource`] observed about its transactions.
#[derive(Debug, Default)]
pub struct SourceLog {
    /// Item ids in the order they were handed to the stream, redeliveries included.
    pub delivered: Vec<u32>,
    pub acked: Vec<u32>,
    pub nacked: Vec<u32>,
    pub max_outstanding: usize,
    /// Transactions still unresolved when `close` was called.
    pub outstanding_at_close: Option<usize>,
    outstanding: usize,
    queue: VecDeque<(u32, Vec<String>)>,
}

impl SourceLog {
    pub fn resolved(&self) -> usize {
        self.acked.len() + self.nacked.len()
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding
    }
}

/// Source over an in-memory list of batches. With redelivery on, a nacked
/// batch goes back on the queue, the way a broker would redeliver it.
pub struct VecSource {
    log: Arc<Mutex<SourceLog>>,
    notify: Arc<Notify>,
    redeliver: bool,
}

impl VecSource {
    pub fn new<S: AsRef<str>>(batches: Vec<Vec<S>>) -> (Self, Arc<Mutex<SourceLog>>) {
        let queue = batches
            .into_iter()
            .enumerate()
            .map(|(i, b)| (i as u32, b.iter().map(|s| s.as_ref().to_string()).collect()))
            .collect();
        let log = Arc::new(Mutex::new(SourceLog {
            queue,
            ..SourceLog::default()
        }));
        (
            Self {
                log: log.clone(),
                notify: Arc::new(Notify::new()),
                redeliver: false,
            },
            log,
        )
    }

    /// `count` single-message batches with payloads `"0"`, `"1"`, ...
    pub fn numbered(count: usize) -> (Self, Arc<Mutex<SourceLog>>) {
        Self::new((0..count).map(|i| vec![i.to_string()]).collect())
    }

    pub fn with_redelivery(mut self) -> Self {
        self.redeliver = true;
        self
    }
}

#[async_trait]
impl Source for VecSource {
    async fn next(&mut self, _ctx: &Context) -> Result<Transaction, ReadError> {
        loop {
            let notified = self.notify.notified();
            {
                let mut log = self.log.lock().unwrap();
                if let Some((id, items)) = log.queue.pop_front() {
                    log.delivered.push(id);
                    log.outstanding += 1;
                    log.max_outstanding = log.max_outstanding.max(log.outstanding);

                    let batch: Batch = items
                        .iter()
                        .map(|p| Message::new(p.clone()).with_metadata("item", id as i64))
                        .collect();
                    let log_ref = self.log.clone();
                    let notify = self.notify.clone();
                    let redeliver = self.redeliver;
                    return Ok(Transaction::new(batch, move |outcome| {
                        let mut log = log_ref.lock().unwrap();
                        log.outstanding -= 1;
                        match outcome {
                            AckOutcome::Success => log.acked.push(id),
                            AckOutcome::Failure(_) => {
                                log.nacked.push(id);
                                if redeliver {
                                    log.queue.push_back((id, items));
                                }
                            }
                        }
                        notify.notify_waiters();
                    }));
                }
                if log.outstanding == 0 {
                    return Err(ReadError::EndOfInput);
                }
            }
            notified.await;
        }
    }

    async fn close(&mut self, _ctx: &Context) -> Result<()> {
        let mut log = self.log.lock().unwrap();
        log.outstanding_at_close = Some(log.outstanding);
        Ok(())
    }
}

/// One read outcome for a [`ScriptedSource`].
#[derive(Debug, Clone)]
pub enum Step {
    Item(&'static str),
    Transient(&'static str),
    Fatal(&'static str),
}

/// Source that replays a fixed script of reads, then reports end of input.
pub struct ScriptedSource {
    steps: VecDeque<Step>,
    reads: Arc<Mutex<usize>>,
    acks: Arc<Mutex<Vec<AckOutcome>>>,
}

impl ScriptedSource {
    pub fn new(steps: Vec<Step>) -> (Self, Arc<Mutex<Vec<AckOutcome>>>) {
        let acks = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                steps: steps.into(),
                reads: Arc::new(Mutex::new(0)),
                acks: acks.clone(),
            },
            acks,
        )
    }

    /// Shared count of `next` calls, errors included.
    pub fn reads(&self) -> Arc<Mutex<usize>> {
        self.reads.clone()
    }
}

#[async_trait]
impl Source for ScriptedSource {
    async fn next(&mut self, _ctx: &Context) -> Result<Transaction, ReadError> {
        *self.reads.lock().unwrap() += 1;
        match self.steps.pop_front() {
            None => Err(ReadError::EndOfInput),
            Some(Step::Transient(reason)) => Err(ReadError::Transient(anyhow!(reason))),
            Some(Step::Fatal(reason)) => Err(ReadError::Fatal(anyhow!(reason))),
            Some(Step::Item(payload)) => {
                let acks = self.acks.clone();
                Ok(Transaction::new(Batch::single(Message::new(payload)), move |outcome| {
                    acks.lock().unwrap().push(outcome);
                }))
            }
        }
    }
}

/// Records every accepted batch.
#[derive(Clone, Default)]
pub struct Collected {
    inner: Arc<Mutex<CollectedInner>>,
}

#[derive(Default)]
struct CollectedInner {
    batches: Vec<Vec<String>>,
    attempts: usize,
    closed: bool,
}

impl Collected {
    pub fn batches(&self) -> Vec<Vec<String>> {
        self.inner.lock().unwrap().batches.clone()
    }

    pub fn messages(&self) -> Vec<String> {
        self.batches().into_iter().flatten().collect()
    }

    pub fn attempts(&self) -> usize {
        self.inner.lock().unwrap().attempts
    }

    pub fn closed(&self) -> bool {
        self.inner.lock().unwrap().closed
    }
}

/// Sink that accepts everything after failing its first `failures` writes.
pub struct CollectSink {
    out: Collected,
    failures: usize,
    fatal: bool,
    delay: Duration,
    reject_containing: Option<String>,
}

impl CollectSink {
    pub fn new() -> (Self, Collected) {
        let out = Collected::default();
        (
            Self {
                out: out.clone(),
                failures: 0,
                fatal: false,
                delay: Duration::ZERO,
                reject_containing: None,
            },
            out,
        )
    }

    pub fn failing(mut self, failures: usize) -> Self {
        self.failures = failures;
        self
    }

    /// Every write fails with an unrecoverable error.
    pub fn fatal(mut self) -> Self {
        self.fatal = true;
        self
    }

    pub fn slow(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Report messages containing `needle` as individually rejected.
    pub fn rejecting(mut self, needle: &str) -> Self {
        self.reject_containing = Some(needle.to_string());
        self
    }
}

#[async_trait]
impl Sink for CollectSink {
    async fn write_batch(&mut self, ctx: &Context, batch: &Batch) -> Result<(), WriteError> {
        self.out.inner.lock().unwrap().attempts += 1;
        if !self.delay.is_zero() && !ctx.sleep(self.delay).await {
            return Err(WriteError::Transient(anyhow!("interrupted")));
        }
        if self.fatal {
            return Err(WriteError::Fatal(anyhow!("credentials rejected")));
        }
        if self.failures > 0 {
            self.failures -= 1;
            return Err(WriteError::Transient(anyhow!("connection reset")));
        }

        let mut rejected = BatchError::new();
        let mut accepted = Vec::new();
        for (i, message) in batch.iter().enumerate() {
            let payload = text(message);
            match &self.reject_containing {
                Some(needle) if payload.contains(needle.as_str()) => {
                    rejected = rejected.fail(i, format!("rejected '{payload}'"));
                }
                _ => accepted.push(payload),
            }
        }

        self.out.inner.lock().unwrap().batches.push(accepted);
        if rejected.is_empty() {
            Ok(())
        } else {
            Err(WriteError::Partial(rejected))
        }
    }

    async fn close(&mut self, _ctx: &Context) -> Result<()> {
        self.out.inner.lock().unwrap().closed = true;
        Ok(())
    }
}

/// Fails any batch holding a message that contains `needle`.
pub struct FailOn(pub &'static str);

#[async_trait]
impl TransformStage for FailOn {
    async fn apply(&self, _ctx: &Context, batch: Batch) -> Result<Batch> {
        if batch.iter().any(|m| text(m).contains(self.0)) {
            return Err(anyhow!("payload contains '{}'", self.0));
        }
        Ok(batch)
    }
}

/// Replaces every message with `factor` copies; 0 drops everything.
pub struct Expand(pub usize);

#[async_trait]
impl TransformStage for Expand {
    async fn apply(&self, _ctx: &Context, batch: Batch) -> Result<Batch> {
        Ok(batch
            .iter()
            .flat_map(|m| {
                (0..self.0).map(move |copy| {
                    let mut out = m.derive(m.payload().clone());
                    out.set_meta("copy", MetaValue::Int(copy as i64));
                    out
                })
            })
            .collect())
    }
}
