//! Stream orchestrator.
//!
//! Wires sources, an optional buffer, the transform worker pool and sinks with
//! bounded channels of capacity `max_in_flight`:
//!
//! ```text
//! sources -> [buffer] -> workers -> [fan-out] -> sinks
//! ```
//!
//! Every transaction holds an admission permit from the [`AckTracker`] until it
//! resolves, so the number of unresolved transactions never exceeds
//! `max_in_flight` times the number of stage boundaries.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::StreamConfig;
use crate::core::{
    shutdown_channel, AckOutcome, Buffer, Context, Envelope, ShutdownHandle, Sink, Source,
    TransformStage,
};
use crate::error::{ReadError, StreamError, StreamResult, WriteError};
use crate::observability::{MetricsCollector, PipelineMonitor, StageMetrics, StreamReport};
use crate::resilience::{RetryPolicy, RetryingSink};
use crate::resources::ResourceManager;

use super::state::StreamState;
use super::tracker::AckTracker;
use super::workers::{forward, spawn_fanout, spawn_hand_off, NamedStage, WorkerPool};

/// Runtime knobs for a stream.
#[derive(Debug, Clone)]
pub struct StreamOptions {
    pub max_in_flight: usize,
    pub threads: usize,
    pub shutdown_timeout: Duration,
    pub read_backoff: Duration,
    pub retry: RetryPolicy,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self::from(&StreamConfig::default())
    }
}

impl From<&StreamConfig> for StreamOptions {
    fn from(config: &StreamConfig) -> Self {
        Self {
            max_in_flight: config.delivery.max_in_flight.max(1),
            threads: config.threads(),
            shutdown_timeout: config.delivery.shutdown_timeout(),
            read_backoff: config.delivery.read_backoff(),
            retry: RetryPolicy::from(&config.delivery.retry),
        }
    }
}

/// Constructed adapters, ready to be connected and run.
#[derive(Default)]
pub(crate) struct StreamParts {
    pub sources: Vec<(String, Box<dyn Source>)>,
    pub buffer: Option<(String, Box<dyn Buffer>)>,
    pub stages: Vec<(String, Arc<dyn TransformStage>)>,
    pub sinks: Vec<(String, Box<dyn Sink>)>,
}

impl StreamParts {
    fn boundaries(&self) -> usize {
        2 + usize::from(self.buffer.is_some()) + usize::from(self.sinks.len() > 1)
    }
}

/// First unrecoverable error raised by any stage; raising it stops the stream.
struct FatalSignal {
    first: Mutex<Option<StreamError>>,
    stop: ShutdownHandle,
}

impl FatalSignal {
    fn raise(&self, error: StreamError) {
        tracing::error!(error = %error, "unrecoverable error, stopping stream");
        let mut first = self.first.lock().unwrap_or_else(|p| p.into_inner());
        first.get_or_insert(error);
        self.stop.signal();
    }

    fn take(&self) -> Option<StreamError> {
        self.first.lock().unwrap_or_else(|p| p.into_inner()).take()
    }
}

struct Tasks {
    sources: Vec<(String, JoinHandle<Box<dyn Source>>)>,
    buffer: Option<(String, JoinHandle<anyhow::Result<()>>)>,
    hand_off: Option<JoinHandle<()>>,
    workers: WorkerPool,
    fanout: Option<JoinHandle<()>>,
    sinks: Vec<(String, JoinHandle<RetryingSink>)>,
    supervisor: JoinHandle<()>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StageStatus {
    pub stage: String,
    pub running: bool,
}

/// Readiness and liveness snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct StreamHealth {
    pub state: StreamState,
    /// Running and every stage task alive.
    pub ready: bool,
    /// Not yet stopped or failed.
    pub live: bool,
    pub outstanding: usize,
    pub stages: Vec<StageStatus>,
}

pub struct Stream {
    parts: Option<StreamParts>,
    stages: Option<Arc<[NamedStage]>>,
    options: StreamOptions,
    resources: Arc<ResourceManager>,
    tracker: Arc<AckTracker>,
    state: Arc<Mutex<StreamState>>,
    stop: ShutdownHandle,
    stop_ctx: Context,
    kill: ShutdownHandle,
    kill_ctx: Context,
    fatal: Arc<FatalSignal>,
    collector: MetricsCollector,
    tasks: Option<Tasks>,
    started_at: Option<Instant>,
}

impl Stream {
    pub(crate) fn new(
        parts: StreamParts,
        options: StreamOptions,
        resources: Arc<ResourceManager>,
    ) -> Self {
        let (stop, stop_ctx) = shutdown_channel();
        let (kill, kill_ctx) = shutdown_channel();
        let tracker = Arc::new(AckTracker::new(
            options.max_in_flight.max(1) * parts.boundaries(),
        ));

        Self {
            parts: Some(parts),
            stages: None,
            options,
            resources,
            tracker,
            state: Arc::new(Mutex::new(StreamState::Idle)),
            fatal: Arc::new(FatalSignal {
                first: Mutex::new(None),
                stop: stop.clone(),
            }),
            stop,
            stop_ctx,
            kill,
            kill_ctx,
            collector: MetricsCollector::new(),
            tasks: None,
            started_at: None,
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, StreamState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn state(&self) -> StreamState {
        self.lock_state().clone()
    }

    fn transition_to(&self, target: StreamState) -> StreamResult<()> {
        transition(&self.state, target)
    }

    /// Upper bound on simultaneously unresolved transactions.
    pub fn in_flight_limit(&self) -> usize {
        self.tracker.capacity()
    }

    /// Handle that triggers a graceful stop from anywhere.
    pub fn stop_handle(&self) -> ShutdownHandle {
        self.stop.clone()
    }

    /// Stop reading from sources and drain in-flight transactions.
    pub fn stop(&self) {
        self.stop.signal();
    }

    /// Stop immediately: remaining in-flight transactions are failed.
    pub fn kill(&self) {
        self.stop.signal();
        self.kill.signal();
    }

    pub fn monitor(&self) -> PipelineMonitor {
        PipelineMonitor::new(self.collector.clone())
    }

    pub fn report(&self) -> StreamReport {
        let stats = self.tracker.stats();
        StreamReport {
            received: stats.received,
            acked: stats.acked,
            nacked: stats.nacked,
            filtered: stats.filtered,
            high_water: stats.high_water,
            duration: self
                .started_at
                .map(|t| t.elapsed())
                .unwrap_or_default(),
        }
    }

    pub fn health(&self) -> StreamHealth {
        let state = self.state();
        let mut stages = Vec::new();
        if let Some(tasks) = &self.tasks {
            for (name, handle) in &tasks.sources {
                stages.push(StageStatus {
                    stage: format!("input.{name}"),
                    running: !handle.is_finished(),
                });
            }
            if let Some((name, handle)) = &tasks.buffer {
                stages.push(StageStatus {
                    stage: format!("buffer.{name}"),
                    running: !handle.is_finished(),
                });
            }
            stages.push(StageStatus {
                stage: "pipeline".to_string(),
                running: tasks.workers.running() == tasks.workers.len(),
            });
            for (name, handle) in &tasks.sinks {
                stages.push(StageStatus {
                    stage: format!("output.{name}"),
                    running: !handle.is_finished(),
                });
            }
        }

        StreamHealth {
            ready: state == StreamState::Running && stages.iter().all(|s| s.running),
            live: !state.is_terminal(),
            outstanding: self.tracker.outstanding(),
            state,
            stages,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.health().ready
    }

    /// Connect every adapter and spawn the stage tasks.
    ///
    /// Sinks connect before sources; any connection failure aborts the start
    /// before data moves, and the resources are shut down.
    pub async fn start(&mut self) -> StreamResult<()> {
        self.transition_to(StreamState::Starting)?;
        let parts = self.parts.take().unwrap_or_default();

        match self.launch(parts).await {
            Ok(tasks) => {
                self.tasks = Some(tasks);
                self.started_at = Some(Instant::now());
                self.transition_to(StreamState::Running)?;
                tracing::info!(
                    max_in_flight = self.options.max_in_flight,
                    threads = self.options.threads,
                    "stream running"
                );
                Ok(())
            }
            Err(e) => {
                *self.lock_state() = StreamState::Failed {
                    error_msg: e.to_string(),
                };
                self.resources.shutdown().await;
                Err(e)
            }
        }
    }

    async fn launch(&mut self, parts: StreamParts) -> StreamResult<Tasks> {
        let capacity = self.options.max_in_flight.max(1);

        let mut sinks = Vec::with_capacity(parts.sinks.len());
        for (name, sink) in parts.sinks {
            let metrics = self.collector.stage(&format!("output.{name}"));
            let mut sink = RetryingSink::new(sink, metrics, self.options.retry.clone());
            if let Err(source) = sink.connect(&self.stop_ctx).await {
                close_sinks(sinks.into_iter().map(|(_, s)| s)).await;
                return Err(StreamError::Connect {
                    stage: format!("output.{name}"),
                    source,
                });
            }
            tracing::debug!(stage = %format!("output.{name}"), "output connected");
            sinks.push((name, sink));
        }

        let mut sources = Vec::with_capacity(parts.sources.len());
        for (name, mut source) in parts.sources {
            if let Err(e) = source.connect(&self.stop_ctx).await {
                close_sources(sources).await;
                close_sinks(sinks.into_iter().map(|(_, s)| s)).await;
                return Err(StreamError::Connect {
                    stage: format!("input.{name}"),
                    source: e,
                });
            }
            tracing::debug!(stage = %format!("input.{name}"), "input connected");
            sources.push((name, source));
        }

        let stages: Arc<[NamedStage]> = parts
            .stages
            .into_iter()
            .map(|(name, stage)| NamedStage {
                metrics: self.collector.stage(&format!("processor.{name}")),
                name,
                stage,
            })
            .collect();
        self.stages = Some(stages.clone());

        // Spawn downstream first so every sender has a live receiver.
        let mut sink_handles = Vec::with_capacity(sinks.len());
        let mut sink_txs = Vec::with_capacity(sinks.len());
        for (name, sink) in sinks {
            let (tx, rx) = mpsc::channel(capacity);
            sink_txs.push(tx);
            let handle = tokio::spawn(run_sink(
                sink,
                rx,
                self.tracker.clone(),
                self.kill_ctx.clone(),
                self.fatal.clone(),
            ));
            sink_handles.push((name, handle));
        }

        let (pipeline_tx, fanout) = if sink_txs.len() == 1 {
            (sink_txs.remove(0), None)
        } else {
            let (tx, rx) = mpsc::channel(capacity);
            let handle = spawn_fanout(rx, sink_txs, self.tracker.clone(), self.kill_ctx.clone());
            (tx, Some(handle))
        };

        let (work_tx, work_rx) = mpsc::channel(capacity);
        let workers = WorkerPool::spawn(
            self.options.threads,
            work_rx,
            pipeline_tx,
            stages,
            self.tracker.clone(),
            self.kill_ctx.clone(),
        );

        let (source_tx, buffer, hand_off) = match parts.buffer {
            Some((name, buffer)) => {
                let (tx, rx) = mpsc::channel(capacity);
                let (source_tx, hand_off) = if buffer.decouples_acks() {
                    let (intake_tx, intake_rx) = mpsc::channel(capacity);
                    let handle =
                        spawn_hand_off(intake_rx, tx, self.tracker.clone(), self.kill_ctx.clone());
                    (intake_tx, Some(handle))
                } else {
                    (tx, None)
                };
                let kill = self.kill_ctx.clone();
                let handle = tokio::spawn(async move { buffer.run(kill, rx, work_tx).await });
                (source_tx, Some((name, handle)), hand_off)
            }
            None => (work_tx, None, None),
        };

        let source_handles = sources
            .into_iter()
            .map(|(name, source)| {
                let task = SourceTask {
                    metrics: self.collector.stage(&format!("input.{name}")),
                    stage: format!("input.{name}"),
                    tx: source_tx.clone(),
                    tracker: self.tracker.clone(),
                    stop: self.stop_ctx.clone(),
                    kill: self.kill_ctx.clone(),
                    fatal: self.fatal.clone(),
                    read_backoff: self.options.read_backoff,
                };
                (name, tokio::spawn(task.run(source)))
            })
            .collect();

        let supervisor = tokio::spawn(supervise(
            self.stop_ctx.clone(),
            self.kill.clone(),
            self.state.clone(),
            self.options.shutdown_timeout,
        ));

        Ok(Tasks {
            sources: source_handles,
            buffer,
            hand_off,
            workers,
            fanout,
            sinks: sink_handles,
            supervisor,
        })
    }

    /// Wait for the stream to finish, then close adapters and resources.
    ///
    /// Returns once every admitted transaction has been resolved.
    pub async fn join(&mut self) -> StreamResult<StreamReport> {
        let Some(tasks) = self.tasks.take() else {
            return Err(StreamError::InvalidTransition {
                from: self.state().name().to_string(),
                to: "Stopped".to_string(),
            });
        };
        let mut panicked = None;

        let mut sources = Vec::new();
        for (name, handle) in tasks.sources {
            match handle.await {
                Ok(source) => sources.push((name, source)),
                Err(e) => {
                    tracing::error!(stage = %format!("input.{name}"), error = %e, "input task panicked");
                    panicked.get_or_insert(StreamError::TaskPanicked {
                        stage: format!("input.{name}"),
                    });
                }
            }
        }

        let _ = transition(&self.state, StreamState::Draining);
        tracing::info!(
            outstanding = self.tracker.outstanding(),
            "inputs closed, draining in-flight transactions"
        );

        if let Some(handle) = tasks.hand_off {
            if handle.await.is_err() {
                panicked.get_or_insert(StreamError::TaskPanicked {
                    stage: "buffer intake".to_string(),
                });
            }
        }

        if let Some((name, handle)) = tasks.buffer {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::error!(stage = %format!("buffer.{name}"), error = %e, "buffer failed")
                }
                Err(_) => {
                    panicked.get_or_insert(StreamError::TaskPanicked {
                        stage: format!("buffer.{name}"),
                    });
                }
            }
        }

        if tasks.workers.join().await > 0 {
            panicked.get_or_insert(StreamError::TaskPanicked {
                stage: "pipeline".to_string(),
            });
        }

        if let Some(handle) = tasks.fanout {
            if handle.await.is_err() {
                panicked.get_or_insert(StreamError::TaskPanicked {
                    stage: "fanout".to_string(),
                });
            }
        }

        let mut sinks = Vec::new();
        for (name, handle) in tasks.sinks {
            match handle.await {
                Ok(sink) => sinks.push(sink),
                Err(e) => {
                    tracing::error!(stage = %format!("output.{name}"), error = %e, "output task panicked");
                    panicked.get_or_insert(StreamError::TaskPanicked {
                        stage: format!("output.{name}"),
                    });
                }
            }
        }
        tasks.supervisor.abort();

        let leftover = self
            .tracker
            .fail_outstanding("stream terminated before the transaction was resolved");
        if leftover > 0 {
            tracing::warn!(leftover, "failed transactions left behind by a stage");
        }

        close_sources(sources).await;
        if let Some(stages) = self.stages.take() {
            let ctx = Context::background();
            for named in stages.iter() {
                if let Err(e) = named.stage.close(&ctx).await {
                    tracing::warn!(stage = %named.name, error = %e, "failed to close processor");
                }
            }
        }
        close_sinks(sinks).await;
        self.resources.shutdown().await;

        let report = self.report();
        match self.fatal.take().or(panicked) {
            Some(error) => {
                *self.lock_state() = StreamState::Failed {
                    error_msg: error.to_string(),
                };
                Err(error)
            }
            None => {
                let _ = transition(&self.state, StreamState::Stopped);
                tracing::info!(
                    received = report.received,
                    acked = report.acked,
                    nacked = report.nacked,
                    filtered = report.filtered,
                    "stream stopped"
                );
                Ok(report)
            }
        }
    }

    /// Start and wait until every input is exhausted or a fatal error stops the stream.
    pub async fn run(&mut self) -> StreamResult<StreamReport> {
        self.start().await?;
        self.join().await
    }

    /// Like [`Stream::run`], but begin a graceful stop when `signal` completes.
    pub async fn run_until<F>(&mut self, signal: F) -> StreamResult<StreamReport>
    where
        F: Future<Output = ()>,
    {
        self.start().await?;
        let stop = self.stop_handle();

        let join = self.join();
        tokio::pin!(join);
        tokio::pin!(signal);

        tokio::select! {
            report = &mut join => return report,
            _ = &mut signal => {
                tracing::info!("shutdown requested");
                stop.signal();
            }
        }
        join.await
    }
}

fn transition(state: &Mutex<StreamState>, target: StreamState) -> StreamResult<()> {
    let mut current = state.lock().unwrap_or_else(|p| p.into_inner());
    if !current.can_transition_to(&target) {
        return Err(StreamError::InvalidTransition {
            from: current.name().to_string(),
            to: target.name().to_string(),
        });
    }
    tracing::debug!(from = current.name(), to = target.name(), "stream state changed");
    *current = target;
    Ok(())
}

/// Escalate a graceful stop to a hard stop once the grace period runs out.
async fn supervise(
    stop: Context,
    kill: ShutdownHandle,
    state: Arc<Mutex<StreamState>>,
    timeout: Duration,
) {
    stop.cancelled().await;
    let _ = transition(&state, StreamState::Draining);
    tracing::info!(timeout_ms = timeout.as_millis() as u64, "stop requested, draining");

    tokio::time::sleep(timeout).await;
    tracing::warn!("shutdown timeout elapsed, failing remaining in-flight transactions");
    kill.signal();
}

struct SourceTask {
    stage: String,
    metrics: Arc<StageMetrics>,
    tx: mpsc::Sender<Envelope>,
    tracker: Arc<AckTracker>,
    stop: Context,
    kill: Context,
    fatal: Arc<FatalSignal>,
    read_backoff: Duration,
}

impl SourceTask {
    /// Read until end of input, a fatal error, or stop. Hands the adapter back for closing.
    async fn run(self, mut source: Box<dyn Source>) -> Box<dyn Source> {
        loop {
            let Some(permit) = self.tracker.admit(&self.stop).await else {
                break;
            };

            let txn = match self.stop.run(source.next(&self.stop)).await {
                None => break,
                Some(Ok(txn)) => txn,
                Some(Err(ReadError::EndOfInput)) => {
                    tracing::info!(stage = %self.stage, "input exhausted");
                    break;
                }
                Some(Err(ReadError::Transient(e))) => {
                    drop(permit);
                    self.metrics.record_error();
                    tracing::warn!(
                        stage = %self.stage,
                        error = %e,
                        backoff_ms = self.read_backoff.as_millis() as u64,
                        "read failed, retrying"
                    );
                    if !self.stop.sleep(self.read_backoff).await {
                        break;
                    }
                    continue;
                }
                Some(Err(ReadError::Fatal(source_err))) => {
                    self.metrics.record_error();
                    self.fatal.raise(StreamError::Fatal {
                        stage: self.stage.clone(),
                        source: source_err,
                    });
                    break;
                }
            };

            let (mut batch, ack) = txn.into_parts();
            if batch.is_empty() {
                ack.resolve(AckOutcome::Success);
                continue;
            }

            self.metrics.record_batch(batch.len());
            let id = self.tracker.register(ack, permit);
            batch.stamp(id);
            tracing::trace!(stage = %self.stage, txn = %id, messages = batch.len(), "transaction admitted");

            let envelope = Envelope::new(batch, id);
            let delivered = tokio::select! {
                biased;
                _ = self.stop.cancelled() => {
                    self.tracker.resolve(&[id], &AckOutcome::failure("stream stopped before dispatch"));
                    false
                }
                delivered = forward(&self.tx, envelope, &self.tracker, &self.kill) => delivered,
            };
            if !delivered {
                break;
            }
        }

        tracing::debug!(stage = %self.stage, "input task finished");
        source
    }
}

async fn run_sink(
    mut sink: RetryingSink,
    mut rx: mpsc::Receiver<Envelope>,
    tracker: Arc<AckTracker>,
    kill: Context,
    fatal: Arc<FatalSignal>,
) -> RetryingSink {
    let mut halted = false;

    while let Some(envelope) = rx.recv().await {
        if halted || kill.is_cancelled() {
            let reason = if halted {
                "output halted after an unrecoverable error"
            } else {
                "stream stopped before delivery"
            };
            tracker.resolve(envelope.owners(), &AckOutcome::failure(reason));
            continue;
        }

        match sink.write(&kill, &envelope.batch).await {
            Ok(()) => tracker.resolve(envelope.owners(), &AckOutcome::Success),
            Err(WriteError::Partial(err)) => {
                tracing::warn!(stage = %sink.stage(), error = %err, "output rejected part of a batch");
                tracker.resolve_partial(&envelope, &err);
            }
            Err(WriteError::Fatal(source)) => {
                let reason = format!("{source:#}");
                halted = true;
                fatal.raise(StreamError::Fatal {
                    stage: sink.stage().to_string(),
                    source,
                });
                tracker.resolve(envelope.owners(), &AckOutcome::Failure(reason));
            }
            Err(e) => {
                tracing::warn!(stage = %sink.stage(), error = %e, "delivery failed, nacking batch");
                tracker.resolve(envelope.owners(), &AckOutcome::failure(e));
            }
        }
    }

    sink
}

async fn close_sources(sources: Vec<(String, Box<dyn Source>)>) {
    let ctx = Context::background();
    for (name, mut source) in sources {
        if let Err(e) = source.close(&ctx).await {
            tracing::warn!(stage = %format!("input.{name}"), error = %e, "failed to close input");
        }
    }
}

async fn close_sinks(sinks: impl IntoIterator<Item = RetryingSink>) {
    let ctx = Context::background();
    for mut sink in sinks {
        if let Err(e) = sink.close(&ctx).await {
            tracing::warn!(stage = %sink.stage(), error = %e, "failed to close output");
        }
    }
}
