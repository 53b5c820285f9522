//! Transform worker pool and output fan-out.

use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::core::{AckOutcome, Batch, Context, Envelope, TransformStage};
use crate::observability::StageMetrics;

use super::tracker::AckTracker;

/// A transform stage together with its name and counters.
pub struct NamedStage {
    pub name: String,
    pub stage: Arc<dyn TransformStage>,
    pub metrics: Arc<StageMetrics>,
}

/// Run `batch` through every stage in order.
///
/// Stops early when a stage filters the batch to nothing. The first stage error
/// ends processing of this batch only.
pub async fn apply_stages(
    stages: &[NamedStage],
    ctx: &Context,
    mut batch: Batch,
) -> anyhow::Result<Batch> {
    for named in stages {
        let start = named.metrics.start_processing();
        let result = ctx
            .run(named.stage.apply(ctx, batch))
            .await
            .unwrap_or_else(|| Err(anyhow::anyhow!("stream stopped while processing")));

        match result {
            Ok(out) => {
                named.metrics.finish_processing(start);
                named.metrics.record_batch(out.len());
                if out.is_empty() {
                    return Ok(out);
                }
                batch = out;
            }
            Err(e) => {
                named.metrics.record_error();
                tracing::error!(stage = %named.name, error = %e, "transform failed, failing batch");
                return Err(e.context(format!("processor '{}'", named.name)));
            }
        }
    }
    Ok(batch)
}

/// Send `envelope` downstream, waiting for capacity unless `kill` fires first.
/// On failure the owners are released as failed.
pub(crate) async fn forward(
    tx: &mpsc::Sender<Envelope>,
    envelope: Envelope,
    tracker: &AckTracker,
    kill: &Context,
) -> bool {
    let permit = tokio::select! {
        biased;
        _ = kill.cancelled() => None,
        permit = tx.reserve() => permit.ok(),
    };

    match permit {
        Some(permit) => {
            permit.send(envelope);
            true
        }
        None => {
            let reason = if kill.is_cancelled() {
                "stream stopped before delivery"
            } else {
                "downstream stage closed"
            };
            tracker.resolve(envelope.owners(), &AckOutcome::failure(reason));
            false
        }
    }
}

pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `threads` symmetric workers sharing `rx`.
    pub fn spawn(
        threads: usize,
        rx: mpsc::Receiver<Envelope>,
        tx: mpsc::Sender<Envelope>,
        stages: Arc<[NamedStage]>,
        tracker: Arc<AckTracker>,
        kill: Context,
    ) -> Self {
        let rx = Arc::new(Mutex::new(rx));
        let handles = (0..threads.max(1))
            .map(|worker_id| {
                let rx = rx.clone();
                let tx = tx.clone();
                let stages = stages.clone();
                let tracker = tracker.clone();
                let kill = kill.clone();
                tokio::spawn(async move {
                    run_worker(worker_id, rx, tx, stages, tracker, kill).await;
                })
            })
            .collect();

        tracing::debug!(threads, "transform workers started");
        Self { handles }
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Number of workers still running.
    pub fn running(&self) -> usize {
        self.handles.iter().filter(|h| !h.is_finished()).count()
    }

    /// Wait for every worker. Returns how many panicked.
    pub async fn join(self) -> usize {
        let mut panicked = 0;
        for handle in self.handles {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "transform worker panicked");
                panicked += 1;
            }
        }
        panicked
    }
}

async fn run_worker(
    worker_id: usize,
    rx: Arc<Mutex<mpsc::Receiver<Envelope>>>,
    tx: mpsc::Sender<Envelope>,
    stages: Arc<[NamedStage]>,
    tracker: Arc<AckTracker>,
    kill: Context,
) {
    loop {
        // Only the receive is serialized; processing runs in parallel.
        let next = rx.lock().await.recv().await;
        let Some(envelope) = next else {
            break;
        };

        let (batch, owners) = envelope.into_parts();
        if kill.is_cancelled() {
            tracker.resolve(&owners, &AckOutcome::failure("stream stopped before processing"));
            continue;
        }

        match apply_stages(&stages, &kill, batch).await {
            Ok(batch) if batch.is_empty() => tracker.filtered(&owners),
            Ok(batch) => {
                forward(&tx, Envelope::from_parts(batch, owners), &tracker, &kill).await;
            }
            Err(e) => tracker.resolve(&owners, &AckOutcome::failure(format!("{e:#}"))),
        }
    }

    tracing::trace!(worker_id, "transform worker finished");
}

/// Acknowledge the inputs of each batch entering a decoupling buffer. The batch
/// continues under one internal transaction that keeps their admission permits.
pub fn spawn_hand_off(
    mut rx: mpsc::Receiver<Envelope>,
    tx: mpsc::Sender<Envelope>,
    tracker: Arc<AckTracker>,
    kill: Context,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(envelope) = rx.recv().await {
            let (mut batch, owners) = envelope.into_parts();
            if kill.is_cancelled() {
                tracker.resolve(&owners, &AckOutcome::failure("stream stopped before buffering"));
                continue;
            }
            let Some(id) = tracker.hand_off(&owners) else {
                continue;
            };
            batch.restamp(id);
            tracing::trace!(txn = %id, inputs = owners.len(), "inputs acknowledged by buffer");
            forward(&tx, Envelope::new(batch, id), &tracker, &kill).await;
        }
    })
}

/// Deliver every batch to each output, holding one reference per copy.
/// Copies are sent concurrently so a full output queue only holds back its own copy.
pub fn spawn_fanout(
    mut rx: mpsc::Receiver<Envelope>,
    outputs: Vec<mpsc::Sender<Envelope>>,
    tracker: Arc<AckTracker>,
    kill: Context,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(envelope) = rx.recv().await {
            tracker.retain(envelope.owners(), outputs.len().saturating_sub(1));
            join_all(
                outputs
                    .iter()
                    .map(|output| forward(output, envelope.clone(), &tracker, &kill)),
            )
            .await;
        }
    })
}
