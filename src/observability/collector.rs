use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

use super::StageMetrics;

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub stage: String,
    pub batches_processed: u64,
    pub messages_processed: u64,
    pub errors_count: u64,
    pub retries_count: u64,
    pub avg_latency_us: u64,
}

/// Registry of per-stage metrics. Clones share the underlying counters.
#[derive(Clone, Default)]
pub struct MetricsCollector {
    metrics: BTreeMap<String, Arc<StageMetrics>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Metrics for `stage`, created on first use.
    pub fn stage(&mut self, stage: &str) -> Arc<StageMetrics> {
        self.metrics
            .entry(stage.to_string())
            .or_insert_with(|| Arc::new(StageMetrics::new(stage)))
            .clone()
    }

    pub fn register(&mut self, stage: impl Into<String>, metrics: Arc<StageMetrics>) {
        self.metrics.insert(stage.into(), metrics);
    }

    pub fn snapshot(&self) -> BTreeMap<String, MetricsSnapshot> {
        self.metrics
            .iter()
            .map(|(id, metrics)| {
                (
                    id.clone(),
                    MetricsSnapshot {
                        stage: metrics.stage().to_string(),
                        batches_processed: metrics.batches_processed(),
                        messages_processed: metrics.messages_processed(),
                        errors_count: metrics.errors_count(),
                        retries_count: metrics.retries_count(),
                        avg_latency_us: metrics.avg_latency_us(),
                    },
                )
            })
            .collect()
    }

    pub fn get_stage_metrics(&self, stage: &str) -> Option<Arc<StageMetrics>> {
        self.metrics.get(stage).cloned()
    }
}
