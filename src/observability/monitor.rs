use super::MetricsCollector;

pub struct PipelineMonitor {
    collector: MetricsCollector,
}

impl PipelineMonitor {
    pub fn new(collector: MetricsCollector) -> Self {
        Self { collector }
    }

    /// Human-readable summary of every stage.
    pub fn report(&self) -> String {
        let snapshot = self.collector.snapshot();

        if snapshot.is_empty() {
            return "No stages registered".to_string();
        }

        let mut report = String::from("=== Stream Metrics ===\n");

        for (stage, metrics) in snapshot.iter() {
            let errors = match metrics.errors_count {
                0 => "0 errors".to_string(),
                1 => "1 error".to_string(),
                n => format!("{n} errors"),
            };
            report.push_str(&format!(
                "\n[{}]\n  Batches: {} ({} messages)\n  Errors: {}\n  Retries: {}\n  Avg Latency: {}μs\n",
                stage,
                metrics.batches_processed,
                metrics.messages_processed,
                errors,
                metrics.retries_count,
                metrics.avg_latency_us
            ));
        }

        report
    }

    pub fn collector(&self) -> &MetricsCollector {
        &self.collector
    }
}
