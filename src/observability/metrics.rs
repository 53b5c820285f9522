use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Counters for one stage of a stream (a source, transform, or sink).
pub struct StageMetrics {
    stage: String,
    batches_processed: AtomicU64,
    messages_processed: AtomicU64,
    errors_count: AtomicU64,
    retries_count: AtomicU64,
    total_latency_us: AtomicU64,
    latency_samples: AtomicU64,
}

impl StageMetrics {
    pub fn new(stage: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            batches_processed: AtomicU64::new(0),
            messages_processed: AtomicU64::new(0),
            errors_count: AtomicU64::new(0),
            retries_count: AtomicU64::new(0),
            total_latency_us: AtomicU64::new(0),
            latency_samples: AtomicU64::new(0),
        }
    }

    pub fn stage(&self) -> &str {
        &self.stage
    }

    pub fn batches_processed(&self) -> u64 {
        self.batches_processed.load(Ordering::Relaxed)
    }

    pub fn messages_processed(&self) -> u64 {
        self.messages_processed.load(Ordering::Relaxed)
    }

    pub fn errors_count(&self) -> u64 {
        self.errors_count.load(Ordering::Relaxed)
    }

    pub fn retries_count(&self) -> u64 {
        self.retries_count.load(Ordering::Relaxed)
    }

    pub fn record_batch(&self, messages: usize) {
        self.batches_processed.fetch_add(1, Ordering::Relaxed);
        self.messages_processed
            .fetch_add(messages as u64, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.retries_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn start_processing(&self) -> Instant {
        Instant::now()
    }

    pub fn finish_processing(&self, start: Instant) {
        let latency_us = start.elapsed().as_micros() as u64;
        self.total_latency_us.fetch_add(latency_us, Ordering::Relaxed);
        self.latency_samples.fetch_add(1, Ordering::Relaxed);
    }

    pub fn avg_latency_us(&self) -> u64 {
        let samples = self.latency_samples.load(Ordering::Relaxed);
        if samples == 0 {
            return 0;
        }
        self.total_latency_us.load(Ordering::Relaxed) / samples
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let metrics = StageMetrics::new("processor.split");
        metrics.record_batch(3);
        metrics.record_batch(2);
        metrics.record_error();
        metrics.record_retry();

        assert_eq!(metrics.stage(), "processor.split");
        assert_eq!(metrics.batches_processed(), 2);
        assert_eq!(metrics.messages_processed(), 5);
        assert_eq!(metrics.errors_count(), 1);
        assert_eq!(metrics.retries_count(), 1);
    }

    #[test]
    fn test_latency_average_without_samples() {
        let metrics = StageMetrics::new("output.drop");
        assert_eq!(metrics.avg_latency_us(), 0);
        let start = metrics.start_processing();
        metrics.finish_processing(start);
        assert!(metrics.avg_latency_us() < 1_000_000);
    }
}
