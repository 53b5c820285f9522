pub mod collector;
pub mod metrics;
pub mod monitor;
pub mod report;

pub use collector::{MetricsCollector, MetricsSnapshot};
pub use metrics::StageMetrics;
pub use monitor::PipelineMonitor;
pub use report::StreamReport;
