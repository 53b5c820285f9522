use serde::Serialize;
use std::time::Duration;

/// Totals for a completed stream run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StreamReport {
    /// Transactions admitted from sources.
    pub received: u64,
    pub acked: u64,
    pub nacked: u64,
    /// Transactions whose batches were filtered to nothing.
    pub filtered: u64,
    /// Largest number of simultaneously unresolved transactions.
    pub high_water: usize,
    #[serde(with = "duration_ms")]
    pub duration: Duration,
}

impl StreamReport {
    /// Transactions admitted but never resolved. Zero after a clean drain.
    pub fn abandoned(&self) -> u64 {
        self.received.saturating_sub(self.acked + self.nacked)
    }
}

mod duration_ms {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }
}
