pub mod builder;
pub mod state;
pub mod stream;
pub mod tracker;
pub mod workers;

pub use builder::StreamBuilder;
pub use state::StreamState;
pub use stream::{StageStatus, Stream, StreamHealth, StreamOptions};
pub use tracker::{AckTracker, TrackerStats};
pub use workers::{apply_stages, NamedStage, WorkerPool};
