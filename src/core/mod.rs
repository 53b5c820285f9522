pub mod context;
pub mod envelope;
pub mod message;
pub mod traits;
pub mod transaction;

pub use context::{shutdown_channel, Context, ShutdownHandle};
pub use envelope::{Envelope, TxnId};
pub use message::{Batch, Message, MetaValue};
pub use traits::{Buffer, Cache, RateLimiter, Sink, Source, TransformStage};
pub use transaction::{Ack, AckOutcome, Transaction};
