use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;

use super::Batch;

/// Resolution of a transaction's acknowledgment
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckOutcome {
    Success,
    Failure(String),
}

impl AckOutcome {
    pub fn failure(reason: impl fmt::Display) -> Self {
        AckOutcome::Failure(reason.to_string())
    }

    pub fn is_success(&self) -> bool {
        matches!(self, AckOutcome::Success)
    }
}

impl fmt::Display for AckOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AckOutcome::Success => f.write_str("success"),
            AckOutcome::Failure(reason) => write!(f, "failure: {reason}"),
        }
    }
}

type AckFn = Box<dyn FnOnce(AckOutcome) + Send + 'static>;

struct AckInner {
    callback: Mutex<Option<AckFn>>,
    resolved: AtomicBool,
}

impl Drop for AckInner {
    fn drop(&mut self) {
        if !self.resolved.load(Ordering::Acquire) {
            tracing::warn!("transaction dropped without acknowledgment, input will be redelivered");
        }
    }
}

/// One-shot acknowledgment callback.
///
/// Clones share the same callback. The first call to [`Ack::resolve`] runs it;
/// later calls are logged and ignored.
#[derive(Clone)]
pub struct Ack {
    inner: Arc<AckInner>,
}

impl Ack {
    pub fn new<F>(callback: F) -> Self
    where
        F: FnOnce(AckOutcome) + Send + 'static,
    {
        Self {
            inner: Arc::new(AckInner {
                callback: Mutex::new(Some(Box::new(callback))),
                resolved: AtomicBool::new(false),
            }),
        }
    }

    /// Ack that does nothing when resolved, for sources with nothing to commit
    pub fn noop() -> Self {
        Self::new(|_| {})
    }

    /// Resolve the acknowledgment. Returns false if it was already resolved.
    pub fn resolve(&self, outcome: AckOutcome) -> bool {
        let callback = self
            .inner
            .callback
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();

        match callback {
            Some(callback) => {
                self.inner.resolved.store(true, Ordering::Release);
                callback(outcome);
                true
            }
            None => {
                tracing::warn!(%outcome, "ignoring repeated acknowledgment of resolved transaction");
                false
            }
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.inner.resolved.load(Ordering::Acquire)
    }
}

impl fmt::Debug for Ack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ack")
            .field("resolved", &self.is_resolved())
            .finish()
    }
}

/// A batch paired with its acknowledgment callback
#[derive(Debug)]
pub struct Transaction {
    batch: Batch,
    ack: Ack,
}

impl Transaction {
    pub fn new<F>(batch: Batch, on_ack: F) -> Self
    where
        F: FnOnce(AckOutcome) + Send + 'static,
    {
        Self {
            batch,
            ack: Ack::new(on_ack),
        }
    }

    pub fn with_ack(batch: Batch, ack: Ack) -> Self {
        Self { batch, ack }
    }

    /// Transaction whose outcome is delivered on a oneshot channel, for
    /// sources that commit progress from async code.
    pub fn channel(batch: Batch) -> (Self, oneshot::Receiver<AckOutcome>) {
        let (tx, rx) = oneshot::channel();
        let txn = Self::new(batch, move |outcome| {
            let _ = tx.send(outcome);
        });
        (txn, rx)
    }

    pub fn batch(&self) -> &Batch {
        &self.batch
    }

    pub fn ack(&self) -> &Ack {
        &self.ack
    }

    pub fn into_parts(self) -> (Batch, Ack) {
        (self.batch, self.ack)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Message;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_second_resolve_is_noop() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let ack = Ack::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(ack.resolve(AckOutcome::Success));
        assert!(!ack.resolve(AckOutcome::failure("late")));
        assert!(!ack.clone().resolve(AckOutcome::Success));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(ack.is_resolved());
    }

    #[tokio::test]
    async fn test_channel_transaction_delivers_outcome() {
        let (txn, rx) = Transaction::channel(Batch::single(Message::new("x")));
        let (batch, ack) = txn.into_parts();
        assert_eq!(batch.len(), 1);

        ack.resolve(AckOutcome::failure("sink down"));
        assert_eq!(rx.await.unwrap(), AckOutcome::Failure("sink down".to_string()));
    }
}
