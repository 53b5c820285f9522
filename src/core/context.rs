//! Cancellation signalling shared by every stage.
//!
//! Built on a tokio watch channel so that any number of tasks observe the
//! same signal, the way worker coordination signals are usually shared.

use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;

/// Sending side of a cancellation signal.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    /// Signal every context derived from this handle. Idempotent.
    pub fn signal(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_signalled(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn context(&self) -> Context {
        Context {
            rx: Some(self.tx.subscribe()),
        }
    }
}

/// Receiving side of a cancellation signal, handed to every adapter call.
#[derive(Debug, Clone)]
pub struct Context {
    rx: Option<watch::Receiver<bool>>,
}

/// Create a linked handle/context pair.
pub fn shutdown_channel() -> (ShutdownHandle, Context) {
    let (tx, rx) = watch::channel(false);
    (
        ShutdownHandle { tx: Arc::new(tx) },
        Context { rx: Some(rx) },
    )
}

impl Context {
    /// Context that is never cancelled
    pub fn background() -> Self {
        Self { rx: None }
    }

    pub fn is_cancelled(&self) -> bool {
        self.rx.as_ref().map(|rx| *rx.borrow()).unwrap_or(false)
    }

    /// Completes once the signal fires. Never completes for a background context
    /// or when every handle has been dropped without signalling.
    pub async fn cancelled(&self) {
        let Some(rx) = &self.rx else {
            return std::future::pending().await;
        };
        let mut rx = rx.clone();
        if rx.wait_for(|cancelled| *cancelled).await.is_err() {
            std::future::pending::<()>().await;
        }
    }

    /// Run `fut` unless the context is cancelled first.
    pub async fn run<F: Future>(&self, fut: F) -> Option<F::Output> {
        tokio::select! {
            biased;
            _ = self.cancelled() => None,
            out = fut => Some(out),
        }
    }

    /// Sleep for `duration`, returning false if cancelled before it elapsed.
    pub async fn sleep(&self, duration: std::time::Duration) -> bool {
        self.run(tokio::time::sleep(duration)).await.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_signal_reaches_all_contexts() {
        let (handle, ctx) = shutdown_channel();
        let other = handle.context();
        assert!(!ctx.is_cancelled());

        handle.signal();
        assert!(ctx.is_cancelled());
        other.cancelled().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_returns_none_when_cancelled() {
        let (handle, ctx) = shutdown_channel();
        handle.signal();
        let out = ctx.run(tokio::time::sleep(Duration::from_secs(60))).await;
        assert!(out.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_never_cancels() {
        let ctx = Context::background();
        assert!(ctx.sleep(Duration::from_millis(10)).await);
    }
}
