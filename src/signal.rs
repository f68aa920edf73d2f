//! Shutdown signal shared by `run` and `shutdown`.

use std::sync::Arc;
use tokio::sync::watch;

/// Cloneable one-shot completion signal.
///
/// A backend owns one of these; pass your own with `with_signal` to tie
/// several backends (or other tasks) to the same shutdown.
///
/// # Example
///
/// ```
/// use cache_queue::ShutdownSignal;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let signal = ShutdownSignal::new();
/// let waiter = signal.clone();
///
/// let handle = tokio::spawn(async move { waiter.wait().await });
/// assert!(signal.trigger());
/// handle.await.unwrap();
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct ShutdownSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        ShutdownSignal { tx: Arc::new(tx) }
    }

    /// Fire the signal. Returns `true` only for the call that fired it.
    pub fn trigger(&self) -> bool {
        !self.tx.send_replace(true)
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    /// Wait until the signal fires. Returns immediately if it already has.
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as `self`, so the channel cannot close here.
        let _ = rx.wait_for(|fired| *fired).await;
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}
