//! One-shot completion signal fired when a cache has fully released its
//! resources.

use std::sync::Arc;

use tokio::sync::watch;

/// A completion signal that fires exactly once.
///
/// Cloning is cheap; every clone observes the same signal. Waiters that
/// subscribe after the signal has fired complete immediately.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownSignal {
    /// Creates an unfired signal.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        ShutdownSignal { tx: Arc::new(tx) }
    }

    /// Fires the signal. Subsequent calls are no-ops.
    pub fn fire(&self) {
        self.tx.send_replace(true);
    }

    /// Whether the signal has fired.
    pub fn is_fired(&self) -> bool {
        *self.tx.borrow()
    }

    /// Waits until the signal fires.
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in self, so wait_for cannot observe a closed
        // channel while we hold &self.
        let _ = rx.wait_for(|fired| *fired).await;
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}
