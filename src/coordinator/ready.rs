//! One-shot readiness barrier

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Fires once, when the node is primary or synced with a primary, and
/// never resets.
#[derive(Debug)]
pub struct ReadyGate {
    tx: watch::Sender<bool>,
}

impl ReadyGate {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    /// Mark the node ready. Returns false if the gate had already fired.
    pub fn fire(&self) -> bool {
        self.tx.send_if_modified(|ready| {
            if *ready {
                false
            } else {
                *ready = true;
                true
            }
        })
    }

    pub fn is_ready(&self) -> bool {
        *self.tx.borrow()
    }

    /// Wait until the gate fires
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as `self`, so this cannot fail while we wait.
        let _ = rx.wait_for(|ready| *ready).await;
    }

    /// Wait until the gate fires or `cancel` is triggered. Returns true if ready.
    pub async fn wait_cancellable(&self, cancel: &CancellationToken) -> bool {
        tokio::select! {
            _ = self.wait() => true,
            _ = cancel.cancelled() => self.is_ready(),
        }
    }
}

impl Default for ReadyGate {
    fn default() -> Self {
        Self::new()
    }
}
