//! Shutdown coordination for queue tasks.

use std::time::Duration;

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::TryRecvError;

/// Coordinator for graceful shutdown.
///
/// Provides a broadcast channel that all long-running tasks can subscribe to.
/// Dropping the coordinator counts as a shutdown for every subscriber.
pub struct Shutdown {
    /// Broadcast channel sender.
    tx: broadcast::Sender<()>,
}

impl Shutdown {
    /// Create a new shutdown coordinator.
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1);
        Self { tx }
    }

    /// Subscribe to the shutdown signal.
    pub fn subscribe(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.tx.subscribe(),
            triggered: false,
        }
    }

    /// Trigger the shutdown signal.
    pub fn trigger(&self) {
        let _ = self.tx.send(());
    }

    /// Get the number of active subscribers (tasks still running).
    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving side held by each task.
pub struct ShutdownSignal {
    rx: broadcast::Receiver<()>,
    triggered: bool,
}

impl ShutdownSignal {
    /// Wait for shutdown. Cancel safe.
    pub async fn recv(&mut self) {
        if self.triggered {
            return;
        }
        let _ = self.rx.recv().await;
        self.triggered = true;
    }

    /// Non-blocking check.
    pub fn is_triggered(&mut self) -> bool {
        if !self.triggered {
            match self.rx.try_recv() {
                Err(TryRecvError::Empty) => {}
                _ => self.triggered = true,
            }
        }
        self.triggered
    }

    /// Sleep for `duration` unless shutdown arrives first.
    /// Returns true if shutdown was triggered.
    pub async fn sleep(&mut self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.recv() => true,
            _ = tokio::time::sleep(duration) => self.triggered,
        }
    }
}
