//! Queue worker loop.

use std::sync::Arc;

use crate::lifecycle::ShutdownSignal;
use crate::queue::dispatch::QueueCore;
use crate::storage::StorageError;

/// Drain the pending lists until shutdown.
///
/// Shutdown is only observed between messages, so a message that has been
/// dequeued is always routed to an outcome before the worker exits.
pub(crate) async fn run(core: Arc<QueueCore>, worker_id: usize, mut shutdown: ShutdownSignal) {
    let poll_interval = core.settings.poll_interval();
    tracing::debug!(worker_id, "Queue worker started");

    while !shutdown.is_triggered() {
        match core.dequeue().await {
            Ok(Some(message)) => {
                tracing::trace!(worker_id, message_id = %message.id, "Message dequeued");
                core.process_message(message).await;
            }
            Ok(None) | Err(StorageError::CircuitOpen) => {
                shutdown.sleep(poll_interval).await;
            }
            Err(e) => {
                tracing::warn!(worker_id, error = %e, "Failed to dequeue message");
                shutdown.sleep(poll_interval).await;
            }
        }
    }

    tracing::debug!(worker_id, "Queue worker stopped");
}
