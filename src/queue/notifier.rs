//! Best-effort notification when a message is dead-lettered.

use async_trait::async_trait;

use crate::queue::dead_letter::DeadLetterEntry;

/// Receives terminal failures. Errors are logged by the queue and never
/// propagated.
#[async_trait]
pub trait FailureNotifier: Send + Sync {
    async fn notify(&self, entry: &DeadLetterEntry) -> Result<(), String>;
}

/// Default notifier: an error-level log line.
pub struct LogNotifier;

#[async_trait]
impl FailureNotifier for LogNotifier {
    async fn notify(&self, entry: &DeadLetterEntry) -> Result<(), String> {
        tracing::error!(
            message_id = %entry.message.id,
            message_type = %entry.message.message_type,
            user_id = %entry.message.user_id,
            retry_count = entry.message.retry_count,
            final_error = %entry.final_error,
            "Message moved to dead letter queue"
        );
        Ok(())
    }
}
