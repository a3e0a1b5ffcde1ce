//! Shared queue state and message routing.
//!
//! Workers, the retry scheduler and the buffer drainer all hold an
//! `Arc<QueueCore>`; every path that moves a message between the pending
//! lists, the in-flight set, the retry buffer and the dead letter store goes
//! through here.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;

use crate::config::{QueueSettings, RetrySettings};
use crate::observability::metrics;
use crate::queue::buffer::{BufferAction, CircuitBreakerRetryBuffer};
use crate::queue::dead_letter::{DeadLetterEntry, DeadLetterStore};
use crate::queue::handler::{HandlerError, MessageHandler};
use crate::queue::message::{MessagePriority, MessageStatus, Payload, QueuedMessage};
use crate::queue::notifier::FailureNotifier;
use crate::resilience::{CallError, CircuitBreaker};
use crate::storage::{GuardedStorage, KeySpace, StorageBackend, StorageError, StorageResult};

const NOTIFY_TIMEOUT: Duration = Duration::from_secs(5);

pub(crate) struct QueueCore {
    pub(crate) storage: GuardedStorage,
    pub(crate) keys: KeySpace,
    pub(crate) handler_breaker: Arc<CircuitBreaker>,
    pub(crate) handlers: DashMap<String, Arc<dyn MessageHandler>>,
    pub(crate) dead_letters: DeadLetterStore,
    pub(crate) buffer: CircuitBreakerRetryBuffer,
    pub(crate) in_flight: DashMap<String, QueuedMessage>,
    /// Ids popped from a pending list whose state is still being loaded.
    pub(crate) popped: DashMap<String, MessagePriority>,
    /// Retries claimed from the retry index but not yet pushed.
    pub(crate) promoting: DashMap<String, QueuedMessage>,
    pub(crate) notifier: Arc<dyn FailureNotifier>,
    pub(crate) settings: QueueSettings,
    pub(crate) retry: RetrySettings,
    pub(crate) completed: AtomicU64,
}

impl QueueCore {
    /// Message with the configured retry policy.
    pub(crate) fn new_message(&self, user_id: &str, message_type: &str, payload: Payload) -> QueuedMessage {
        QueuedMessage::new(user_id, message_type, payload)
            .with_max_retries(self.retry.max_retries)
            .with_retry_delays(self.retry.base_delay(), self.retry.max_delay())
    }

    /// Persist as PENDING, or divert to the retry buffer. Never fails.
    pub(crate) async fn enqueue(&self, mut message: QueuedMessage) {
        message.status = MessageStatus::Pending;
        match self.persist_pending(&message).await {
            Ok(()) => {
                metrics::record_enqueued(&message.message_type, message.priority);
                tracing::debug!(
                    message_id = %message.id,
                    message_type = %message.message_type,
                    priority = message.priority.as_str(),
                    "Message enqueued"
                );
            }
            Err(e) => {
                message.status = MessageStatus::CircuitBreakerOpen;
                self.divert(message, BufferAction::Enqueue, &e);
            }
        }
    }

    pub(crate) async fn persist_pending(&self, message: &QueuedMessage) -> StorageResult<()> {
        let state = serde_json::to_string(message)?;
        self.storage.set(&self.keys.message(&message.id), state).await?;
        self.storage.push(&self.keys.pending(message.priority), message.id.clone()).await
    }

    pub(crate) async fn persist_retry(&self, message: &QueuedMessage) -> StorageResult<()> {
        let score = message.next_retry_at.unwrap_or_default() as f64;
        let state = serde_json::to_string(message)?;
        self.storage.set(&self.keys.message(&message.id), state).await?;
        self.storage.zadd(&self.keys.retry(), &message.id, score).await
    }

    pub(crate) async fn load_message(&self, id: &str) -> StorageResult<Option<QueuedMessage>> {
        match self.storage.get(&self.keys.message(id)).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Pop the next message, highest priority first, and mark it in flight.
    pub(crate) async fn dequeue(&self) -> StorageResult<Option<QueuedMessage>> {
        for priority in MessagePriority::ALL {
            let Some(id) = self.storage.pop(&self.keys.pending(priority)).await? else {
                continue;
            };
            self.popped.insert(id.clone(), priority);

            let loaded = self.load_message(&id).await;
            self.popped.remove(&id);
            match loaded {
                Ok(Some(mut message)) => {
                    message.status = MessageStatus::Processing;
                    self.in_flight.insert(id, message.clone());
                    return Ok(Some(message));
                }
                Ok(None) => {
                    // Completed duplicates leave their id behind without state.
                    tracing::debug!(message_id = %id, "Skipping pending id without stored state");
                }
                Err(StorageError::Serialization(e)) => {
                    // The state key is left in place for inspection.
                    tracing::error!(
                        message_id = %id,
                        error = %e,
                        "Undecodable message state, dropping id from pending list"
                    );
                    metrics::record_processed("unknown", "undecodable");
                }
                Err(e) => {
                    self.return_id(id, priority).await;
                    return Err(e);
                }
            }
        }
        Ok(None)
    }

    /// Push a popped id back onto its pending list, or buffer the bare id.
    async fn return_id(&self, id: String, priority: MessagePriority) {
        if let Err(e) = self.storage.push(&self.keys.pending(priority), id.clone()).await {
            tracing::warn!(
                message_id = %id,
                error = %e,
                "Failed to return message id to pending list, held in retry buffer"
            );
            metrics::record_buffered("requeue_id");
            self.buffer.insert_id(id, priority);
        }
    }

    /// Run the handler for an in-flight message and route the outcome.
    pub(crate) async fn process_message(&self, mut message: QueuedMessage) {
        let handler = self.handlers.get(&message.message_type).map(|h| h.value().clone());
        let outcome = self
            .handler_breaker
            .call(async {
                match handler {
                    Some(handler) => handler.handle(&message.user_id, &message.payload).await,
                    None => Err(HandlerError::NotFound(message.message_type.clone())),
                }
            })
            .await;

        match outcome {
            Ok(()) => self.complete(&mut message).await,
            Err(CallError::Open { .. }) => {
                self.handle_failure(message, "circuit breaker open", "CircuitBreakerOpen", false)
                    .await
            }
            Err(CallError::Timeout { after, .. }) => {
                let error = format!("handler timed out after {after:?}");
                self.handle_failure(message, &error, "Timeout", false).await
            }
            Err(CallError::Inner(e)) => {
                let permanent =
                    matches!(e, HandlerError::NotFound(_)) && self.settings.fail_fast_on_missing_handler;
                self.handle_failure(message, &e.to_string(), e.kind(), permanent).await
            }
        }
    }

    async fn complete(&self, message: &mut QueuedMessage) {
        message.status = MessageStatus::Completed;
        self.in_flight.remove(&message.id);
        self.completed.fetch_add(1, Ordering::Relaxed);
        metrics::record_processed(&message.message_type, "completed");

        if let Err(e) = self.storage.delete(&self.keys.message(&message.id)).await {
            tracing::warn!(message_id = %message.id, error = %e, "Failed to drop state of completed message");
        }
        tracing::debug!(
            message_id = %message.id,
            message_type = %message.message_type,
            retry_count = message.retry_count,
            "Message completed"
        );
    }

    /// Retry with backoff, or quarantine once the budget is spent.
    pub(crate) async fn handle_failure(
        &self,
        mut message: QueuedMessage,
        error: &str,
        error_type: &str,
        permanent: bool,
    ) {
        message.record_attempt_failure(error, error_type);
        tracing::warn!(
            message_id = %message.id,
            message_type = %message.message_type,
            retry_count = message.retry_count,
            error_type,
            user_id = %message.user_id,
            error,
            "Message processing failed"
        );

        if !permanent && message.should_retry() {
            let delay = message.schedule_retry();
            metrics::record_processed(&message.message_type, "retrying");
            let result = self.persist_retry(&message).await;
            self.in_flight.remove(&message.id);
            match result {
                Ok(()) => tracing::debug!(
                    message_id = %message.id,
                    retry_count = message.retry_count,
                    delay_ms = delay.as_millis() as u64,
                    "Retry scheduled"
                ),
                Err(e) => self.divert(message, BufferAction::ScheduleRetry, &e),
            }
        } else {
            message.mark_exhausted();
            metrics::record_processed(&message.message_type, "exhausted");
            let result = self.quarantine(&message, error).await;
            self.in_flight.remove(&message.id);
            match result {
                Ok(entry) => self.notify(&entry).await,
                Err(e) => self.divert(
                    message,
                    BufferAction::DeadLetter {
                        final_error: error.to_string(),
                    },
                    &e,
                ),
            }
        }
    }

    /// Move to the dead letter store and fire the notifier.
    pub(crate) async fn dead_letter(&self, message: &QueuedMessage, final_error: &str) -> StorageResult<()> {
        let entry = self.quarantine(message, final_error).await?;
        self.notify(&entry).await;
        Ok(())
    }

    async fn quarantine(&self, message: &QueuedMessage, final_error: &str) -> StorageResult<DeadLetterEntry> {
        let entry = self.dead_letters.store(message, final_error).await?;
        if let Err(e) = self.storage.delete(&self.keys.message(&message.id)).await {
            tracing::warn!(message_id = %message.id, error = %e, "Failed to drop state of dead-lettered message");
        }
        Ok(entry)
    }

    async fn notify(&self, entry: &DeadLetterEntry) {
        match tokio::time::timeout(NOTIFY_TIMEOUT, self.notifier.notify(entry)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(message_id = %entry.id(), error = %e, "Failure notification failed"),
            Err(_) => tracing::warn!(message_id = %entry.id(), "Failure notification timed out"),
        }
    }

    /// Hand a message to the retry buffer after a storage failure.
    pub(crate) fn divert(&self, message: QueuedMessage, action: BufferAction, cause: &StorageError) {
        tracing::warn!(
            message_id = %message.id,
            message_type = %message.message_type,
            action = action.as_str(),
            error = %cause,
            "Storage unavailable, message held in retry buffer"
        );
        metrics::record_buffered(action.as_str());
        self.buffer.insert(message, action);
    }

    /// Return every message a stopped task was holding to the pending lists.
    ///
    /// Covers popped ids still being loaded, retries claimed but not yet
    /// pushed, and messages in flight.
    pub(crate) async fn requeue_in_flight(&self) -> usize {
        let mut requeued = 0;

        let popped: Vec<String> = self.popped.iter().map(|r| r.key().clone()).collect();
        for id in popped {
            if let Some((id, priority)) = self.popped.remove(&id) {
                self.return_id(id, priority).await;
                requeued += 1;
            }
        }

        let promoting: Vec<String> = self.promoting.iter().map(|r| r.key().clone()).collect();
        for id in promoting {
            if let Some((_, message)) = self.promoting.remove(&id) {
                self.enqueue(message).await;
                requeued += 1;
            }
        }

        let ids: Vec<String> = self.in_flight.iter().map(|r| r.key().clone()).collect();
        for id in ids {
            if let Some((_, message)) = self.in_flight.remove(&id) {
                self.enqueue(message).await;
                requeued += 1;
            }
        }
        requeued
    }
}
