//! Circuit breaker retry buffer.
//!
//! # Responsibilities
//! - Hold messages whose storage write failed (breaker open or backend error)
//! - Hold popped pending ids that could not be pushed back
//! - Periodically re-attempt the write once the storage breaker permits it
//!
//! # Design Decisions
//! - Keyed by message id, so a message is buffered at most once
//! - Each entry remembers which write failed, so draining resumes the
//!   original routing (enqueue, retry scheduling or dead-lettering)
//! - An entry leaves the buffer only after its write succeeded; a drainer
//!   aborted mid-write leaves it in place
//! - The drainer peeks at the breaker (`would_permit`) and never consumes a
//!   half-open probe on its own; the first real write is the probe

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::time;

use crate::lifecycle::ShutdownSignal;
use crate::observability::metrics;
use crate::queue::dispatch::QueueCore;
use crate::queue::message::{MessagePriority, MessageStatus, QueuedMessage};
use crate::storage::{StorageBackend, StorageResult};

/// Which write is pending for a buffered message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BufferAction {
    Enqueue,
    ScheduleRetry,
    DeadLetter { final_error: String },
}

impl BufferAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            BufferAction::Enqueue => "enqueue",
            BufferAction::ScheduleRetry => "schedule_retry",
            BufferAction::DeadLetter { .. } => "dead_letter",
        }
    }
}

#[derive(Debug, Clone)]
pub struct BufferedMessage {
    pub message: QueuedMessage,
    pub action: BufferAction,
    /// Insertion stamp; a replay only clears the entry it started from.
    seq: u64,
}

/// Pending id whose state is still stored but whose list entry was lost.
#[derive(Debug, Clone, Copy)]
struct StrandedId {
    priority: MessagePriority,
    seq: u64,
}

/// In-memory holding area for messages that could not be persisted.
#[derive(Default)]
pub struct CircuitBreakerRetryBuffer {
    entries: DashMap<String, BufferedMessage>,
    stranded: DashMap<String, StrandedId>,
    next_seq: AtomicU64,
}

impl CircuitBreakerRetryBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, message: QueuedMessage, action: BufferAction) {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        self.entries
            .insert(message.id.clone(), BufferedMessage { message, action, seq });
        self.report_size();
    }

    /// Hold a bare pending id until it can be pushed back onto its list.
    pub fn insert_id(&self, id: String, priority: MessagePriority) {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        self.stranded.insert(id, StrandedId { priority, seq });
        self.report_size();
    }

    /// Copy of the entry for `id`, left in place.
    pub fn get(&self, id: &str) -> Option<BufferedMessage> {
        self.entries.get(id).map(|r| r.value().clone())
    }

    pub fn take(&self, id: &str) -> Option<BufferedMessage> {
        let taken = self.entries.remove(id).map(|(_, entry)| entry);
        self.report_size();
        taken
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id) || self.stranded.contains_key(id)
    }

    /// Ids of buffered messages (stranded ids excluded).
    pub fn ids(&self) -> Vec<String> {
        self.entries.iter().map(|r| r.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len() + self.stranded.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.stranded.is_empty()
    }

    /// Remove `entry` unless it was replaced while its write was running.
    fn settle(&self, id: &str, entry: &BufferedMessage) -> bool {
        let removed = self.entries.remove_if(id, |_, current| current.seq == entry.seq).is_some();
        self.report_size();
        removed
    }

    fn stranded_ids(&self) -> Vec<(String, StrandedId)> {
        self.stranded.iter().map(|r| (r.key().clone(), *r.value())).collect()
    }

    fn settle_id(&self, id: &str, stranded: StrandedId) {
        self.stranded.remove_if(id, |_, current| current.seq == stranded.seq);
        self.report_size();
    }

    fn report_size(&self) {
        metrics::set_buffer_size(self.len());
    }
}

/// Background loop draining the retry buffer.
pub(crate) struct BufferDrainer {
    core: Arc<QueueCore>,
    interval: Duration,
}

impl BufferDrainer {
    pub(crate) fn new(core: Arc<QueueCore>) -> Self {
        let interval = core.settings.buffer_drain_interval();
        Self { core, interval }
    }

    pub(crate) async fn run(self, mut shutdown: ShutdownSignal) {
        tracing::info!(interval = ?self.interval, "Retry buffer drainer starting");

        let mut ticker = time::interval(self.interval);
        ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.drain().await;
                }
                _ = shutdown.recv() => {
                    tracing::info!("Retry buffer drainer received shutdown signal, exiting loop");
                    break;
                }
            }
        }
    }

    /// Re-attempt every buffered write. Returns how many left the buffer.
    pub(crate) async fn drain(&self) -> usize {
        let buffer = &self.core.buffer;
        if buffer.is_empty() || !self.core.storage.breaker().would_permit() {
            return 0;
        }

        let mut drained = 0;
        for (id, stranded) in buffer.stranded_ids() {
            let list = self.core.keys.pending(stranded.priority);
            if let Err(e) = self.core.storage.push(&list, id.clone()).await {
                tracing::debug!(message_id = %id, error = %e, "Storage still unavailable, keeping pending id buffered");
                return drained;
            }
            buffer.settle_id(&id, stranded);
            drained += 1;
            tracing::debug!(message_id = %id, "Stranded pending id restored");
        }

        for id in buffer.ids() {
            let Some(entry) = buffer.get(&id) else {
                continue;
            };

            if let Err(e) = self.replay(&entry).await {
                tracing::debug!(message_id = %id, error = %e, "Storage still unavailable, keeping message buffered");
                break;
            }
            if buffer.settle(&id, &entry) {
                drained += 1;
            }
            tracing::debug!(message_id = %id, action = entry.action.as_str(), "Buffered message persisted");
        }

        if drained > 0 {
            tracing::info!(drained, remaining = buffer.len(), "Retry buffer drained");
        }
        drained
    }

    async fn replay(&self, entry: &BufferedMessage) -> StorageResult<()> {
        match &entry.action {
            BufferAction::Enqueue => {
                let mut message = entry.message.clone();
                message.status = MessageStatus::Pending;
                self.core.persist_pending(&message).await?;
                metrics::record_enqueued(&message.message_type, message.priority);
                Ok(())
            }
            BufferAction::ScheduleRetry => self.core.persist_retry(&entry.message).await,
            BufferAction::DeadLetter { final_error } => self.core.dead_letter(&entry.message, final_error).await,
        }
    }
}
