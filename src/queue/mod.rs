//! Resilient message queue subsystem.
//!
//! # Data Flow
//! ```text
//! enqueue(message)
//!     → storage breaker permits?  yes → pending list ({prefix}:pending:{priority})
//!                                 no  → buffer.rs (circuit breaker retry buffer)
//!
//! worker.rs (N tasks)
//!     → pop pending id → in-flight set
//!     → handler breaker permits? → handler(user_id, payload)
//!         success → COMPLETED, state dropped
//!         failure → retry budget left?  yes → RETRYING, retry index (scheduler.rs)
//!                                       no  → dead_letter.rs (+ notifier.rs)
//!
//! scheduler.rs: retry index (score <= now) → pending list
//! buffer.rs:    storage recovered → replay buffered write
//! ```
//!
//! # Design Decisions
//! - At-least-once: a message is only dropped after a successful handler run
//!   or after it is safely in the dead letter store
//! - `enqueue` never fails; storage trouble is absorbed by the buffer
//! - Background tasks are owned by the queue and joined on `stop_processing`

mod dispatch;
pub mod buffer;
pub mod dead_letter;
pub mod handler;
pub mod message;
pub mod notifier;
mod scheduler;
mod worker;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use futures_util::future::join_all;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::config::ServiceConfig;
use crate::lifecycle::Shutdown;
use crate::resilience::{CircuitBreaker, CircuitBreakerRegistry, CircuitBreakerStatus};
use crate::storage::{GuardedStorage, KeySpace, StorageBackend, StorageError};

use self::buffer::{BufferDrainer, CircuitBreakerRetryBuffer};
use self::dispatch::QueueCore;
use self::scheduler::RetryScheduler;

pub use self::dead_letter::{DeadLetterEntry, DeadLetterStore};
pub use self::handler::{handler_fn, FnHandler, HandlerError, MessageHandler};
pub use self::message::{MessagePriority, MessageStatus, Payload, QueuedMessage, RetryAttempt};
pub use self::notifier::{FailureNotifier, LogNotifier};

/// Breaker guarding the storage backend.
pub const STORAGE_BREAKER: &str = "queue_storage";
/// Breaker guarding handler execution.
pub const HANDLER_BREAKER: &str = "queue_handlers";

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("queue processing is already running")]
    AlreadyRunning,

    #[error("worker count must be at least 1")]
    NoWorkers,

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Queue depth snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub pending: usize,
    pub retrying: usize,
    pub in_flight: usize,
    pub buffered: usize,
    pub dead_letters: usize,
    pub completed: u64,
}

struct Running {
    shutdown: Shutdown,
    tasks: Vec<JoinHandle<()>>,
}

/// Prioritized, self-healing, at-least-once queue with per-type handlers.
pub struct MessageQueue {
    core: Arc<QueueCore>,
    running: Mutex<Option<Running>>,
}

impl MessageQueue {
    /// Build a queue over `storage`, taking its two breakers from `registry`.
    pub fn new(storage: Arc<dyn StorageBackend>, registry: &CircuitBreakerRegistry, config: &ServiceConfig) -> Self {
        let storage_breaker = registry.get_or_create(
            STORAGE_BREAKER,
            Some(config.storage_breaker.to_breaker_config(STORAGE_BREAKER)),
        );
        let handler_breaker = registry.get_or_create(
            HANDLER_BREAKER,
            Some(config.handler_breaker.to_breaker_config(HANDLER_BREAKER)),
        );

        let keys = KeySpace::new(config.queue.key_prefix.clone());
        let guarded = GuardedStorage::new(storage, storage_breaker);
        let dead_letters = DeadLetterStore::new(Arc::new(guarded.clone()), keys.clone());

        let core = QueueCore {
            storage: guarded,
            keys,
            handler_breaker,
            handlers: DashMap::new(),
            dead_letters,
            buffer: CircuitBreakerRetryBuffer::new(),
            in_flight: DashMap::new(),
            popped: DashMap::new(),
            promoting: DashMap::new(),
            notifier: Arc::new(LogNotifier),
            settings: config.queue.clone(),
            retry: config.retry.clone(),
            completed: AtomicU64::new(0),
        };

        Self {
            core: Arc::new(core),
            running: Mutex::new(None),
        }
    }

    /// Replace the dead letter notifier. Only valid before processing starts.
    pub fn with_notifier(mut self, notifier: Arc<dyn FailureNotifier>) -> Self {
        match Arc::get_mut(&mut self.core) {
            Some(core) => core.notifier = notifier,
            None => tracing::warn!("Queue already shared, notifier not replaced"),
        }
        self
    }

    /// Associate a handler with a message type. Last registration wins.
    pub fn register_handler(&self, message_type: impl Into<String>, handler: impl MessageHandler + 'static) {
        let message_type = message_type.into();
        if self
            .core
            .handlers
            .insert(message_type.clone(), Arc::new(handler))
            .is_some()
        {
            tracing::info!(message_type = %message_type, "Message handler replaced");
        } else {
            tracing::debug!(message_type = %message_type, "Message handler registered");
        }
    }

    /// New PENDING message using the configured retry policy.
    pub fn new_message(&self, user_id: &str, message_type: &str, payload: Payload) -> QueuedMessage {
        self.core.new_message(user_id, message_type, payload)
    }

    /// Accept a message for delivery. Always returns true: when storage is
    /// unavailable the message waits in the retry buffer instead.
    pub async fn enqueue(&self, message: QueuedMessage) -> bool {
        self.core.enqueue(message).await;
        true
    }

    /// Start `worker_count` workers plus the retry scheduler and buffer drainer.
    pub async fn process_queue(&self, worker_count: usize) -> Result<(), QueueError> {
        if worker_count == 0 {
            return Err(QueueError::NoWorkers);
        }

        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(QueueError::AlreadyRunning);
        }

        let shutdown = Shutdown::new();
        let mut tasks = Vec::with_capacity(worker_count + 2);
        for worker_id in 0..worker_count {
            tasks.push(tokio::spawn(worker::run(self.core.clone(), worker_id, shutdown.subscribe())));
        }

        let scheduler = RetryScheduler::new(self.core.clone());
        tasks.push(tokio::spawn(scheduler.run(shutdown.subscribe())));

        let drainer = BufferDrainer::new(self.core.clone());
        tasks.push(tokio::spawn(drainer.run(shutdown.subscribe())));

        tracing::info!(workers = worker_count, "Queue processing started");
        *running = Some(Running { shutdown, tasks });
        Ok(())
    }

    /// Stop every worker and background loop and wait for them to exit.
    ///
    /// Tasks that outlive the configured shutdown timeout are aborted; any
    /// message they left in flight goes back to the pending lists.
    pub async fn stop_processing(&self) {
        let Some(Running { shutdown, mut tasks }) = self.running.lock().await.take() else {
            tracing::debug!("Queue processing not running, nothing to stop");
            return;
        };

        shutdown.trigger();
        let timeout = self.core.settings.shutdown_timeout();
        if tokio::time::timeout(timeout, join_all(tasks.iter_mut())).await.is_err() {
            tracing::warn!(timeout = ?timeout, "Queue tasks did not stop in time, aborting");
            for task in &tasks {
                task.abort();
            }
            for task in tasks {
                let _ = task.await;
            }
        }

        let requeued = self.core.requeue_in_flight().await;
        if requeued > 0 {
            tracing::warn!(requeued, "Returned in-flight messages to the queue");
        }
        tracing::info!("Queue processing stopped");
    }

    pub async fn is_processing(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// Dead letter entries, most recent first.
    pub async fn get_dead_letter_queue_messages(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, QueueError> {
        Ok(self.core.dead_letters.get(limit).await?)
    }

    /// Move a dead-lettered message back into the queue as a fresh attempt.
    /// Returns false if no entry exists for `id`.
    pub async fn reprocess_dead_letter_message(&self, id: &str) -> Result<bool, QueueError> {
        let Some(entry) = self.core.dead_letters.remove(id).await? else {
            return Ok(false);
        };

        let mut message = entry.message;
        message.reset_for_reprocessing();
        tracing::info!(
            message_id = %message.id,
            message_type = %message.message_type,
            "Reprocessing dead letter message"
        );
        self.core.enqueue(message).await;
        Ok(true)
    }

    pub async fn stats(&self) -> Result<QueueStats, QueueError> {
        let core = &self.core;
        let mut pending = 0;
        for priority in MessagePriority::ALL {
            pending += core.storage.list_len(&core.keys.pending(priority)).await?;
        }

        Ok(QueueStats {
            pending,
            retrying: core.storage.zcard(&core.keys.retry()).await?,
            in_flight: core.in_flight.len(),
            buffered: core.buffer.len(),
            dead_letters: core.dead_letters.len().await?,
            completed: core.completed.load(Ordering::Relaxed),
        })
    }

    pub fn storage_breaker(&self) -> &Arc<CircuitBreaker> {
        self.core.storage.breaker()
    }

    pub fn handler_breaker(&self) -> &Arc<CircuitBreaker> {
        &self.core.handler_breaker
    }

    pub fn breaker_statuses(&self) -> Vec<CircuitBreakerStatus> {
        vec![self.storage_breaker().get_status(), self.handler_breaker().get_status()]
    }

    pub fn buffered_count(&self) -> usize {
        self.core.buffer.len()
    }

    pub fn in_flight_count(&self) -> usize {
        self.core.in_flight.len()
    }
}
