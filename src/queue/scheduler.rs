//! Retry scheduler.
//!
//! # Responsibilities
//! - Periodically scan the retry index for messages whose backoff has elapsed
//! - Move due messages back onto their pending list
//!
//! # Design Decisions
//! - Sole recovery path for RETRYING messages: scan errors are logged and the
//!   loop keeps going
//! - A message is claimed by removing it from the retry index before it is
//!   pushed, so a fast re-failure cannot race with the claim
//! - A claimed message is held in `QueueCore::promoting` until the push
//!   lands; a scheduler stopped mid-push leaves it there for requeueing
//! - `is_retry_ready` is re-checked against the stored state, never just the
//!   index score

use std::sync::Arc;
use std::time::Duration;

use tokio::time;

use crate::lifecycle::ShutdownSignal;
use crate::observability::metrics;
use crate::queue::buffer::BufferAction;
use crate::queue::dispatch::QueueCore;
use crate::queue::message::now_millis;
use crate::storage::{StorageBackend, StorageError, StorageResult};

pub(crate) struct RetryScheduler {
    core: Arc<QueueCore>,
    interval: Duration,
    batch: usize,
}

impl RetryScheduler {
    pub(crate) fn new(core: Arc<QueueCore>) -> Self {
        let interval = core.settings.retry_scan_interval();
        let batch = core.settings.retry_scan_batch.max(1);
        Self { core, interval, batch }
    }

    pub(crate) async fn run(self, mut shutdown: ShutdownSignal) {
        tracing::info!(interval = ?self.interval, batch = self.batch, "Retry scheduler starting");

        let mut ticker = time::interval(self.interval);
        ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.promote_due().await {
                        Ok(0) => {}
                        Ok(promoted) => tracing::debug!(promoted, "Promoted due retries"),
                        Err(StorageError::CircuitOpen) => {
                            tracing::debug!("Retry scan skipped, storage circuit open");
                        }
                        Err(e) => tracing::error!(error = %e, "Retry scan failed"),
                    }
                }
                _ = shutdown.recv() => {
                    tracing::info!("Retry scheduler received shutdown signal, exiting loop");
                    break;
                }
            }
        }
    }

    /// Push every due RETRYING message back onto its pending list.
    pub(crate) async fn promote_due(&self) -> StorageResult<usize> {
        let core = &self.core;
        let retry_set = core.keys.retry();
        let due = core
            .storage
            .zrange_by_score(&retry_set, 0.0, now_millis() as f64, self.batch)
            .await?;

        let mut promoted = 0;
        for id in due {
            let message = match core.load_message(&id).await {
                Ok(Some(message)) => message,
                Ok(None) => {
                    tracing::warn!(message_id = %id, "Retry index references missing message, dropping");
                    core.storage.zrem(&retry_set, &id).await?;
                    continue;
                }
                Err(StorageError::Serialization(e)) => {
                    tracing::error!(
                        message_id = %id,
                        error = %e,
                        "Undecodable retry state, dropping id from retry index"
                    );
                    core.storage.zrem(&retry_set, &id).await?;
                    continue;
                }
                Err(e) => {
                    tracing::warn!(message_id = %id, error = %e, "Failed to load retrying message");
                    continue;
                }
            };

            if !message.is_retry_ready() {
                continue;
            }
            if !core.storage.zrem(&retry_set, &id).await? {
                continue;
            }

            core.promoting.insert(id.clone(), message.clone());

            let pushed = core.storage.push(&core.keys.pending(message.priority), id.clone()).await;
            core.promoting.remove(&id);
            if let Err(e) = pushed {
                core.divert(message, BufferAction::ScheduleRetry, &e);
                continue;
            }

            tracing::debug!(
                message_id = %id,
                retry_count = message.retry_count,
                "Retry due, message resubmitted"
            );
            promoted += 1;
        }

        metrics::record_retries_promoted(promoted);
        Ok(promoted)
    }
}
