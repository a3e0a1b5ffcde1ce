//! Dead letter store.
//!
//! # Responsibilities
//! - Persist full snapshots of terminally failed messages
//! - Maintain a recency index for most-recent-first listing
//! - Remove entries when they are reprocessed
//!
//! # Design Decisions
//! - Snapshot and index are written as one logical unit: if the index write
//!   fails, the snapshot is rolled back and the caller sees the error
//! - Entries are kept until explicitly removed (no capacity eviction)

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::observability::metrics;
use crate::queue::message::{now_millis, MessageStatus, QueuedMessage, RetryAttempt};
use crate::storage::{KeySpace, StorageBackend, StorageResult};

/// Quarantined message with failure context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub message: QueuedMessage,
    pub final_error: String,
    /// Unix millis.
    pub moved_to_dlq_at: u64,
    /// Time from creation to quarantine.
    pub total_processing_time_ms: u64,
    pub retry_history: Vec<RetryAttempt>,
}

impl DeadLetterEntry {
    pub fn id(&self) -> &str {
        &self.message.id
    }
}

/// Durable, indexed quarantine backed by the storage backend.
#[derive(Clone)]
pub struct DeadLetterStore {
    storage: Arc<dyn StorageBackend>,
    keys: KeySpace,
}

impl DeadLetterStore {
    pub fn new(storage: Arc<dyn StorageBackend>, keys: KeySpace) -> Self {
        Self { storage, keys }
    }

    /// Snapshot `message` into the store.
    pub async fn store(&self, message: &QueuedMessage, final_error: &str) -> StorageResult<DeadLetterEntry> {
        let moved_to_dlq_at = now_millis();
        let mut snapshot = message.clone();
        snapshot.status = MessageStatus::DeadLetter;
        snapshot.permanent_failure = true;

        let entry = DeadLetterEntry {
            retry_history: snapshot.retry_history.clone(),
            total_processing_time_ms: moved_to_dlq_at.saturating_sub(snapshot.created_at),
            message: snapshot,
            final_error: final_error.to_string(),
            moved_to_dlq_at,
        };

        let key = self.keys.dead_letter(entry.id());
        self.storage.set(&key, serde_json::to_string(&entry)?).await?;

        if let Err(e) = self
            .storage
            .zadd(&self.keys.dead_letter_index(), entry.id(), moved_to_dlq_at as f64)
            .await
        {
            if let Err(rollback) = self.storage.delete(&key).await {
                tracing::error!(
                    message_id = %entry.id(),
                    error = %rollback,
                    "Failed to roll back dead letter snapshot"
                );
            }
            return Err(e);
        }

        metrics::record_dead_lettered(&entry.message.message_type);
        tracing::debug!(message_id = %entry.id(), "Dead letter entry stored");
        Ok(entry)
    }

    /// Up to `limit` entries, most recent first.
    pub async fn get(&self, limit: usize) -> StorageResult<Vec<DeadLetterEntry>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let ids = self.storage.zrevrange(&self.keys.dead_letter_index(), 0, limit - 1).await?;
        let mut entries = Vec::with_capacity(ids.len());
        for id in ids {
            match self.load(&id).await? {
                Some(entry) => entries.push(entry),
                None => tracing::warn!(message_id = %id, "Dead letter index references missing snapshot"),
            }
        }
        Ok(entries)
    }

    /// Delete the snapshot and its index entry, returning the removed entry.
    pub async fn remove(&self, id: &str) -> StorageResult<Option<DeadLetterEntry>> {
        let Some(entry) = self.load(id).await? else {
            // Drop a dangling index record if one exists.
            self.storage.zrem(&self.keys.dead_letter_index(), id).await?;
            return Ok(None);
        };

        // Index first: until it is gone the entry stays listed and retryable.
        self.storage.zrem(&self.keys.dead_letter_index(), id).await?;
        if let Err(e) = self.storage.delete(&self.keys.dead_letter(id)).await {
            tracing::warn!(message_id = %id, error = %e, "Failed to delete unindexed dead letter snapshot");
        }
        Ok(Some(entry))
    }

    pub async fn len(&self) -> StorageResult<usize> {
        self.storage.zcard(&self.keys.dead_letter_index()).await
    }

    async fn load(&self, id: &str) -> StorageResult<Option<DeadLetterEntry>> {
        match self.storage.get(&self.keys.dead_letter(id)).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }
}
