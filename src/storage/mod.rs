//! Storage backend subsystem.
//!
//! # Data Flow
//! ```text
//! MessageQueue / DeadLetterStore
//!     → guarded.rs (storage circuit breaker + per-call timeout)
//!     → StorageBackend impl (memory.rs in-process, or an external
//!       Redis-compatible service supplied by the embedding application)
//! ```
//!
//! # Key Layout
//! ```text
//! {prefix}:message:{id}        message state (JSON)
//! {prefix}:pending:{priority}  list of message ids awaiting a worker
//! {prefix}:retry               sorted set of RETRYING ids, score = next_retry_at
//! {prefix}:dlq:entry:{id}      dead letter snapshot (JSON)
//! {prefix}:dlq:index           sorted set of dead letter ids, score = moved_to_dlq_at
//! ```
//!
//! # Design Decisions
//! - Values are opaque strings; (de)serialization belongs to the callers
//! - Lists are pushed on the left and popped on the right (FIFO)
//! - Every operation may suspend (network I/O in real backends)

pub mod guarded;
pub mod memory;

use async_trait::async_trait;

pub use guarded::GuardedStorage;
pub use memory::{InMemoryStorage, StorageOp};

/// Storage operation failure.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("storage circuit breaker is open")]
    CircuitOpen,

    #[error("storage operation timed out")]
    Timeout,

    #[error("storage backend error: {0}")]
    Backend(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Convenience alias for storage results.
pub type StorageResult<T> = Result<T, StorageError>;

/// Key-value / list / sorted-set store used for queue state.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    async fn set(&self, key: &str, value: String) -> StorageResult<()>;
    async fn get(&self, key: &str) -> StorageResult<Option<String>>;
    /// Returns true if the key existed.
    async fn delete(&self, key: &str) -> StorageResult<bool>;

    /// Push onto the head of a list.
    async fn push(&self, list: &str, value: String) -> StorageResult<()>;
    /// Pop from the tail of a list.
    async fn pop(&self, list: &str) -> StorageResult<Option<String>>;
    async fn list_len(&self, list: &str) -> StorageResult<usize>;

    async fn zadd(&self, set: &str, member: &str, score: f64) -> StorageResult<()>;
    /// Members with `min <= score <= max`, ascending, at most `limit`.
    async fn zrange_by_score(&self, set: &str, min: f64, max: f64, limit: usize) -> StorageResult<Vec<String>>;
    /// Members by descending score, ranks `start..=stop`.
    async fn zrevrange(&self, set: &str, start: usize, stop: usize) -> StorageResult<Vec<String>>;
    /// Returns true if the member existed.
    async fn zrem(&self, set: &str, member: &str) -> StorageResult<bool>;
    async fn zcard(&self, set: &str) -> StorageResult<usize>;

    async fn ping(&self) -> StorageResult<()>;
}

/// Builds namespaced storage keys.
#[derive(Debug, Clone)]
pub struct KeySpace {
    prefix: String,
}

impl KeySpace {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self { prefix: prefix.into() }
    }

    pub fn message(&self, id: &str) -> String {
        format!("{}:message:{}", self.prefix, id)
    }

    pub fn pending(&self, priority: crate::queue::MessagePriority) -> String {
        format!("{}:pending:{}", self.prefix, priority.as_str())
    }

    pub fn retry(&self) -> String {
        format!("{}:retry", self.prefix)
    }

    pub fn dead_letter(&self, id: &str) -> String {
        format!("{}:dlq:entry:{}", self.prefix, id)
    }

    pub fn dead_letter_index(&self) -> String {
        format!("{}:dlq:index", self.prefix)
    }
}

impl Default for KeySpace {
    fn default() -> Self {
        Self::new("queue")
    }
}
