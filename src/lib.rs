//! Resilient message queue library.
//!
//! Prioritized at-least-once delivery with exponential-backoff retries, a
//! dead letter store, and circuit breakers around both the storage backend
//! and handler execution.

pub mod config;
pub mod lifecycle;
pub mod observability;
pub mod queue;
pub mod resilience;
pub mod storage;

pub use config::ServiceConfig;
pub use lifecycle::Shutdown;
pub use queue::{MessageQueue, QueueError, QueuedMessage};
pub use resilience::{CircuitBreaker, CircuitBreakerRegistry};
pub use storage::{InMemoryStorage, StorageBackend};
