//! Storage backend wrapped in the storage circuit breaker.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use crate::resilience::{CallError, CircuitBreaker};
use crate::storage::{StorageBackend, StorageError, StorageResult};

/// Every operation goes through one shared breaker, so a storage outage is
/// detected once and short-circuits all callers (queue, scheduler, DLQ).
#[derive(Clone)]
pub struct GuardedStorage {
    inner: Arc<dyn StorageBackend>,
    breaker: Arc<CircuitBreaker>,
}

impl GuardedStorage {
    pub fn new(inner: Arc<dyn StorageBackend>, breaker: Arc<CircuitBreaker>) -> Self {
        Self { inner, breaker }
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    async fn run<T, Fut>(&self, fut: Fut) -> StorageResult<T>
    where
        Fut: Future<Output = StorageResult<T>> + Send,
    {
        self.breaker.call(fut).await.map_err(|e| match e {
            CallError::Open { .. } => StorageError::CircuitOpen,
            CallError::Timeout { .. } => StorageError::Timeout,
            CallError::Inner(inner) => inner,
        })
    }
}

#[async_trait]
impl StorageBackend for GuardedStorage {
    async fn set(&self, key: &str, value: String) -> StorageResult<()> {
        self.run(self.inner.set(key, value)).await
    }

    async fn get(&self, key: &str) -> StorageResult<Option<String>> {
        self.run(self.inner.get(key)).await
    }

    async fn delete(&self, key: &str) -> StorageResult<bool> {
        self.run(self.inner.delete(key)).await
    }

    async fn push(&self, list: &str, value: String) -> StorageResult<()> {
        self.run(self.inner.push(list, value)).await
    }

    async fn pop(&self, list: &str) -> StorageResult<Option<String>> {
        self.run(self.inner.pop(list)).await
    }

    async fn list_len(&self, list: &str) -> StorageResult<usize> {
        self.run(self.inner.list_len(list)).await
    }

    async fn zadd(&self, set: &str, member: &str, score: f64) -> StorageResult<()> {
        self.run(self.inner.zadd(set, member, score)).await
    }

    async fn zrange_by_score(&self, set: &str, min: f64, max: f64, limit: usize) -> StorageResult<Vec<String>> {
        self.run(self.inner.zrange_by_score(set, min, max, limit)).await
    }

    async fn zrevrange(&self, set: &str, start: usize, stop: usize) -> StorageResult<Vec<String>> {
        self.run(self.inner.zrevrange(set, start, stop)).await
    }

    async fn zrem(&self, set: &str, member: &str) -> StorageResult<bool> {
        self.run(self.inner.zrem(set, member)).await
    }

    async fn zcard(&self, set: &str) -> StorageResult<usize> {
        self.run(self.inner.zcard(set)).await
    }

    async fn ping(&self) -> StorageResult<()> {
        self.run(self.inner.ping()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::{CircuitBreakerConfig, CircuitBreakerState};
    use crate::storage::InMemoryStorage;
    use std::time::Duration;

    fn guarded(threshold: u32) -> (Arc<InMemoryStorage>, GuardedStorage) {
        let memory = Arc::new(InMemoryStorage::new());
        let breaker = Arc::new(CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: threshold,
            recovery_timeout: Duration::from_secs(60),
            ..CircuitBreakerConfig::named("storage")
        }));
        (memory.clone(), GuardedStorage::new(memory, breaker))
    }

    #[tokio::test]
    async fn test_passes_through_and_records_success() {
        let (_, storage) = guarded(2);
        storage.set("k", "v".into()).await.unwrap();
        assert_eq!(storage.get("k").await.unwrap().as_deref(), Some("v"));
        assert_eq!(storage.breaker().get_status().metrics.successful_calls, 2);
    }

    #[tokio::test]
    async fn test_outage_opens_breaker_and_short_circuits() {
        let (memory, storage) = guarded(2);
        memory.set_available(false);

        assert!(matches!(storage.ping().await, Err(StorageError::Backend(_))));
        assert!(matches!(storage.ping().await, Err(StorageError::Backend(_))));
        assert_eq!(storage.breaker().state(), CircuitBreakerState::Open);

        let before = memory.operation_count();
        assert!(matches!(storage.ping().await, Err(StorageError::CircuitOpen)));
        assert_eq!(memory.operation_count(), before, "open breaker must not touch storage");
    }
}
