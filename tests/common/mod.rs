//! Shared utilities for queue integration tests.

#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use resilient_queue::config::ServiceConfig;
use resilient_queue::queue::MessageQueue;
use resilient_queue::resilience::CircuitBreakerRegistry;
use resilient_queue::storage::InMemoryStorage;

/// Millisecond-scale timings so retries and drains happen inside a test.
pub fn fast_config() -> ServiceConfig {
    let mut config = ServiceConfig::default();
    config.queue.poll_interval_ms = 5;
    config.queue.retry_scan_interval_ms = 10;
    config.queue.buffer_drain_interval_ms = 20;
    config.queue.shutdown_timeout_ms = 1_000;
    config.retry.base_delay_ms = 10;
    config.retry.max_delay_ms = 40;
    config.storage_breaker.recovery_timeout_ms = 100;
    config.storage_breaker.timeout_ms = 500;
    config.handler_breaker.failure_threshold = 1_000;
    config.handler_breaker.recovery_timeout_ms = 100;
    config.handler_breaker.timeout_ms = 1_000;
    config
}

pub struct Harness {
    pub storage: Arc<InMemoryStorage>,
    pub registry: CircuitBreakerRegistry,
    pub queue: MessageQueue,
}

pub fn harness(config: &ServiceConfig) -> Harness {
    let storage = Arc::new(InMemoryStorage::new());
    let registry = CircuitBreakerRegistry::new();
    let queue = MessageQueue::new(storage.clone(), &registry, config);
    Harness {
        storage,
        registry,
        queue,
    }
}

/// Poll `condition` until it holds or `timeout` elapses.
pub async fn wait_until<F, Fut>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
