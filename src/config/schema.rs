//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the queue
//! service. All types derive Serde traits for deserialization from config files.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::resilience::CircuitBreakerConfig;

/// Root configuration for the queue service.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Worker pool and background loop settings.
    pub queue: QueueSettings,

    /// Default retry policy for new messages.
    pub retry: RetrySettings,

    /// Breaker guarding the storage backend.
    pub storage_breaker: BreakerSettings,

    /// Breaker guarding handler execution.
    pub handler_breaker: BreakerSettings,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            queue: QueueSettings::default(),
            retry: RetrySettings::default(),
            storage_breaker: BreakerSettings::default(),
            // Handlers run user code; give them a longer budget than storage calls.
            handler_breaker: BreakerSettings {
                timeout_ms: 30_000,
                ..BreakerSettings::default()
            },
            observability: ObservabilityConfig::default(),
        }
    }
}

/// Queue processing configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct QueueSettings {
    /// Number of concurrent workers started by the binary.
    pub worker_count: usize,

    /// Idle sleep between empty polls in milliseconds.
    pub poll_interval_ms: u64,

    /// Retry index scan period in milliseconds.
    pub retry_scan_interval_ms: u64,

    /// Maximum due retries promoted per scan.
    pub retry_scan_batch: usize,

    /// Retry buffer drain period in milliseconds.
    pub buffer_drain_interval_ms: u64,

    /// How long `stop_processing` waits before aborting tasks.
    pub shutdown_timeout_ms: u64,

    /// Prefix for every storage key.
    pub key_prefix: String,

    /// Dead-letter messages whose type has no handler instead of retrying them.
    pub fail_fast_on_missing_handler: bool,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            worker_count: 4,
            poll_interval_ms: 100,
            retry_scan_interval_ms: 1_000,
            retry_scan_batch: 100,
            buffer_drain_interval_ms: 5_000,
            shutdown_timeout_ms: 30_000,
            key_prefix: "queue".to_string(),
            fail_fast_on_missing_handler: false,
        }
    }
}

impl QueueSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn retry_scan_interval(&self) -> Duration {
        Duration::from_millis(self.retry_scan_interval_ms)
    }

    pub fn buffer_drain_interval(&self) -> Duration {
        Duration::from_millis(self.buffer_drain_interval_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

/// Retry configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Maximum number of retry attempts after the first failure.
    pub max_retries: u32,

    /// Base delay for exponential backoff in milliseconds.
    pub base_delay_ms: u64,

    /// Maximum delay for exponential backoff in milliseconds.
    pub max_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
        }
    }
}

impl RetrySettings {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

/// Circuit breaker configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BreakerSettings {
    /// Consecutive failures before the circuit opens.
    pub failure_threshold: u32,

    /// Time spent OPEN before a probe is allowed, in milliseconds.
    pub recovery_timeout_ms: u64,

    /// Per-call timeout in milliseconds.
    pub timeout_ms: u64,

    /// Concurrent probes admitted while HALF_OPEN.
    pub half_open_max_calls: u32,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout_ms: 30_000,
            timeout_ms: 10_000,
            half_open_max_calls: 1,
        }
    }
}

impl BreakerSettings {
    pub fn to_breaker_config(&self, name: &str) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            name: name.to_string(),
            failure_threshold: self.failure_threshold,
            recovery_timeout: Duration::from_millis(self.recovery_timeout_ms),
            timeout: Duration::from_millis(self.timeout_ms),
            half_open_max_calls: self.half_open_max_calls,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Log output format.
    pub log_format: LogFormat,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}
