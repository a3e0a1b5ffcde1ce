//! Circuit breaker for protected resources.
//!
//! # States
//! - Closed: normal operation, calls pass through
//! - Open: resource assumed down, calls fail fast
//! - Half-Open: testing if resource recovered
//!
//! # State Transitions
//! ```text
//! Closed → Open: consecutive_failures >= failure_threshold
//! Open → Half-Open: after recovery timeout (probe granted)
//! Half-Open → Closed: probe call succeeds
//! Half-Open → Open: probe call fails
//! ```
//!
//! # Design Decisions
//! - One breaker per named resource (see registry.rs)
//! - Fail fast in Open state (no waiting for timeout)
//! - Limited probes in Half-Open (prevents hammering recovering resource)
//! - All state and counters live behind one mutex so metrics stay consistent

use std::fmt;
use std::future::Future;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;

use crate::observability::metrics;
use crate::queue::message::now_millis;

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitBreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitBreakerState {
    /// Gauge value (0=Closed, 1=Open, 2=HalfOpen).
    pub fn as_metric_value(self) -> f64 {
        match self {
            CircuitBreakerState::Closed => 0.0,
            CircuitBreakerState::Open => 1.0,
            CircuitBreakerState::HalfOpen => 2.0,
        }
    }
}

impl fmt::Display for CircuitBreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CircuitBreakerState::Closed => "closed",
            CircuitBreakerState::Open => "open",
            CircuitBreakerState::HalfOpen => "half_open",
        };
        f.write_str(s)
    }
}

/// Configuration for a single breaker.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Resource name, used for logging and registry lookup.
    pub name: String,
    /// Consecutive failures required to open the circuit (at least 1).
    pub failure_threshold: u32,
    /// Time to wait after the last failure before a probe is allowed.
    pub recovery_timeout: Duration,
    /// Budget for a single protected call made through [`CircuitBreaker::call`].
    pub timeout: Duration,
    /// Probes admitted while half-open.
    pub half_open_max_calls: u32,
}

impl CircuitBreakerConfig {
    /// Default settings for the given resource name.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
            timeout: Duration::from_secs(10),
            half_open_max_calls: 1,
        }
    }
}

/// Call statistics exposed through [`CircuitBreaker::get_status`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CircuitBreakerMetrics {
    pub total_calls: u64,
    pub successful_calls: u64,
    pub failed_calls: u64,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    /// Wall-clock time of the last failure (unix millis).
    pub last_failure_time: Option<u64>,
    /// Number of transitions into Open.
    pub circuit_breaker_opens: u64,
}

/// Point-in-time snapshot of a breaker.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerStatus {
    pub name: String,
    pub state: CircuitBreakerState,
    pub metrics: CircuitBreakerMetrics,
}

/// Error returned by a call made through a breaker.
#[derive(Debug, thiserror::Error)]
pub enum CallError<E> {
    #[error("circuit breaker '{name}' is open")]
    Open { name: String },

    #[error("call through circuit breaker '{name}' timed out after {after:?}")]
    Timeout { name: String, after: Duration },

    #[error(transparent)]
    Inner(E),
}

impl<E> CallError<E> {
    /// True if the breaker rejected the call without running it.
    pub fn is_open(&self) -> bool {
        matches!(self, CallError::Open { .. })
    }
}

struct Inner {
    state: CircuitBreakerState,
    metrics: CircuitBreakerMetrics,
    /// Monotonic twin of `metrics.last_failure_time`, used for recovery checks.
    last_failure: Option<Instant>,
    half_open_calls: u32,
    half_open_since: Option<Instant>,
}

/// Failure gate for one named resource.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        let config = CircuitBreakerConfig {
            failure_threshold: config.failure_threshold.max(1),
            half_open_max_calls: config.half_open_max_calls.max(1),
            ..config
        };
        Self {
            config,
            inner: Mutex::new(Inner {
                state: CircuitBreakerState::Closed,
                metrics: CircuitBreakerMetrics::default(),
                last_failure: None,
                half_open_calls: 0,
                half_open_since: None,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    pub fn state(&self) -> CircuitBreakerState {
        self.inner.lock().state
    }

    /// Check whether a call may proceed.
    ///
    /// An Open breaker whose recovery timeout has elapsed moves to Half-Open and
    /// grants the caller a probe. A granted probe must be followed by
    /// `record_success` or `record_failure`.
    pub fn can_execute(&self) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitBreakerState::Closed => true,
            CircuitBreakerState::Open => {
                if self.recovery_elapsed(inner.last_failure) {
                    inner.state = CircuitBreakerState::HalfOpen;
                    inner.half_open_calls = 1;
                    inner.half_open_since = Some(Instant::now());
                    inner.metrics.consecutive_successes = 0;
                    metrics::record_breaker_state(&self.config.name, inner.state);
                    tracing::info!(breaker = %self.config.name, "circuit breaker half-open, probe granted");
                    true
                } else {
                    false
                }
            }
            CircuitBreakerState::HalfOpen => {
                if inner.half_open_calls < self.config.half_open_max_calls {
                    inner.half_open_calls += 1;
                    return true;
                }
                // A probe that never reported back must not wedge the breaker.
                if self.recovery_elapsed(inner.half_open_since) {
                    inner.half_open_calls = 1;
                    inner.half_open_since = Some(Instant::now());
                    return true;
                }
                false
            }
        }
    }

    /// Non-mutating variant of [`can_execute`](Self::can_execute).
    ///
    /// Never consumes a half-open probe; background loops use it to decide
    /// whether it is worth attempting work at all.
    pub fn would_permit(&self) -> bool {
        let inner = self.inner.lock();
        match inner.state {
            CircuitBreakerState::Closed => true,
            CircuitBreakerState::Open => self.recovery_elapsed(inner.last_failure),
            CircuitBreakerState::HalfOpen => {
                inner.half_open_calls < self.config.half_open_max_calls
                    || self.recovery_elapsed(inner.half_open_since)
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        inner.metrics.total_calls += 1;
        inner.metrics.successful_calls += 1;
        inner.metrics.consecutive_failures = 0;
        inner.metrics.consecutive_successes = inner.metrics.consecutive_successes.saturating_add(1);

        if inner.state == CircuitBreakerState::HalfOpen {
            inner.state = CircuitBreakerState::Closed;
            inner.half_open_calls = 0;
            inner.half_open_since = None;
            metrics::record_breaker_state(&self.config.name, inner.state);
            tracing::info!(breaker = %self.config.name, "circuit breaker closed - resource recovered");
        }
    }

    pub fn record_failure(&self, label: &str) {
        let mut inner = self.inner.lock();
        inner.metrics.total_calls += 1;
        inner.metrics.failed_calls += 1;
        inner.metrics.consecutive_successes = 0;
        inner.metrics.consecutive_failures = inner.metrics.consecutive_failures.saturating_add(1);
        inner.metrics.last_failure_time = Some(now_millis());
        inner.last_failure = Some(Instant::now());

        match inner.state {
            CircuitBreakerState::Closed => {
                if inner.metrics.consecutive_failures >= self.config.failure_threshold {
                    self.open(&mut inner);
                    tracing::warn!(
                        breaker = %self.config.name,
                        failures = inner.metrics.consecutive_failures,
                        last_error = label,
                        "circuit breaker opened - too many failures"
                    );
                }
            }
            CircuitBreakerState::HalfOpen => {
                self.open(&mut inner);
                tracing::warn!(
                    breaker = %self.config.name,
                    last_error = label,
                    "circuit breaker re-opened - probe failed"
                );
            }
            CircuitBreakerState::Open => {}
        }
    }

    pub fn get_status(&self) -> CircuitBreakerStatus {
        let inner = self.inner.lock();
        CircuitBreakerStatus {
            name: self.config.name.clone(),
            state: inner.state,
            metrics: inner.metrics.clone(),
        }
    }

    /// Force the breaker back to Closed with zeroed statistics.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.state = CircuitBreakerState::Closed;
        inner.metrics = CircuitBreakerMetrics::default();
        inner.last_failure = None;
        inner.half_open_calls = 0;
        inner.half_open_since = None;
        metrics::record_breaker_state(&self.config.name, inner.state);
    }

    /// Run `fut` under this breaker.
    ///
    /// The future is never polled when the breaker denies execution. The
    /// configured timeout applies; an elapsed timeout counts as a failure.
    pub async fn call<T, E, Fut>(&self, fut: Fut) -> Result<T, CallError<E>>
    where
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        if !self.can_execute() {
            metrics::record_breaker_rejection(&self.config.name);
            return Err(CallError::Open {
                name: self.config.name.clone(),
            });
        }

        match tokio::time::timeout(self.config.timeout, fut).await {
            Ok(Ok(value)) => {
                self.record_success();
                Ok(value)
            }
            Ok(Err(e)) => {
                self.record_failure(&e.to_string());
                Err(CallError::Inner(e))
            }
            Err(_) => {
                self.record_failure("timeout");
                Err(CallError::Timeout {
                    name: self.config.name.clone(),
                    after: self.config.timeout,
                })
            }
        }
    }

    fn open(&self, inner: &mut Inner) {
        inner.state = CircuitBreakerState::Open;
        inner.half_open_calls = 0;
        inner.half_open_since = None;
        inner.metrics.circuit_breaker_opens += 1;
        metrics::record_breaker_state(&self.config.name, inner.state);
    }

    fn recovery_elapsed(&self, since: Option<Instant>) -> bool {
        match since {
            Some(at) => at.elapsed() >= self.config.recovery_timeout,
            None => true,
        }
    }
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.config.name)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, recovery: Duration) -> CircuitBreaker {
        CircuitBreaker::new(CircuitBreakerConfig {
            name: "test".into(),
            failure_threshold: threshold,
            recovery_timeout: recovery,
            timeout: Duration::from_millis(50),
            half_open_max_calls: 1,
        })
    }

    #[test]
    fn starts_closed() {
        let cb = breaker(3, Duration::from_secs(60));
        assert_eq!(cb.state(), CircuitBreakerState::Closed);
        assert!(cb.can_execute());
        assert_eq!(cb.get_status().metrics, CircuitBreakerMetrics::default());
    }

    #[test]
    fn opens_exactly_on_threshold() {
        let cb = breaker(3, Duration::from_secs(60));

        cb.record_failure("boom");
        cb.record_failure("boom");
        assert_eq!(cb.state(), CircuitBreakerState::Closed);
        assert!(cb.can_execute());

        cb.record_failure("boom");
        assert_eq!(cb.state(), CircuitBreakerState::Open);
        assert!(!cb.can_execute());

        let status = cb.get_status();
        assert_eq!(status.metrics.circuit_breaker_opens, 1);
        assert_eq!(status.metrics.failed_calls, 3);
        assert_eq!(status.metrics.total_calls, 3);
        assert!(status.metrics.last_failure_time.is_some());
    }

    #[test]
    fn success_resets_consecutive_failures() {
        let cb = breaker(3, Duration::from_secs(60));

        cb.record_failure("a");
        cb.record_failure("b");
        cb.record_success();
        assert_eq!(cb.get_status().metrics.consecutive_failures, 0);

        cb.record_failure("c");
        cb.record_failure("d");
        assert_eq!(cb.state(), CircuitBreakerState::Closed);

        let m = cb.get_status().metrics;
        assert_eq!(m.successful_calls, 1);
        assert_eq!(m.failed_calls, 4);
        assert_eq!(m.total_calls, 5);
    }

    #[test]
    fn open_denies_until_recovery_then_grants_one_probe() {
        let cb = breaker(1, Duration::from_millis(30));
        cb.record_failure("down");
        assert!(!cb.can_execute());

        std::thread::sleep(Duration::from_millis(40));
        assert!(cb.can_execute());
        assert_eq!(cb.state(), CircuitBreakerState::HalfOpen);
        // Only one probe at a time
        assert!(!cb.can_execute());
    }

    #[test]
    fn failed_probe_reopens() {
        let cb = breaker(1, Duration::from_millis(20));
        cb.record_failure("down");
        std::thread::sleep(Duration::from_millis(30));
        assert!(cb.can_execute());

        cb.record_failure("still down");
        assert_eq!(cb.state(), CircuitBreakerState::Open);
        assert!(!cb.can_execute());
        assert_eq!(cb.get_status().metrics.circuit_breaker_opens, 2);
    }

    #[test]
    fn successful_probe_closes() {
        let cb = breaker(1, Duration::from_millis(20));
        cb.record_failure("down");
        std::thread::sleep(Duration::from_millis(30));
        assert!(cb.can_execute());

        cb.record_success();
        assert_eq!(cb.state(), CircuitBreakerState::Closed);
        assert!(cb.can_execute());
    }

    #[test]
    fn would_permit_does_not_consume_probe() {
        let cb = breaker(1, Duration::from_millis(20));
        cb.record_failure("down");
        assert!(!cb.would_permit());

        std::thread::sleep(Duration::from_millis(30));
        assert!(cb.would_permit());
        assert!(cb.would_permit());
        assert_eq!(cb.state(), CircuitBreakerState::Open);
        assert!(cb.can_execute());
    }

    #[test]
    fn reset_returns_to_closed() {
        let cb = breaker(1, Duration::from_secs(60));
        cb.record_failure("down");
        cb.reset();
        assert_eq!(cb.state(), CircuitBreakerState::Closed);
        assert_eq!(cb.get_status().metrics.total_calls, 0);
    }

    #[tokio::test]
    async fn call_records_outcomes() {
        let cb = breaker(2, Duration::from_secs(60));

        let ok: Result<u32, CallError<String>> = cb.call(async { Ok::<_, String>(7) }).await;
        assert_eq!(ok.unwrap(), 7);

        let err = cb.call(async { Err::<u32, _>("nope".to_string()) }).await;
        assert!(matches!(err, Err(CallError::Inner(ref e)) if e == "nope"));

        let m = cb.get_status().metrics;
        assert_eq!(m.successful_calls, 1);
        assert_eq!(m.failed_calls, 1);
    }

    #[tokio::test]
    async fn call_timeout_counts_as_failure() {
        let cb = breaker(1, Duration::from_secs(60));

        let result = cb
            .call(async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok::<(), String>(())
            })
            .await;

        assert!(matches!(result, Err(CallError::Timeout { .. })));
        assert_eq!(cb.state(), CircuitBreakerState::Open);
    }

    #[tokio::test]
    async fn open_call_does_not_run_future() {
        let cb = breaker(1, Duration::from_secs(60));
        cb.record_failure("down");

        let ran = std::sync::atomic::AtomicBool::new(false);
        let result = cb
            .call(async {
                ran.store(true, std::sync::atomic::Ordering::SeqCst);
                Ok::<(), String>(())
            })
            .await;

        assert!(result.unwrap_err().is_open());
        assert!(!ran.load(std::sync::atomic::Ordering::SeqCst));
    }
}
