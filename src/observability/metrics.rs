//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Define queue and breaker metrics
//! - Expose Prometheus-compatible metrics endpoint
//!
//! # Metrics
//! - `queue_messages_enqueued_total` (counter): by type, priority
//! - `queue_messages_processed_total` (counter): by type, outcome
//! - `queue_messages_dead_lettered_total` (counter): by type
//! - `queue_messages_buffered_total` (counter): by pending write
//! - `queue_retries_promoted_total` (counter)
//! - `queue_retry_buffer_size` (gauge)
//! - `circuit_breaker_state` (gauge): 0=closed, 1=open, 2=half_open
//! - `circuit_breaker_rejections_total` (counter): by breaker
//!
//! # Design Decisions
//! - Without an installed recorder every call is a no-op (tests, embedding)
//! - Labels stay low-cardinality: message type, priority, breaker name

use std::net::SocketAddr;

use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;

use crate::queue::message::MessagePriority;
use crate::resilience::CircuitBreakerState;

/// Install the Prometheus recorder and its HTTP listener on `addr`.
///
/// Must be called from within a Tokio runtime.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics endpoint listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_enqueued(message_type: &str, priority: MessagePriority) {
    counter!(
        "queue_messages_enqueued_total",
        "type" => message_type.to_string(),
        "priority" => priority.as_str()
    )
    .increment(1);
}

pub fn record_processed(message_type: &str, outcome: &'static str) {
    counter!(
        "queue_messages_processed_total",
        "type" => message_type.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}

pub fn record_dead_lettered(message_type: &str) {
    counter!("queue_messages_dead_lettered_total", "type" => message_type.to_string()).increment(1);
}

pub fn record_buffered(action: &'static str) {
    counter!("queue_messages_buffered_total", "action" => action).increment(1);
}

pub fn set_buffer_size(size: usize) {
    gauge!("queue_retry_buffer_size").set(size as f64);
}

pub fn record_retries_promoted(count: usize) {
    if count > 0 {
        counter!("queue_retries_promoted_total").increment(count as u64);
    }
}

pub fn record_breaker_state(name: &str, state: CircuitBreakerState) {
    gauge!("circuit_breaker_state", "breaker" => name.to_string()).set(state.as_metric_value());
}

pub fn record_breaker_rejection(name: &str) {
    counter!("circuit_breaker_rejections_total", "breaker" => name.to_string()).increment(1);
}
