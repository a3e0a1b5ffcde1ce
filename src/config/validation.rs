//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (thresholds >= 1, intervals > 0)
//! - Check that related values agree (base delay <= max delay)
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ServiceConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::net::SocketAddr;

use crate::config::schema::{BreakerSettings, ServiceConfig};

/// A single semantic problem with a configuration value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{field}: {message}")]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

pub fn validate_config(config: &ServiceConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    let queue = &config.queue;
    if queue.worker_count == 0 {
        errors.push(ValidationError::new("queue.worker_count", "must be at least 1"));
    }
    for (field, value) in [
        ("queue.poll_interval_ms", queue.poll_interval_ms),
        ("queue.retry_scan_interval_ms", queue.retry_scan_interval_ms),
        ("queue.buffer_drain_interval_ms", queue.buffer_drain_interval_ms),
        ("queue.shutdown_timeout_ms", queue.shutdown_timeout_ms),
    ] {
        if value == 0 {
            errors.push(ValidationError::new(field, "must be greater than 0"));
        }
    }
    if queue.retry_scan_batch == 0 {
        errors.push(ValidationError::new("queue.retry_scan_batch", "must be at least 1"));
    }
    if queue.key_prefix.is_empty() {
        errors.push(ValidationError::new("queue.key_prefix", "must not be empty"));
    }

    let retry = &config.retry;
    if retry.base_delay_ms == 0 {
        errors.push(ValidationError::new("retry.base_delay_ms", "must be greater than 0"));
    }
    if retry.base_delay_ms > retry.max_delay_ms {
        errors.push(ValidationError::new(
            "retry.max_delay_ms",
            format!("must be >= base_delay_ms ({})", retry.base_delay_ms),
        ));
    }

    validate_breaker("storage_breaker", &config.storage_breaker, &mut errors);
    validate_breaker("handler_breaker", &config.handler_breaker, &mut errors);

    let observability = &config.observability;
    if observability.metrics_enabled && observability.metrics_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new(
            "observability.metrics_address",
            format!("invalid socket address '{}'", observability.metrics_address),
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn validate_breaker(section: &str, breaker: &BreakerSettings, errors: &mut Vec<ValidationError>) {
    if breaker.failure_threshold == 0 {
        errors.push(ValidationError::new(
            format!("{section}.failure_threshold"),
            "must be at least 1",
        ));
    }
    if breaker.half_open_max_calls == 0 {
        errors.push(ValidationError::new(
            format!("{section}.half_open_max_calls"),
            "must be at least 1",
        ));
    }
    if breaker.recovery_timeout_ms == 0 {
        errors.push(ValidationError::new(
            format!("{section}.recovery_timeout_ms"),
            "must be greater than 0",
        ));
    }
    if breaker.timeout_ms == 0 {
        errors.push(ValidationError::new(format!("{section}.timeout_ms"), "must be greater than 0"));
    }
}
