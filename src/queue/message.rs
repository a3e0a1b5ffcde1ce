//! Queued message model and per-message retry policy.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::resilience::backoff::calculate_backoff;

/// Opaque handler payload.
pub type Payload = serde_json::Map<String, serde_json::Value>;

pub const DEFAULT_MAX_RETRIES: u32 = 5;
pub const DEFAULT_BASE_RETRY_DELAY: Duration = Duration::from_secs(1);
pub const DEFAULT_MAX_RETRY_DELAY: Duration = Duration::from_secs(60);

/// Current wall-clock time in unix milliseconds.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Pickup priority. Advisory only: workers poll higher lists first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessagePriority {
    Low,
    #[default]
    Normal,
    High,
}

impl MessagePriority {
    /// Polling order, highest first.
    pub const ALL: [MessagePriority; 3] = [MessagePriority::High, MessagePriority::Normal, MessagePriority::Low];

    pub fn as_str(self) -> &'static str {
        match self {
            MessagePriority::Low => "low",
            MessagePriority::Normal => "normal",
            MessagePriority::High => "high",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageStatus {
    Pending,
    Processing,
    Completed,
    Retrying,
    CircuitBreakerOpen,
    RetryExhausted,
    DeadLetter,
}

impl MessageStatus {
    /// Statuses that carry `permanent_failure = true`.
    pub fn is_permanent_failure(self) -> bool {
        matches!(self, MessageStatus::RetryExhausted | MessageStatus::DeadLetter)
    }
}

/// One failed delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryAttempt {
    /// Unix millis.
    pub timestamp: u64,
    pub error: String,
    pub error_type: String,
}

/// Unit of work carried by the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedMessage {
    pub id: String,
    pub user_id: String,
    /// Handler key.
    #[serde(rename = "type")]
    pub message_type: String,
    pub payload: Payload,
    pub priority: MessagePriority,
    pub status: MessageStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    pub base_retry_delay: Duration,
    pub max_retry_delay: Duration,
    /// Unix millis; `None` until the first retry is scheduled.
    pub next_retry_at: Option<u64>,
    pub last_error: Option<String>,
    pub last_error_type: Option<String>,
    pub retry_history: Vec<RetryAttempt>,
    pub permanent_failure: bool,
    /// Unix millis.
    pub created_at: u64,
}

impl QueuedMessage {
    /// New PENDING message with a random id and default retry policy.
    pub fn new(user_id: impl Into<String>, message_type: impl Into<String>, payload: Payload) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            message_type: message_type.into(),
            payload,
            priority: MessagePriority::Normal,
            status: MessageStatus::Pending,
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            base_retry_delay: DEFAULT_BASE_RETRY_DELAY,
            max_retry_delay: DEFAULT_MAX_RETRY_DELAY,
            next_retry_at: None,
            last_error: None,
            last_error_type: None,
            retry_history: Vec::new(),
            permanent_failure: false,
            created_at: now_millis(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_priority(mut self, priority: MessagePriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_retry_delays(mut self, base: Duration, max: Duration) -> Self {
        self.base_retry_delay = base;
        self.max_retry_delay = max.max(base);
        self
    }

    /// Backoff for the next attempt, including jitter.
    pub fn calculate_next_retry_delay(&self) -> Duration {
        calculate_backoff(self.retry_count, self.base_retry_delay, self.max_retry_delay)
    }

    pub fn should_retry(&self) -> bool {
        if self.permanent_failure || self.status == MessageStatus::Completed {
            return false;
        }
        self.retry_count < self.max_retries
    }

    pub fn is_retry_ready(&self) -> bool {
        self.is_retry_ready_at(now_millis())
    }

    pub fn is_retry_ready_at(&self, now: u64) -> bool {
        match self.next_retry_at {
            Some(at) => now >= at,
            None => true,
        }
    }

    /// Record a failed attempt and bump `retry_count` (bounded by `max_retries`).
    pub fn record_attempt_failure(&mut self, error: &str, error_type: &str) {
        self.retry_history.push(RetryAttempt {
            timestamp: now_millis(),
            error: error.to_string(),
            error_type: error_type.to_string(),
        });
        self.retry_count = (self.retry_count + 1).min(self.max_retries);
        self.last_error = Some(error.to_string());
        self.last_error_type = Some(error_type.to_string());
    }

    /// Move to RETRYING with a `next_retry_at` strictly after now.
    pub fn schedule_retry(&mut self) -> Duration {
        let delay = self.calculate_next_retry_delay();
        let delay_ms = (delay.as_millis() as u64).max(1);
        self.status = MessageStatus::Retrying;
        self.next_retry_at = Some(now_millis() + delay_ms);
        delay
    }

    /// Terminal failure: retries exhausted, headed for the dead letter store.
    pub fn mark_exhausted(&mut self) {
        self.status = MessageStatus::RetryExhausted;
        self.permanent_failure = true;
        self.next_retry_at = None;
    }

    /// Clear retry bookkeeping so the message runs as a fresh attempt.
    pub fn reset_for_reprocessing(&mut self) {
        self.status = MessageStatus::Pending;
        self.retry_count = 0;
        self.next_retry_at = None;
        self.permanent_failure = false;
        self.retry_history.clear();
    }
}
