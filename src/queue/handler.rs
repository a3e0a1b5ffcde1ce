//! Message handlers.
//!
//! # Responsibilities
//! - Define the handler contract `(user_id, payload) -> Result`
//! - Adapt plain async closures into handlers
//! - Classify handler failures for retry bookkeeping

use std::future::Future;

use async_trait::async_trait;

use crate::queue::message::Payload;

/// Handler failure. `kind` lands in `last_error_type` and the retry history.
#[derive(Debug, Clone, thiserror::Error)]
pub enum HandlerError {
    #[error("no handler registered for message type '{0}'")]
    NotFound(String),

    #[error("{message}")]
    Failed { kind: String, message: String },
}

impl HandlerError {
    /// Generic failure with kind `HandlerError`.
    pub fn msg(message: impl Into<String>) -> Self {
        Self::Failed {
            kind: "HandlerError".to_string(),
            message: message.into(),
        }
    }

    /// Failure with a caller-chosen kind.
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Failed {
            kind: kind.into(),
            message: message.into(),
        }
    }

    pub fn kind(&self) -> &str {
        match self {
            HandlerError::NotFound(_) => "HandlerNotFound",
            HandlerError::Failed { kind, .. } => kind,
        }
    }
}

/// Processes messages of one type.
///
/// Delivery is at-least-once: implementations must tolerate being invoked
/// more than once for the same message.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, user_id: &str, payload: &Payload) -> Result<(), HandlerError>;
}

/// Handler backed by an async closure.
pub struct FnHandler<F> {
    f: F,
}

/// Wrap an async closure taking owned `(user_id, payload)`.
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(String, Payload) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    FnHandler { f }
}

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(String, Payload) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(&self, user_id: &str, payload: &Payload) -> Result<(), HandlerError> {
        (self.f)(user_id.to_string(), payload.clone()).await
    }
}
