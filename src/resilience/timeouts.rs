//! Breaker-wrapped units of work.
//!
//! # Responsibilities
//! - Wrap an arbitrary async operation with a circuit breaker and its timeout
//! - Hand back a plain closure so call sites stay unaware of the breaker
//!
//! # Design Decisions
//! - Uses Tokio's timeout facilities (via `CircuitBreaker::call`)
//! - Timeout errors are distinct from open-circuit and inner errors

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;

use futures_util::future::BoxFuture;

use crate::resilience::circuit_breaker::{CallError, CircuitBreaker};

/// Wrap `op` so every invocation runs through `breaker`.
///
/// ```ignore
/// let fetch = guard(breaker.clone(), |key: String| async move { storage.get(&key).await });
/// let value = fetch("k".into()).await?;
/// ```
pub fn guard<A, T, E, F, Fut>(
    breaker: Arc<CircuitBreaker>,
    op: F,
) -> impl Fn(A) -> BoxFuture<'static, Result<T, CallError<E>>> + Send + Sync
where
    A: Send + 'static,
    T: Send + 'static,
    E: Display + Send + 'static,
    F: Fn(A) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
{
    let op = Arc::new(op);
    move |arg: A| -> BoxFuture<'static, Result<T, CallError<E>>> {
        let breaker = breaker.clone();
        let op = op.clone();
        Box::pin(async move { breaker.call(op(arg)).await })
    }
}
