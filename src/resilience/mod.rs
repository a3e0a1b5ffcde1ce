//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Protected call (storage op or handler invocation):
//!     → registry.rs (look up the shared breaker for the resource)
//!     → circuit_breaker.rs (gate, enforce per-call timeout, record outcome)
//!     → On failure: backoff.rs (delay before the message is retried)
//! ```
//!
//! # Design Decisions
//! - Timeouts are non-negotiable; every protected call has a deadline
//! - Storage and handler execution get separate breakers
//! - Jittered backoff prevents synchronized retry storms
//! - All resilience logic is composable (`timeouts::guard`)

pub mod backoff;
pub mod circuit_breaker;
pub mod registry;
pub mod timeouts;

pub use circuit_breaker::{
    CallError, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerMetrics, CircuitBreakerState,
    CircuitBreakerStatus,
};
pub use registry::CircuitBreakerRegistry;
pub use timeouts::guard;
