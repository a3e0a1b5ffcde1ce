//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Shutdown (shutdown.rs):
//!     stop_processing → trigger → workers finish current message → join
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → binary calls stop_processing
//! ```
//!
//! # Design Decisions
//! - Shutdown has timeout: tasks still running after the deadline are aborted

pub mod shutdown;
pub mod signals;

pub use shutdown::{Shutdown, ShutdownSignal};
pub use signals::wait_for_shutdown_signal;
