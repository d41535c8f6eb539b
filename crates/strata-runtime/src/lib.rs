//! # Strata Runtime
//!
//! Runtime assembly and lifecycle management with:
//! - Pipeline and recovery wiring from configuration
//! - Request handling with automatic error recovery
//! - Graceful shutdown with signal handling
//! - Tracing subscriber setup

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub
)]

pub mod runtime;
pub mod shutdown;
pub mod telemetry;

pub use runtime::{strategy_from_config, Runtime, RuntimeBuilder, RuntimeStats};
pub use shutdown::{ShutdownSignal, SignalHandler};
pub use telemetry::init_tracing;

/// Runtime state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeState {
    /// Runtime is built but not started
    Initializing,
    /// Maintenance loops are running
    Running,
    /// Runtime is shutting down
    ShuttingDown,
    /// Runtime is stopped
    Stopped,
}

/// Re-export commonly used types
pub mod prelude {
    pub use crate::runtime::{Runtime, RuntimeBuilder};
    pub use crate::shutdown::{ShutdownSignal, SignalHandler};
    pub use crate::RuntimeState;
}
