//! # Strata Middleware
//!
//! Layered middleware pipeline with:
//! - Four precedence layers (global, group, route, controller)
//! - A registry of builtin factories and custom handlers
//! - A chain compiler with a cache keyed by chain identity
//! - A manager running cache warm-up and health-check loops
//! - Builtin recovery, logger, request ID and CORS middleware

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub
)]

pub mod builtin;
pub mod compiler;
pub mod health;
pub mod layer;
pub mod manager;
pub mod registry;

pub use compiler::{chain_id, normalize_layers, ChainCompiler, CompiledChain, CompilerStats};
pub use health::{HealthReport, HealthThresholds, MIN_LOOKUPS_FOR_HIT_RATE};
pub use layer::{EntryInfo, Layer, LayerSnapshot, LayeredPipeline, MiddlewareEntry};
pub use manager::{PipelineManager, PipelineManagerConfig, PipelineStats};
pub use registry::{BuiltinFactory, MiddlewareMetadata, MiddlewareRegistry, RegistryStats};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::builtin::{Cors, CorsConfig, Logger, LoggerConfig, Recovery, RequestId};
    pub use crate::compiler::{ChainCompiler, CompiledChain};
    pub use crate::layer::{Layer, LayeredPipeline};
    pub use crate::manager::{PipelineManager, PipelineManagerConfig};
    pub use crate::registry::{MiddlewareMetadata, MiddlewareRegistry};
    pub use strata_core::prelude::*;
}
