//! # Strata Core
//!
//! Core types, traits, and error handling for the Strata middleware pipeline.
//!
//! This crate provides the foundational abstractions shared by the pipeline and
//! the recovery engine:
//! - The per-request [`Context`] with `next`/`abort` chain control
//! - The [`Handler`] trait
//! - The [`Error`] taxonomy
//! - JSON response helpers

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub
)]

pub mod context;
pub mod error;
pub mod handler;
pub mod response;

pub use context::Context;
pub use error::{shared, Error, Result, SharedError};
pub use handler::{handler_fn, BoxedHandler, Handler, RetryOperation};
pub use response::{responses, ErrorBody};

// Re-export commonly used HTTP types
pub use http::{HeaderName, HeaderValue, Method, StatusCode};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::context::Context;
    pub use crate::error::{Error, Result, SharedError};
    pub use crate::handler::{handler_fn, BoxedHandler, Handler, RetryOperation};
    pub use crate::response::{responses, ErrorBody};
}
