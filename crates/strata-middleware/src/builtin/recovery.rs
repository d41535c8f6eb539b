//! Panic recovery middleware

use serde::Deserialize;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use strata_core::{responses, Context, Error, Handler, StatusCode};
use tracing::error;

/// Recovery configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Include the panic message in the response body
    pub expose_message: bool,
}

/// Catches panics raised by downstream handlers.
///
/// The panic is recorded on the context as [`Error::Panic`], a 500 body is
/// written and the chain is aborted.
#[derive(Debug, Clone, Default)]
pub struct Recovery {
    config: RecoveryConfig,
}

impl Recovery {
    /// Create recovery middleware with default config
    pub fn new() -> Self {
        Self::default()
    }

    /// Create recovery middleware with custom config
    pub fn with_config(config: RecoveryConfig) -> Self {
        Self { config }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

impl Handler for Recovery {
    fn handle(&self, ctx: &mut Context) {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| ctx.next()));

        if let Err(payload) = outcome {
            let message = panic_message(payload.as_ref());
            error!(
                request_id = %ctx.request_id,
                path = %ctx.path,
                panic = %message,
                "Handler panicked"
            );

            let public = if self.config.expose_message {
                message.clone()
            } else {
                "Internal server error".to_string()
            };
            ctx.push_error(Error::Panic(message));
            responses::error(ctx, StatusCode::INTERNAL_SERVER_ERROR, "internal_error", public);
            ctx.abort();
        }
    }
}
