//! JSON response bodies and helpers

use crate::context::Context;
use http::StatusCode;
use serde::{Deserialize, Serialize};

/// Structured error body written on failure paths
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Short machine-readable error code
    pub error: String,
    /// Human-readable message
    pub message: String,
    /// Request ID for correlation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl ErrorBody {
    /// Create a new error body
    pub fn new(error: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            message: message.into(),
            request_id: None,
        }
    }

    /// Attach the request ID
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }
}

/// Convenience functions for common responses
pub mod responses {
    use super::*;

    /// Write an error body with the given status
    pub fn error(ctx: &mut Context, status: StatusCode, code: &str, message: impl Into<String>) {
        let body = ErrorBody::new(code, message).with_request_id(ctx.request_id.clone());
        ctx.json(status, body);
    }

    /// 500 Internal Server Error
    pub fn internal_error(ctx: &mut Context) {
        error(
            ctx,
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal_error",
            "Internal server error",
        );
    }

    /// 503 Service Unavailable
    pub fn service_unavailable(ctx: &mut Context) {
        error(
            ctx,
            StatusCode::SERVICE_UNAVAILABLE,
            "service_unavailable",
            "Service temporarily unavailable",
        );
    }

    /// 204 No Content
    pub fn no_content(ctx: &mut Context) {
        ctx.set_status(StatusCode::NO_CONTENT);
    }
}
