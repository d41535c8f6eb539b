//! Request ID middleware for distributed tracing

use serde::Deserialize;
use std::fmt;
use strata_core::{Context, Error, HeaderName, HeaderValue, Handler, Result};
use uuid::Uuid;

/// Request ID generator strategy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdGenerator {
    /// Hyphenated UUID v4
    #[default]
    UuidV4,
    /// UUID v4 without hyphens
    Simple,
}

impl IdGenerator {
    /// Generate a new ID
    pub fn generate(&self) -> String {
        match self {
            IdGenerator::UuidV4 => Uuid::new_v4().to_string(),
            IdGenerator::Simple => Uuid::new_v4().simple().to_string(),
        }
    }
}

/// Configuration for the request ID middleware
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RequestIdConfig {
    /// Header carrying the request ID
    pub header_name: String,
    /// ID generator strategy
    pub generator: IdGenerator,
    /// Echo the ID in response headers
    pub add_to_response: bool,
}

impl Default for RequestIdConfig {
    fn default() -> Self {
        Self {
            header_name: "x-request-id".to_string(),
            generator: IdGenerator::UuidV4,
            add_to_response: true,
        }
    }
}

/// Reuses an inbound request ID or generates a new one.
///
/// The ID replaces [`Context::request_id`] and is stored under the
/// `request_id` key.
#[derive(Clone)]
pub struct RequestId {
    config: RequestIdConfig,
    header_name: HeaderName,
}

impl RequestId {
    /// Create request ID middleware with default config
    pub fn new() -> Self {
        Self {
            config: RequestIdConfig::default(),
            header_name: HeaderName::from_static("x-request-id"),
        }
    }

    /// Create request ID middleware with custom config
    pub fn with_config(config: RequestIdConfig) -> Result<Self> {
        let header_name = HeaderName::from_bytes(config.header_name.as_bytes())
            .map_err(|e| Error::Config(format!("invalid header name '{}': {e}", config.header_name)))?;
        Ok(Self {
            config,
            header_name,
        })
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestId")
            .field("header_name", &self.header_name)
            .field("generator", &self.config.generator)
            .finish()
    }
}

impl Handler for RequestId {
    fn handle(&self, ctx: &mut Context) {
        let inbound = ctx
            .headers
            .get(&self.header_name)
            .and_then(|v| v.to_str().ok())
            .filter(|s| !s.is_empty())
            .map(str::to_string);
        let id = inbound.unwrap_or_else(|| self.config.generator.generate());

        if self.config.add_to_response {
            if let Ok(value) = HeaderValue::from_str(&id) {
                ctx.set_response_header(self.header_name.clone(), value);
            }
        }
        ctx.set("request_id", id.clone());
        ctx.request_id = id;
    }
}
