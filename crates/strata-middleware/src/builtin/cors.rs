//! CORS (Cross-Origin Resource Sharing) middleware

use http::header;
use serde::Deserialize;
use std::fmt;
use std::time::Duration;
use strata_core::{Context, Error, HeaderValue, Handler, Method, Result, StatusCode};

/// CORS configuration
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CorsConfig {
    /// Allowed origins (e.g., "*", "https://example.com")
    pub allowed_origins: Vec<String>,
    /// Allowed HTTP methods
    pub allowed_methods: Vec<String>,
    /// Allowed request headers
    pub allowed_headers: Vec<String>,
    /// Headers exposed to the browser
    pub exposed_headers: Vec<String>,
    /// Max age for the preflight cache
    #[serde(with = "humantime_serde")]
    pub max_age: Duration,
    /// Whether to allow credentials (cookies, auth headers)
    pub allow_credentials: bool,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origins: vec!["*".to_string()],
            allowed_methods: ["GET", "POST", "PUT", "DELETE", "OPTIONS"]
                .iter()
                .map(|m| m.to_string())
                .collect(),
            allowed_headers: vec![
                "Content-Type".to_string(),
                "Authorization".to_string(),
                "X-Request-ID".to_string(),
            ],
            exposed_headers: vec!["X-Request-ID".to_string()],
            max_age: Duration::from_secs(3600),
            allow_credentials: false,
        }
    }
}

/// CORS middleware
///
/// Preflight `OPTIONS` requests are answered with 204 and the chain stops;
/// other requests get the allow-origin headers and continue.
#[derive(Clone)]
pub struct Cors {
    config: CorsConfig,
    methods: String,
}

impl Cors {
    /// Create a permissive CORS middleware
    pub fn new() -> Self {
        let config = CorsConfig::default();
        let methods = config.allowed_methods.join(", ");
        Self { config, methods }
    }

    /// Create a CORS middleware with custom config
    pub fn with_config(config: CorsConfig) -> Result<Self> {
        for method in &config.allowed_methods {
            Method::from_bytes(method.as_bytes())
                .map_err(|_| Error::Config(format!("invalid CORS method '{method}'")))?;
        }
        let methods = config
            .allowed_methods
            .iter()
            .map(|m| m.to_ascii_uppercase())
            .collect::<Vec<_>>()
            .join(", ");
        Ok(Self { config, methods })
    }

    fn allows_any(&self) -> bool {
        self.config.allowed_origins.iter().any(|o| o == "*")
    }

    fn allow_origin(&self, request_origin: Option<&str>) -> Option<String> {
        if self.allows_any() {
            if self.config.allow_credentials {
                // "*" is not accepted together with credentials
                request_origin.map(str::to_string)
            } else {
                Some("*".to_string())
            }
        } else {
            request_origin
                .filter(|origin| self.config.allowed_origins.iter().any(|o| o == *origin))
                .map(str::to_string)
        }
    }

    fn set_header(ctx: &mut Context, name: header::HeaderName, value: &str) {
        if let Ok(value) = HeaderValue::from_str(value) {
            ctx.set_response_header(name, value);
        }
    }

    fn preflight(&self, ctx: &mut Context, allow_origin: Option<String>) {
        if let Some(origin) = allow_origin {
            Self::set_header(ctx, header::ACCESS_CONTROL_ALLOW_ORIGIN, &origin);
        }
        Self::set_header(ctx, header::ACCESS_CONTROL_ALLOW_METHODS, &self.methods);
        Self::set_header(
            ctx,
            header::ACCESS_CONTROL_ALLOW_HEADERS,
            &self.config.allowed_headers.join(", "),
        );
        Self::set_header(
            ctx,
            header::ACCESS_CONTROL_MAX_AGE,
            &self.config.max_age.as_secs().to_string(),
        );
        if self.config.allow_credentials {
            Self::set_header(ctx, header::ACCESS_CONTROL_ALLOW_CREDENTIALS, "true");
        }

        ctx.set_status(StatusCode::NO_CONTENT);
        ctx.abort();
    }
}

impl Default for Cors {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Cors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cors")
            .field("allowed_origins", &self.config.allowed_origins)
            .field("allow_credentials", &self.config.allow_credentials)
            .finish()
    }
}

impl Handler for Cors {
    fn handle(&self, ctx: &mut Context) {
        let origin = ctx
            .headers
            .get(header::ORIGIN)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let allow_origin = self.allow_origin(origin.as_deref());

        let is_preflight = ctx.method == Method::OPTIONS
            && ctx.headers.contains_key(header::ACCESS_CONTROL_REQUEST_METHOD);
        if is_preflight {
            self.preflight(ctx, allow_origin);
            return;
        }

        if let Some(origin) = allow_origin {
            Self::set_header(ctx, header::ACCESS_CONTROL_ALLOW_ORIGIN, &origin);
        }
        if !self.config.exposed_headers.is_empty() {
            Self::set_header(
                ctx,
                header::ACCESS_CONTROL_EXPOSE_HEADERS,
                &self.config.exposed_headers.join(", "),
            );
        }
        if self.config.allow_credentials {
            Self::set_header(ctx, header::ACCESS_CONTROL_ALLOW_CREDENTIALS, "true");
        }
    }
}
