//! Error types for Strata

use std::sync::Arc;

/// Result type alias using [`Error`]
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// An error raised while a request is processed.
///
/// Errors accumulated on a [`Context`](crate::Context) come from arbitrary
/// handlers, so they are type-erased and reference counted so the recovery
/// path can keep the original alongside any wrapping error.
pub type SharedError = Arc<dyn std::error::Error + Send + Sync + 'static>;

/// Wrap any error into a [`SharedError`]
pub fn shared<E>(err: E) -> SharedError
where
    E: std::error::Error + Send + Sync + 'static,
{
    Arc::new(err)
}

/// Main error type for Strata
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A middleware, builtin, entry or strategy name is already taken
    #[error("{kind} '{name}' is already registered")]
    AlreadyRegistered {
        /// What was being registered (e.g. "builtin middleware")
        kind: &'static str,
        /// The duplicated name
        name: String,
    },

    /// A lookup found nothing under the given name
    #[error("{kind} '{name}' not found")]
    NotFound {
        /// What was looked up
        kind: &'static str,
        /// The missing name
        name: String,
    },

    /// The requested chain could not be compiled
    #[error("Chain compilation failed: {0}")]
    Compile(String),

    /// No classification rule matched the error
    #[error("No classification rule matched: {0}")]
    ClassificationUnknown(String),

    /// A retry budget was consumed without success
    #[error("Recovery strategy '{strategy}' exhausted after {attempts} attempt(s): {source}")]
    RecoveryExhausted {
        /// Strategy that performed the retries
        strategy: String,
        /// Number of attempts made
        attempts: u32,
        /// Last error observed
        #[source]
        source: SharedError,
    },

    /// A circuit breaker denied the attempt
    #[error("Circuit breaker '{breaker}' is open: {source}")]
    CircuitOpen {
        /// Breaker name
        breaker: String,
        /// The error that triggered recovery
        #[source]
        source: SharedError,
    },

    /// The error was handed to the escalation hook
    #[error("Escalated by strategy '{strategy}': {source}")]
    Escalated {
        /// Strategy that escalated
        strategy: String,
        /// The escalated error
        #[source]
        source: SharedError,
    },

    /// Operation timed out
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Network failure
    #[error("Network error: {0}")]
    Network(String),

    /// Database failure
    #[error("Database error: {0}")]
    Database(String),

    /// Input validation failure
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Authentication failure
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Rate limit exceeded
    #[error("Rate limit exceeded: {0}")]
    RateLimited(String),

    /// Expected business-rule violation
    #[error("Business rule violated: {0}")]
    Business(String),

    /// External dependency failure
    #[error("External service error: {0}")]
    External(String),

    /// A handler panicked
    #[error("Handler panicked: {0}")]
    Panic(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error (should not happen in production)
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Convert error to HTTP status code
    pub fn to_status_code(&self) -> http::StatusCode {
        use http::StatusCode;
        match self {
            Error::Validation(_) => StatusCode::BAD_REQUEST,
            Error::Authentication(_) => StatusCode::UNAUTHORIZED,
            Error::NotFound { .. } => StatusCode::NOT_FOUND,
            Error::AlreadyRegistered { .. } => StatusCode::CONFLICT,
            Error::Business(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Error::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            Error::External(_) | Error::Network(_) => StatusCode::BAD_GATEWAY,
            Error::CircuitOpen { .. } | Error::RecoveryExhausted { .. } => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Error::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Create an `AlreadyRegistered` error
    pub fn already_registered(kind: &'static str, name: impl Into<String>) -> Self {
        Error::AlreadyRegistered {
            kind,
            name: name.into(),
        }
    }

    /// Create a `NotFound` error
    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        Error::NotFound {
            kind,
            name: name.into(),
        }
    }

    /// Convert into a [`SharedError`]
    pub fn into_shared(self) -> SharedError {
        Arc::new(self)
    }
}
