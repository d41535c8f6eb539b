//! Builtin middleware catalog
//!
//! Every builtin is registered as a factory: the configuration value given
//! at instantiation time is parsed into the middleware's typed config, so one
//! builtin can be used several times with different settings.

pub mod cors;
pub mod logger;
pub mod recovery;
pub mod request_id;

pub use cors::{Cors, CorsConfig};
pub use logger::{Logger, LoggerConfig};
pub use recovery::{Recovery, RecoveryConfig};
pub use request_id::{IdGenerator, RequestId, RequestIdConfig};

use crate::registry::{MiddlewareMetadata, MiddlewareRegistry};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use strata_core::{BoxedHandler, Error, Result};
use tracing::warn;

const AUTHOR: &str = "strata";

fn metadata(name: &str, description: &str) -> MiddlewareMetadata {
    MiddlewareMetadata::new(name)
        .version(env!("CARGO_PKG_VERSION"))
        .author(AUTHOR)
        .description(description)
}

/// Register every builtin factory into `registry`.
///
/// Names that are already taken are skipped with a warning.
pub fn register_all(registry: &MiddlewareRegistry) {
    let results = [
        registry.register_builtin(
            "recovery",
            |cfg| Ok(Arc::new(Recovery::with_config(parse_config("recovery", cfg)?)) as BoxedHandler),
            metadata("recovery", "Turns handler panics into 500 responses"),
        ),
        registry.register_builtin(
            "logger",
            |cfg| Ok(Arc::new(Logger::with_config(parse_config("logger", cfg)?)?) as BoxedHandler),
            metadata("logger", "Structured per-request log line"),
        ),
        registry.register_builtin(
            "request_id",
            |cfg| {
                Ok(Arc::new(RequestId::with_config(parse_config("request_id", cfg)?)?) as BoxedHandler)
            },
            metadata("request_id", "Propagates or generates a request ID"),
        ),
        registry.register_builtin(
            "cors",
            |cfg| Ok(Arc::new(Cors::with_config(parse_config("cors", cfg)?)?) as BoxedHandler),
            metadata("cors", "Cross-origin resource sharing headers").depends_on("request_id"),
        ),
    ];

    for result in results {
        if let Err(e) = result {
            warn!(error = %e, "Skipping builtin middleware");
        }
    }
}

/// Parse a builtin's configuration; `null` yields the defaults
pub(crate) fn parse_config<T>(name: &str, config: &serde_json::Value) -> Result<T>
where
    T: DeserializeOwned + Default,
{
    if config.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(config.clone())
        .map_err(|e| Error::Config(format!("invalid configuration for '{name}': {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_null_config_uses_defaults() {
        let cfg: LoggerConfig = parse_config("logger", &serde_json::Value::Null).unwrap();
        assert_eq!(cfg.level, "info");
    }

    #[test]
    fn test_bad_config_is_config_error() {
        let err = parse_config::<LoggerConfig>("logger", &json!({"skip_paths": 3})).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_register_all_is_safe_to_repeat() {
        let registry = MiddlewareRegistry::new();
        register_all(&registry);
        register_all(&registry);
        assert_eq!(registry.stats().builtin, 4);
        assert_eq!(
            registry.metadata("cors").unwrap().dependencies,
            vec!["request_id"]
        );
    }
}
