//! Tracing subscriber setup

use strata_config::{LogFormat, LoggingConfig};
use strata_core::{Error, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Build the log filter: `RUST_LOG` when set, otherwise the configured level
pub fn env_filter(config: &LoggingConfig) -> Result<EnvFilter> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(&config.level)
            .map_err(|e| Error::Config(format!("invalid log level '{}': {e}", config.level))),
    }
}

/// Install the global tracing subscriber
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    let filter = env_filter(config)?;
    let json = config.format == LogFormat::Json;

    tracing_subscriber::registry()
        .with(filter)
        .with(json.then(|| tracing_subscriber::fmt::layer().json().with_current_span(false)))
        .with((!json).then(|| {
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_level(true)
        }))
        .try_init()
        .map_err(|e| Error::Internal(format!("tracing already initialised: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_level_rejected() {
        std::env::remove_var("RUST_LOG");
        let config = LoggingConfig {
            level: "strata=loud".to_string(),
            format: LogFormat::Pretty,
        };
        assert!(env_filter(&config).is_err());
    }

    #[test]
    fn test_directive_level_accepted() {
        std::env::remove_var("RUST_LOG");
        let config = LoggingConfig {
            level: "info,strata_recovery=debug".to_string(),
            format: LogFormat::Json,
        };
        assert!(env_filter(&config).is_ok());
    }
}
