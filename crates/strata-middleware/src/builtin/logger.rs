//! Request logging middleware

use serde::Deserialize;
use std::fmt;
use std::str::FromStr;
use std::time::Instant;
use strata_core::{Context, Error, Handler, Result};
use tracing::{debug, info, warn, Level};

/// Logger configuration
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LoggerConfig {
    /// Level of the per-request event
    pub level: String,
    /// Paths that are never logged (e.g. health probes)
    pub skip_paths: Vec<String>,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            skip_paths: Vec::new(),
        }
    }
}

/// Emits one structured event per request once the rest of the chain has run
#[derive(Clone)]
pub struct Logger {
    config: LoggerConfig,
    level: Level,
}

impl Logger {
    /// Create a logger with default config
    pub fn new() -> Self {
        Self {
            config: LoggerConfig::default(),
            level: Level::INFO,
        }
    }

    /// Create a logger with custom config
    pub fn with_config(config: LoggerConfig) -> Result<Self> {
        let level = Level::from_str(&config.level)
            .map_err(|_| Error::Config(format!("invalid log level '{}'", config.level)))?;
        Ok(Self { config, level })
    }

    fn should_skip(&self, path: &str) -> bool {
        self.config.skip_paths.iter().any(|p| p == path)
    }
}

impl Default for Logger {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Logger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Logger")
            .field("level", &self.level)
            .field("skip_paths", &self.config.skip_paths)
            .finish()
    }
}

impl Handler for Logger {
    fn handle(&self, ctx: &mut Context) {
        if self.should_skip(&ctx.path) {
            return;
        }

        let start = Instant::now();
        ctx.next();
        let latency_ms = start.elapsed().as_secs_f64() * 1000.0;

        let status = ctx.status().map(|s| s.as_u16()).unwrap_or(200);
        let errors = ctx.errors().len();

        match self.level {
            Level::TRACE | Level::DEBUG => debug!(
                request_id = %ctx.request_id,
                method = %ctx.method,
                path = %ctx.path,
                status,
                latency_ms,
                errors,
                "Request completed"
            ),
            Level::INFO => info!(
                request_id = %ctx.request_id,
                method = %ctx.method,
                path = %ctx.path,
                status,
                latency_ms,
                errors,
                "Request completed"
            ),
            _ => warn!(
                request_id = %ctx.request_id,
                method = %ctx.method,
                path = %ctx.path,
                status,
                latency_ms,
                errors,
                "Request completed"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use strata_core::{handler_fn, BoxedHandler, StatusCode};

    fn counting_chain(logger: Logger, hits: Arc<AtomicUsize>) -> Arc<[BoxedHandler]> {
        Arc::from(vec![
            Arc::new(logger) as BoxedHandler,
            handler_fn(move |ctx| {
                hits.fetch_add(1, Ordering::SeqCst);
                ctx.set_status(StatusCode::ACCEPTED);
            }),
        ])
    }

    #[test]
    fn test_logger_runs_downstream() {
        let hits = Arc::new(AtomicUsize::new(0));
        let mut ctx = Context::new();
        ctx.run_chain(counting_chain(Logger::new(), Arc::clone(&hits)));

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(ctx.status(), Some(StatusCode::ACCEPTED));
    }

    #[test]
    fn test_skipped_path_still_continues() {
        let logger = Logger::with_config(LoggerConfig {
            level: "debug".to_string(),
            skip_paths: vec!["/healthz".to_string()],
        })
        .unwrap();

        let hits = Arc::new(AtomicUsize::new(0));
        let mut ctx = Context::request(strata_core::Method::GET, "/healthz");
        ctx.run_chain(counting_chain(logger, Arc::clone(&hits)));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_invalid_level_rejected() {
        let err = Logger::with_config(LoggerConfig {
            level: "loud".to_string(),
            skip_paths: Vec::new(),
        })
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
