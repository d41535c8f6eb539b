//! Configuration builder

use crate::types::{
    BreakerSettings, Config, LearnedRuleConfig, LogFormat, MiddlewareConfig, PipelineConfig,
    StrategyConfig,
};
use std::time::Duration;

/// Builder for constructing configuration programmatically
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Create a new configuration builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the pipeline section
    pub fn pipeline(mut self, pipeline: PipelineConfig) -> Self {
        self.config.pipeline = pipeline;
        self
    }

    /// Enable or disable both maintenance loops
    pub fn maintenance(mut self, enabled: bool) -> Self {
        self.config.pipeline.auto_recompile = enabled;
        self.config.pipeline.health_check = enabled;
        self
    }

    /// Add a middleware entry
    pub fn middleware(mut self, entry: MiddlewareConfig) -> Self {
        self.config.middleware.push(entry);
        self
    }

    /// Place the builtin `name` in `layer` with default config
    pub fn use_builtin(self, layer: &str, name: &str, priority: i32) -> Self {
        self.middleware(MiddlewareConfig::new(layer, name, priority))
    }

    /// Turn recovery on or off
    pub fn recovery_enabled(mut self, enabled: bool) -> Self {
        self.config.recovery.enabled = enabled;
        self
    }

    /// Install the default strategy set or not
    pub fn default_strategies(mut self, enabled: bool) -> Self {
        self.config.recovery.use_default_strategies = enabled;
        self
    }

    /// Add a recovery strategy
    pub fn strategy(mut self, strategy: StrategyConfig) -> Self {
        self.config.recovery.strategies.push(strategy);
        self
    }

    /// Preload a classification rule
    pub fn learned_rule(mut self, message: &str, category: &str, severity: &str) -> Self {
        self.config.recovery.learned_rules.push(LearnedRuleConfig {
            message: message.to_string(),
            category: category.to_string(),
            severity: severity.to_string(),
        });
        self
    }

    /// Set the default breaker thresholds
    pub fn circuit_breaker(mut self, max_failures: u32, timeout: Duration) -> Self {
        self.config.circuit_breaker.max_failures = max_failures;
        self.config.circuit_breaker.timeout = timeout;
        self
    }

    /// Override breaker settings for one boundary
    pub fn boundary(mut self, name: &str, settings: BreakerSettings) -> Self {
        self.config
            .circuit_breaker
            .boundaries
            .insert(name.to_string(), settings);
        self
    }

    /// Set the log filter and format
    pub fn logging(mut self, level: &str, format: LogFormat) -> Self {
        self.config.logging.level = level.to_string();
        self.config.logging.format = format;
        self
    }

    /// Validate and build the configuration
    pub fn build(self) -> strata_core::Result<Config> {
        crate::validator::validate_config(&self.config)?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builder() {
        let config = ConfigBuilder::new()
            .maintenance(false)
            .use_builtin("global", "recovery", 5)
            .use_builtin("global", "logger", 10)
            .learned_rule("deadlock detected", "database", "high")
            .circuit_breaker(3, Duration::from_secs(5))
            .logging("debug", LogFormat::Json)
            .build()
            .unwrap();

        assert!(!config.pipeline.auto_recompile);
        assert_eq!(config.middleware.len(), 2);
        assert_eq!(config.middleware[0].name, "recovery");
        assert_eq!(config.recovery.learned_rules.len(), 1);
        assert_eq!(config.circuit_breaker.max_failures, 3);
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_builder_validates() {
        let result = ConfigBuilder::new()
            .use_builtin("everywhere", "logger", 10)
            .build();
        assert!(result.is_err());

        let result = ConfigBuilder::new()
            .circuit_breaker(0, Duration::from_secs(5))
            .build();
        assert!(result.is_err());
    }
}
