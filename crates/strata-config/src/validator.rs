//! Configuration validation

use crate::types::{BreakerSettings, ConditionConfig, StrategyConfig};
use crate::Config;
use std::collections::HashSet;
use std::str::FromStr;
use strata_core::{Error, Result};
use strata_middleware::Layer;
use strata_recovery::{default_strategies, ErrorCategory, RecoveryAction, Severity};

/// Validate configuration
pub fn validate_config(config: &Config) -> Result<()> {
    validate_pipeline(config)?;
    validate_middleware(config)?;
    validate_recovery(config)?;
    validate_circuit_breaker(config)?;
    validate_logging(config)?;

    Ok(())
}

fn parse<T: FromStr>(what: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| Error::Config(format!("unknown {what} '{value}'")))
}

fn validate_rate(name: &str, rate: f64) -> Result<()> {
    if !(0.0..=1.0).contains(&rate) {
        return Err(Error::Config(format!("{name} must be within [0, 1], got {rate}")));
    }
    Ok(())
}

fn validate_pipeline(config: &Config) -> Result<()> {
    let pipeline = &config.pipeline;

    if pipeline.compile_interval.is_zero() {
        return Err(Error::Config("pipeline.compile_interval must be > 0".to_string()));
    }
    if pipeline.health_check_interval.is_zero() {
        return Err(Error::Config(
            "pipeline.health_check_interval must be > 0".to_string(),
        ));
    }

    validate_rate("pipeline.min_cache_hit_rate", pipeline.min_cache_hit_rate)?;
    validate_rate("pipeline.max_error_rate", pipeline.max_error_rate)?;

    for set in &pipeline.warm_layer_sets {
        if set.is_empty() {
            return Err(Error::Config(
                "pipeline.warm_layer_sets entries cannot be empty".to_string(),
            ));
        }
        for layer in set {
            parse::<Layer>("layer", layer)?;
        }
    }

    Ok(())
}

fn validate_middleware(config: &Config) -> Result<()> {
    let mut seen = HashSet::new();

    for entry in &config.middleware {
        if entry.name.is_empty() {
            return Err(Error::Config("middleware name cannot be empty".to_string()));
        }
        if entry.builtin.as_deref() == Some("") {
            return Err(Error::Config(format!(
                "middleware '{}' has an empty builtin name",
                entry.name
            )));
        }

        let layer = parse::<Layer>("layer", &entry.layer)?;
        if !seen.insert((layer, entry.name.as_str())) {
            return Err(Error::Config(format!(
                "middleware '{}' is declared twice in layer {layer}",
                entry.name
            )));
        }
    }

    Ok(())
}

fn validate_recovery(config: &Config) -> Result<()> {
    let recovery = &config.recovery;

    let mut names: HashSet<String> = if recovery.use_default_strategies {
        default_strategies().into_iter().map(|s| s.name).collect()
    } else {
        HashSet::new()
    };

    for strategy in &recovery.strategies {
        validate_strategy(strategy)?;
        if !names.insert(strategy.name.clone()) {
            return Err(Error::Config(format!(
                "recovery strategy '{}' is defined twice",
                strategy.name
            )));
        }
    }

    for rule in &recovery.learned_rules {
        if rule.message.trim().is_empty() {
            return Err(Error::Config(
                "learned rule message cannot be empty".to_string(),
            ));
        }
        parse::<ErrorCategory>("category", &rule.category)?;
        parse::<Severity>("severity", &rule.severity)?;
    }

    if !recovery.enabled {
        tracing::warn!("Recovery is disabled; errors will not be recovered");
    }

    Ok(())
}

fn validate_strategy(strategy: &StrategyConfig) -> Result<()> {
    if strategy.name.is_empty() {
        return Err(Error::Config("recovery strategy name cannot be empty".to_string()));
    }

    match &strategy.condition {
        ConditionConfig::Category(category) => {
            parse::<ErrorCategory>("category", category)?;
        }
        ConditionConfig::Severity(severity) => {
            parse::<Severity>("severity", severity)?;
        }
        ConditionConfig::Retryable(_) => {}
    }

    let action = parse::<RecoveryAction>("action", &strategy.action)?;
    if action == RecoveryAction::Retry {
        if strategy.retry_interval.is_zero() {
            return Err(Error::Config(format!(
                "strategy '{}': retry_interval must be > 0",
                strategy.name
            )));
        }
        if strategy.max_retries == 0 {
            return Err(Error::Config(format!(
                "strategy '{}': max_retries must be > 0",
                strategy.name
            )));
        }
    }

    if !strategy.backoff_factor.is_finite() || strategy.backoff_factor < 1.0 {
        return Err(Error::Config(format!(
            "strategy '{}': backoff_factor must be finite and >= 1.0, got {}",
            strategy.name, strategy.backoff_factor
        )));
    }

    Ok(())
}

fn validate_breaker(name: &str, settings: &BreakerSettings) -> Result<()> {
    if settings.max_failures == 0 {
        return Err(Error::Config(format!("{name}: max_failures must be > 0")));
    }
    if settings.timeout.is_zero() {
        return Err(Error::Config(format!("{name}: timeout must be > 0")));
    }
    Ok(())
}

fn validate_circuit_breaker(config: &Config) -> Result<()> {
    let breakers = &config.circuit_breaker;
    validate_breaker("circuit_breaker", &breakers.defaults())?;

    for (boundary, settings) in &breakers.boundaries {
        if boundary.is_empty() {
            return Err(Error::Config("circuit breaker boundary name cannot be empty".to_string()));
        }
        validate_breaker(&format!("circuit_breaker.boundaries.{boundary}"), settings)?;
    }

    Ok(())
}

fn validate_logging(config: &Config) -> Result<()> {
    if config.logging.level.trim().is_empty() {
        return Err(Error::Config("logging.level cannot be empty".to_string()));
    }
    Ok(())
}
