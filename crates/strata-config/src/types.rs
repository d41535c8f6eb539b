//! Configuration types

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Pipeline manager
    pub pipeline: PipelineConfig,

    /// Builtin middleware instantiations, applied in order
    pub middleware: Vec<MiddlewareConfig>,

    /// Recovery engine
    pub recovery: RecoveryConfig,

    /// Circuit breakers
    pub circuit_breaker: CircuitBreakerConfig,

    /// Logging
    pub logging: LoggingConfig,
}

/// Pipeline manager configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PipelineConfig {
    /// Periodically warm the chain cache
    pub auto_recompile: bool,

    /// Cache warm-up period
    #[serde(with = "humantime_serde")]
    pub compile_interval: Duration,

    /// Periodically check pipeline health
    pub health_check: bool,

    /// Health-check period
    #[serde(with = "humantime_serde")]
    pub health_check_interval: Duration,

    /// Cache hit-rate below which the cache is flagged as degraded
    pub min_cache_hit_rate: f64,

    /// Execution error-rate above which the pipeline is flagged as degraded
    pub max_error_rate: f64,

    /// Layer combinations compiled by the warm-up loop
    pub warm_layer_sets: Vec<Vec<String>>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let sets: [&[&str]; 4] = [
            &["global"],
            &["global", "group"],
            &["global", "group", "route"],
            &["global", "group", "route", "controller"],
        ];
        Self {
            auto_recompile: true,
            compile_interval: Duration::from_secs(300),
            health_check: true,
            health_check_interval: Duration::from_secs(60),
            min_cache_hit_rate: 0.5,
            max_error_rate: 0.1,
            warm_layer_sets: sets
                .iter()
                .map(|set| set.iter().map(|l| l.to_string()).collect())
                .collect(),
        }
    }
}

/// One builtin middleware placed in a layer
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MiddlewareConfig {
    /// Layer name (global, group, route, controller)
    pub layer: String,

    /// Entry name inside the layer
    pub name: String,

    /// Builtin to instantiate; defaults to `name`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub builtin: Option<String>,

    /// Lower runs first
    #[serde(default)]
    pub priority: i32,

    /// Disabled entries are registered but skipped
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Builtin-specific configuration
    #[serde(default)]
    pub config: serde_json::Value,
}

impl MiddlewareConfig {
    /// Create an enabled entry for the builtin `name`
    pub fn new(layer: impl Into<String>, name: impl Into<String>, priority: i32) -> Self {
        Self {
            layer: layer.into(),
            name: name.into(),
            builtin: None,
            priority,
            enabled: true,
            config: serde_json::Value::Null,
        }
    }

    /// Builtin this entry instantiates
    pub fn builtin_name(&self) -> &str {
        self.builtin.as_deref().unwrap_or(&self.name)
    }
}

/// Recovery engine configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Recovery on or off
    pub enabled: bool,

    /// Install the default strategy set
    pub use_default_strategies: bool,

    /// Additional strategies
    pub strategies: Vec<StrategyConfig>,

    /// Classification rules preloaded into the classifier
    pub learned_rules: Vec<LearnedRuleConfig>,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            use_default_strategies: true,
            strategies: Vec::new(),
            learned_rules: Vec::new(),
        }
    }
}

/// Strategy selection condition
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ConditionConfig {
    /// Match an error category
    Category(String),
    /// Match a minimum severity
    Severity(String),
    /// Match the retryable flag
    Retryable(bool),
}

/// A recovery strategy
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StrategyConfig {
    /// Unique strategy name
    pub name: String,

    /// Selection condition
    pub condition: ConditionConfig,

    /// Action name (retry, fallback, circuit_break, ignore, escalate)
    pub action: String,

    /// Maximum retry attempts
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay before the second attempt
    #[serde(default = "default_retry_interval", with = "humantime_serde")]
    pub retry_interval: Duration,

    /// Delay multiplier per attempt
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,

    /// Ceiling on total retry time; zero disables it
    #[serde(default = "default_retry_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

/// A classification rule taught at startup
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LearnedRuleConfig {
    /// Example error message
    pub message: String,
    /// Category name
    pub category: String,
    /// Severity name
    pub severity: String,
}

/// Settings for one circuit breaker
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BreakerSettings {
    /// Failures that open the circuit
    pub max_failures: u32,

    /// Time the circuit stays open
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,

    /// Allow exactly one half-open probe at a time
    pub single_probe: bool,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            max_failures: 10,
            timeout: Duration::from_secs(30),
            single_probe: false,
        }
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Failures that open the circuit
    pub max_failures: u32,

    /// Time the circuit stays open
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,

    /// Allow exactly one half-open probe at a time
    pub single_probe: bool,

    /// Per-boundary overrides
    pub boundaries: BTreeMap<String, BreakerSettings>,
}

impl CircuitBreakerConfig {
    /// Settings used by breakers without an override
    pub fn defaults(&self) -> BreakerSettings {
        BreakerSettings {
            max_failures: self.max_failures,
            timeout: self.timeout,
            single_probe: self.single_probe,
        }
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        let defaults = BreakerSettings::default();
        Self {
            max_failures: defaults.max_failures,
            timeout: defaults.timeout,
            single_probe: defaults.single_probe,
            boundaries: BTreeMap::new(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by `RUST_LOG`
    pub level: String,

    /// Output format
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable
    #[default]
    Pretty,
    /// One JSON object per line
    Json,
}

fn default_true() -> bool {
    true
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_backoff_factor() -> f64 {
    2.0
}

fn default_retry_timeout() -> Duration {
    Duration::from_secs(30)
}
