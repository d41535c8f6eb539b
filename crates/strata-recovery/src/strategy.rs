//! Recovery strategies and the conditions that select them

use crate::classifier::{ErrorCategory, ErrorClassification, Severity};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use strata_core::{Context, Error, Result, SharedError};

/// Priority of severity conditions
pub const SEVERITY_PRIORITY: i32 = 80;
/// Priority of category conditions
pub const CATEGORY_PRIORITY: i32 = 50;
/// Priority of retryable-only conditions
pub const RETRYABLE_PRIORITY: i32 = 30;

/// Upper bound on a single backoff delay
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(60 * 60);

/// Decides whether a strategy applies to a classified error
pub trait RecoveryCondition: Send + Sync + fmt::Debug {
    /// Whether the owning strategy should handle this error
    fn should_recover(&self, classification: &ErrorClassification, ctx: &Context) -> bool;

    /// Higher is evaluated first
    fn priority(&self) -> i32;

    /// Human-readable description
    fn describe(&self) -> String;
}

/// Matches errors at or above a severity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeverityCondition {
    min: Severity,
}

impl SeverityCondition {
    /// Match `min` and anything more severe
    pub fn at_least(min: Severity) -> Self {
        Self { min }
    }
}

impl RecoveryCondition for SeverityCondition {
    fn should_recover(&self, classification: &ErrorClassification, _ctx: &Context) -> bool {
        classification.severity >= self.min
    }

    fn priority(&self) -> i32 {
        SEVERITY_PRIORITY
    }

    fn describe(&self) -> String {
        format!("severity >= {}", self.min)
    }
}

/// Matches errors in any of a set of categories
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CategoryCondition {
    categories: Vec<ErrorCategory>,
}

impl CategoryCondition {
    /// Match a single category
    pub fn new(category: ErrorCategory) -> Self {
        Self {
            categories: vec![category],
        }
    }

    /// Match any of `categories`
    pub fn any_of(categories: impl IntoIterator<Item = ErrorCategory>) -> Self {
        Self {
            categories: categories.into_iter().collect(),
        }
    }
}

impl RecoveryCondition for CategoryCondition {
    fn should_recover(&self, classification: &ErrorClassification, _ctx: &Context) -> bool {
        self.categories.contains(&classification.category)
    }

    fn priority(&self) -> i32 {
        CATEGORY_PRIORITY
    }

    fn describe(&self) -> String {
        let names: Vec<&str> = self.categories.iter().map(|c| c.name()).collect();
        format!("category in [{}]", names.join(","))
    }
}

/// Matches on the retryable flag alone
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryableCondition {
    retryable: bool,
}

impl RetryableCondition {
    /// Match errors whose retryable flag equals `retryable`
    pub fn new(retryable: bool) -> Self {
        Self { retryable }
    }
}

impl RecoveryCondition for RetryableCondition {
    fn should_recover(&self, classification: &ErrorClassification, _ctx: &Context) -> bool {
        classification.retryable == self.retryable
    }

    fn priority(&self) -> i32 {
        RETRYABLE_PRIORITY
    }

    fn describe(&self) -> String {
        format!("retryable == {}", self.retryable)
    }
}

/// What a strategy does with an error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum RecoveryAction {
    /// Re-run the failed operation with backoff
    Retry = 0,
    /// Run a fallback, or answer 503
    Fallback = 1,
    /// Fail fast and count against the breaker
    CircuitBreak = 2,
    /// Treat as handled and drop the error
    Ignore = 3,
    /// Treat as handled and notify out of band
    Escalate = 4,
}

impl RecoveryAction {
    /// Every action
    pub const ALL: [RecoveryAction; 5] = [
        RecoveryAction::Retry,
        RecoveryAction::Fallback,
        RecoveryAction::CircuitBreak,
        RecoveryAction::Ignore,
        RecoveryAction::Escalate,
    ];

    /// Action name
    pub const fn name(self) -> &'static str {
        match self {
            RecoveryAction::Retry => "retry",
            RecoveryAction::Fallback => "fallback",
            RecoveryAction::CircuitBreak => "circuit_break",
            RecoveryAction::Ignore => "ignore",
            RecoveryAction::Escalate => "escalate",
        }
    }

    pub(crate) const fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for RecoveryAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for RecoveryAction {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.to_ascii_lowercase().replace('-', "_");
        RecoveryAction::ALL
            .into_iter()
            .find(|a| a.name() == normalized)
            .ok_or_else(|| Error::not_found("recovery action", s))
    }
}

/// Retry parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum attempts
    pub max_retries: u32,
    /// Delay before the second attempt
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// Multiplier applied to the delay after each attempt
    pub backoff_factor: f64,
    /// Ceiling on total retry time; zero disables it
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl RetryPolicy {
    /// Create a policy with the default 30s ceiling
    pub fn new(max_retries: u32, interval: Duration, backoff_factor: f64) -> Self {
        Self {
            max_retries,
            interval,
            backoff_factor,
            timeout: Duration::from_secs(30),
        }
    }

    /// Set the total-time ceiling
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Delays slept between consecutive attempts, in order
    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        (1..self.max_retries).scan(self.interval.min(MAX_RETRY_DELAY), move |delay, _| {
            let current = *delay;
            *delay = self.next_delay(current);
            Some(current)
        })
    }

    /// Delay following `delay`, capped at [`MAX_RETRY_DELAY`]
    pub fn next_delay(&self, delay: Duration) -> Duration {
        let factor = if self.backoff_factor.is_nan() {
            1.0
        } else {
            self.backoff_factor.max(1.0)
        };
        Duration::try_from_secs_f64(delay.as_secs_f64() * factor)
            .map_or(MAX_RETRY_DELAY, |next| next.min(MAX_RETRY_DELAY))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(1), 2.0)
    }
}

/// Custom fallback; `Ok` means the error was handled
pub type FallbackFn =
    Arc<dyn Fn(&mut Context, &SharedError) -> std::result::Result<(), SharedError> + Send + Sync>;

/// A named, conditionally selected recovery policy
#[derive(Clone)]
pub struct RecoveryStrategy {
    /// Unique name
    pub name: String,
    /// Selection condition
    pub condition: Arc<dyn RecoveryCondition>,
    /// Action to run
    pub action: RecoveryAction,
    /// Retry parameters, used by [`RecoveryAction::Retry`]
    pub retry: RetryPolicy,
    /// Custom fallback, used by [`RecoveryAction::Fallback`]
    pub fallback: Option<FallbackFn>,
}

impl RecoveryStrategy {
    /// Create a strategy with the default retry policy and no fallback
    pub fn new<C>(name: impl Into<String>, condition: C, action: RecoveryAction) -> Self
    where
        C: RecoveryCondition + 'static,
    {
        Self {
            name: name.into(),
            condition: Arc::new(condition),
            action,
            retry: RetryPolicy::default(),
            fallback: None,
        }
    }

    /// Set the retry policy
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set a fallback
    pub fn with_fallback<F>(mut self, fallback: F) -> Self
    where
        F: Fn(&mut Context, &SharedError) -> std::result::Result<(), SharedError>
            + Send
            + Sync
            + 'static,
    {
        self.fallback = Some(Arc::new(fallback));
        self
    }

    /// Priority of the strategy's condition
    pub fn priority(&self) -> i32 {
        self.condition.priority()
    }

    /// Whether this strategy handles the error
    pub fn matches(&self, classification: &ErrorClassification, ctx: &Context) -> bool {
        self.condition.should_recover(classification, ctx)
    }
}

impl fmt::Debug for RecoveryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecoveryStrategy")
            .field("name", &self.name)
            .field("condition", &self.condition.describe())
            .field("priority", &self.priority())
            .field("action", &self.action)
            .field("retry", &self.retry)
            .field("fallback", &self.fallback.is_some())
            .finish()
    }
}

/// Strategies installed when an engine is built with defaults
pub fn default_strategies() -> Vec<RecoveryStrategy> {
    let retry = |category, name: &str, max, interval_secs, factor| {
        RecoveryStrategy::new(name, CategoryCondition::new(category), RecoveryAction::Retry)
            .with_retry(RetryPolicy::new(max, Duration::from_secs(interval_secs), factor))
    };

    vec![
        retry(ErrorCategory::Timeout, "timeout_retry", 3, 1, 1.5),
        retry(ErrorCategory::Network, "network_retry", 3, 2, 2.0),
        retry(ErrorCategory::Database, "database_retry", 2, 3, 1.5),
        retry(ErrorCategory::RateLimit, "rate_limit_retry", 5, 5, 1.2),
        RecoveryStrategy::new(
            "business_ignore",
            CategoryCondition::new(ErrorCategory::Business),
            RecoveryAction::Ignore,
        ),
        RecoveryStrategy::new(
            "critical_escalate",
            SeverityCondition::at_least(Severity::Critical),
            RecoveryAction::Escalate,
        ),
        RecoveryStrategy::new(
            "external_fallback",
            CategoryCondition::new(ErrorCategory::External),
            RecoveryAction::Fallback,
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::ClassificationSource;

    fn classification(category: ErrorCategory, severity: Severity) -> ErrorClassification {
        ErrorClassification {
            category,
            severity,
            retryable: category.default_retryable(),
            confidence: 1.0,
            source: ClassificationSource::Typed,
            signature: String::new(),
        }
    }

    #[test]
    fn test_condition_priorities() {
        assert_eq!(SeverityCondition::at_least(Severity::High).priority(), 80);
        assert_eq!(CategoryCondition::new(ErrorCategory::Network).priority(), 50);
        assert_eq!(RetryableCondition::new(true).priority(), 30);
    }

    #[test]
    fn test_conditions_match() {
        let ctx = Context::new();
        let critical_network = classification(ErrorCategory::Network, Severity::Critical);

        assert!(SeverityCondition::at_least(Severity::High).should_recover(&critical_network, &ctx));
        assert!(CategoryCondition::any_of([ErrorCategory::Timeout, ErrorCategory::Network])
            .should_recover(&critical_network, &ctx));
        assert!(RetryableCondition::new(true).should_recover(&critical_network, &ctx));
        assert!(!RetryableCondition::new(false).should_recover(&critical_network, &ctx));

        let low = classification(ErrorCategory::Business, Severity::Low);
        assert!(!SeverityCondition::at_least(Severity::Medium).should_recover(&low, &ctx));
    }

    #[test]
    fn test_backoff_schedule() {
        let policy = RetryPolicy::new(3, Duration::from_secs(1), 2.0);
        let delays: Vec<Duration> = policy.delays().collect();
        assert_eq!(delays, vec![Duration::from_secs(1), Duration::from_secs(2)]);

        let single = RetryPolicy::new(1, Duration::from_secs(1), 2.0);
        assert_eq!(single.delays().count(), 0);
    }

    #[test]
    fn test_backoff_schedule_saturates() {
        let infinite = RetryPolicy::new(4, Duration::from_millis(1), f64::INFINITY);
        let delays: Vec<Duration> = infinite.delays().collect();
        assert_eq!(
            delays,
            vec![Duration::from_millis(1), MAX_RETRY_DELAY, MAX_RETRY_DELAY]
        );

        let huge = RetryPolicy::new(3, Duration::from_secs(1), 1e20);
        assert_eq!(huge.next_delay(Duration::from_secs(1)), MAX_RETRY_DELAY);

        let nan = RetryPolicy::new(3, Duration::from_secs(1), f64::NAN);
        assert_eq!(nan.next_delay(Duration::from_secs(1)), Duration::from_secs(1));
    }

    #[test]
    fn test_default_strategy_set() {
        let strategies = default_strategies();
        let names: Vec<&str> = strategies.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "timeout_retry",
                "network_retry",
                "database_retry",
                "rate_limit_retry",
                "business_ignore",
                "critical_escalate",
                "external_fallback",
            ]
        );

        let rate_limit = &strategies[3];
        assert_eq!(rate_limit.retry.max_retries, 5);
        assert_eq!(rate_limit.retry.interval, Duration::from_secs(5));
        assert!((rate_limit.retry.backoff_factor - 1.2).abs() < f64::EPSILON);
        assert_eq!(strategies[5].priority(), SEVERITY_PRIORITY);
    }

    #[test]
    fn test_action_parsing() {
        assert_eq!("circuit-break".parse::<RecoveryAction>().unwrap(), RecoveryAction::CircuitBreak);
        assert_eq!("Escalate".parse::<RecoveryAction>().unwrap(), RecoveryAction::Escalate);
        assert!("panic".parse::<RecoveryAction>().is_err());
    }
}
