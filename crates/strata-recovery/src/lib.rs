//! # Strata Recovery
//!
//! Error classification and automatic recovery with:
//! - Static and learned error classification
//! - Priority-ordered recovery strategies (retry, fallback, circuit-break, ignore, escalate)
//! - Exponential backoff bounded by a total-time ceiling
//! - Named circuit breakers per protected boundary
//! - Running recovery statistics

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub
)]

pub mod circuit_breaker;
pub mod classifier;
pub mod engine;
pub mod stats;
pub mod strategy;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerMetrics, CircuitBreakerRegistry,
    CircuitState, GLOBAL_BREAKER,
};
pub use classifier::{
    ClassificationSource, ClassifierStats, ErrorCategory, ErrorClassification, ErrorClassifier,
    LearnedRule, Severity,
};
pub use engine::{
    Escalation, EscalationNotifier, RecoveryEngine, RecoveryEngineBuilder, RecoveryResult,
    RecoverySummary, TracingNotifier, BOUNDARY_KEY,
};
pub use stats::{RecoveryStats, StrategyStats};
pub use strategy::{
    default_strategies, CategoryCondition, FallbackFn, RecoveryAction, RecoveryCondition,
    RecoveryStrategy, RetryPolicy, RetryableCondition, SeverityCondition, MAX_RETRY_DELAY,
};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry};
    pub use crate::classifier::{ErrorCategory, ErrorClassification, ErrorClassifier, Severity};
    pub use crate::engine::{EscalationNotifier, RecoveryEngine, RecoveryResult, BOUNDARY_KEY};
    pub use crate::strategy::{
        CategoryCondition, RecoveryAction, RecoveryCondition, RecoveryStrategy, RetryPolicy,
        RetryableCondition, SeverityCondition,
    };
}
