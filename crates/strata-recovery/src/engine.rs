//! Recovery engine
//!
//! [`RecoveryEngine::recover`] classifies an error, consults the circuit
//! breaker for the request's boundary, picks the highest-priority matching
//! strategy and runs its action. Strategies are kept in a priority-sorted
//! vector behind an [`ArcSwap`], so recovery never takes a lock to read them.

use crate::circuit_breaker::{CircuitBreakerRegistry, GLOBAL_BREAKER};
use crate::classifier::{ErrorCategory, ErrorClassification, ErrorClassifier, Severity};
use crate::stats::{RecoveryStats, StatsCollector};
use crate::strategy::{default_strategies, RecoveryAction, RecoveryStrategy, MAX_RETRY_DELAY};
use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::error::Error as StdError;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use strata_core::{responses, Context, Error, Result, RetryOperation, SharedError};
use tracing::{debug, error, info, warn};

/// Context key naming the circuit breaker a request is guarded by
pub const BOUNDARY_KEY: &str = "recovery.boundary";

/// An error handed to the escalation hook
#[derive(Debug, Clone)]
pub struct Escalation {
    /// Strategy that escalated
    pub strategy: String,
    /// Request the error belongs to
    pub request_id: String,
    /// Request path
    pub path: String,
    /// How the error was classified
    pub classification: ErrorClassification,
    /// The escalated error
    pub error: SharedError,
}

/// Out-of-band hook invoked by the escalate action
#[cfg_attr(test, mockall::automock)]
pub trait EscalationNotifier: Send + Sync {
    /// Deliver an escalation
    fn notify(&self, escalation: &Escalation);
}

/// Notifier that logs escalations at `error` level
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingNotifier;

impl EscalationNotifier for TracingNotifier {
    fn notify(&self, escalation: &Escalation) {
        error!(
            strategy = %escalation.strategy,
            request_id = %escalation.request_id,
            path = %escalation.path,
            category = %escalation.classification.category,
            severity = %escalation.classification.severity,
            error = %escalation.error,
            "Error escalated"
        );
    }
}

/// Outcome of one [`RecoveryEngine::recover`] call
#[derive(Debug)]
pub struct RecoveryResult {
    /// Error recovery was asked to handle
    pub original_error: SharedError,
    /// Classification, absent when recovery is disabled
    pub classification: Option<ErrorClassification>,
    /// Selected strategy
    pub strategy_name: Option<String>,
    /// Action taken
    pub action: RecoveryAction,
    /// Operation attempts made by the retry action
    pub attempt_count: u32,
    /// Delays slept between retry attempts
    pub backoff_delays: Vec<Duration>,
    /// Whether the error counts as handled
    pub success: bool,
    /// Error left after recovery. Set on failure, and on escalation.
    pub final_error: Option<Error>,
    /// Time spent recovering
    pub duration: Duration,
    /// When recovery finished
    pub recovered_at: DateTime<Utc>,
}

impl RecoveryResult {
    /// Serializable summary
    pub fn summary(&self) -> RecoverySummary {
        RecoverySummary {
            original_error: self.original_error.to_string(),
            classification: self.classification.clone(),
            strategy: self.strategy_name.clone(),
            action: self.action,
            attempts: self.attempt_count,
            backoff_delays_ms: self
                .backoff_delays
                .iter()
                .map(|d| d.as_millis() as u64)
                .collect(),
            success: self.success,
            final_error: self.final_error.as_ref().map(ToString::to_string),
            duration: self.duration,
            recovered_at: self.recovered_at,
        }
    }
}

/// Serializable view of a [`RecoveryResult`]
#[derive(Debug, Clone, Serialize)]
pub struct RecoverySummary {
    /// Original error message
    pub original_error: String,
    /// Classification
    pub classification: Option<ErrorClassification>,
    /// Selected strategy
    pub strategy: Option<String>,
    /// Action taken
    pub action: RecoveryAction,
    /// Retry attempts
    pub attempts: u32,
    /// Backoff delays in milliseconds
    pub backoff_delays_ms: Vec<u64>,
    /// Handled
    pub success: bool,
    /// Final error message
    pub final_error: Option<String>,
    /// Time spent recovering
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
    /// Completion time
    pub recovered_at: DateTime<Utc>,
}

struct Outcome {
    attempts: u32,
    delays: Vec<Duration>,
    success: bool,
    final_error: Option<Error>,
}

impl Outcome {
    fn handled() -> Self {
        Self {
            attempts: 0,
            delays: Vec::new(),
            success: true,
            final_error: None,
        }
    }

    fn failed(attempts: u32, err: Error) -> Self {
        Self {
            attempts,
            delays: Vec::new(),
            success: false,
            final_error: Some(err),
        }
    }
}

/// Classifies errors and runs recovery strategies
pub struct RecoveryEngine {
    enabled: AtomicBool,
    classifier: Arc<ErrorClassifier>,
    strategies: ArcSwap<Vec<Arc<RecoveryStrategy>>>,
    writer: Mutex<()>,
    breakers: Arc<CircuitBreakerRegistry>,
    notifier: Arc<dyn EscalationNotifier>,
    stats: StatsCollector,
}

impl RecoveryEngine {
    /// Create an enabled engine with the default strategy set
    pub fn new() -> Self {
        let strategies = sorted(default_strategies().into_iter().map(Arc::new).collect());
        Self::from_parts(
            true,
            Arc::new(ErrorClassifier::new()),
            strategies,
            Arc::new(CircuitBreakerRegistry::default()),
            Arc::new(TracingNotifier),
        )
    }

    /// Start building a customised engine
    pub fn builder() -> RecoveryEngineBuilder {
        RecoveryEngineBuilder::default()
    }

    fn from_parts(
        enabled: bool,
        classifier: Arc<ErrorClassifier>,
        strategies: Vec<Arc<RecoveryStrategy>>,
        breakers: Arc<CircuitBreakerRegistry>,
        notifier: Arc<dyn EscalationNotifier>,
    ) -> Self {
        Self {
            enabled: AtomicBool::new(enabled),
            classifier,
            strategies: ArcSwap::from_pointee(strategies),
            writer: Mutex::new(()),
            breakers,
            notifier,
            stats: StatsCollector::new(),
        }
    }

    /// Register a strategy. Names are unique.
    pub fn add_strategy(&self, strategy: RecoveryStrategy) -> Result<()> {
        let _guard = self.writer.lock();
        let current = self.strategies.load();
        if current.iter().any(|s| s.name == strategy.name) {
            return Err(Error::already_registered("recovery strategy", strategy.name));
        }

        info!(
            strategy = %strategy.name,
            action = %strategy.action,
            priority = strategy.priority(),
            condition = %strategy.condition.describe(),
            "Recovery strategy added"
        );

        let mut next: Vec<Arc<RecoveryStrategy>> = current.iter().cloned().collect();
        next.push(Arc::new(strategy));
        self.strategies.store(Arc::new(sorted(next)));
        Ok(())
    }

    /// Strategy names in evaluation order
    pub fn strategies(&self) -> Vec<String> {
        self.strategies.load().iter().map(|s| s.name.clone()).collect()
    }

    /// Turn recovery on or off
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
        info!(enabled, "Recovery toggled");
    }

    /// Whether recovery is on
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// The classifier
    pub fn classifier(&self) -> &Arc<ErrorClassifier> {
        &self.classifier
    }

    /// The circuit breakers
    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    /// Classify an error without recovering it
    pub fn classify(
        &self,
        err: &(dyn StdError + 'static),
        ctx: Option<&Context>,
    ) -> ErrorClassification {
        self.classifier.classify(err, ctx)
    }

    /// Teach the classifier a correction
    pub fn learn(&self, err: &(dyn StdError + 'static), category: ErrorCategory, severity: Severity) {
        self.classifier.learn(err, category, severity);
    }

    /// Recover `err`, retrying with the context's retry operation if any
    pub fn recover(&self, ctx: &mut Context, err: SharedError) -> RecoveryResult {
        let operation = ctx.retry_operation();
        self.recover_with(ctx, err, operation)
    }

    /// Recover `err`, retrying with `operation`
    pub fn recover_with(
        &self,
        ctx: &mut Context,
        err: SharedError,
        operation: Option<RetryOperation>,
    ) -> RecoveryResult {
        let started = Instant::now();

        if !self.is_enabled() {
            return finish(err, None, None, RecoveryAction::Ignore, started, Outcome {
                success: false,
                ..Outcome::handled()
            });
        }

        let classification = self.classifier.classify_shared(&err, Some(ctx));
        let category = classification.category;

        let boundary = ctx.get_str(BOUNDARY_KEY).unwrap_or(GLOBAL_BREAKER).to_string();
        let breaker = self.breakers.get(&boundary);

        if !breaker.allow_request() {
            warn!(
                breaker = %boundary,
                request_id = %ctx.request_id,
                error = %err,
                "Recovery denied by open circuit"
            );
            let outcome = Outcome::failed(
                0,
                Error::CircuitOpen {
                    breaker: boundary,
                    source: Arc::clone(&err),
                },
            );
            let result = finish(
                err,
                Some(classification),
                None,
                RecoveryAction::CircuitBreak,
                started,
                outcome,
            );
            self.stats
                .record(result.action, Some(category), None, false, result.duration);
            return result;
        }

        let strategy = self
            .strategies
            .load()
            .iter()
            .find(|s| s.matches(&classification, ctx))
            .cloned();

        let Some(strategy) = strategy else {
            breaker.release_probe();
            debug!(category = %category, "No recovery strategy matched");
            let outcome = Outcome::failed(0, Error::not_found("recovery strategy", category.name()));
            let result = finish(
                err,
                Some(classification),
                None,
                RecoveryAction::Ignore,
                started,
                outcome,
            );
            self.stats
                .record(result.action, Some(category), None, false, result.duration);
            return result;
        };

        debug!(
            strategy = %strategy.name,
            action = %strategy.action,
            category = %category,
            severity = %classification.severity,
            "Recovery strategy selected"
        );

        let outcome = match strategy.action {
            RecoveryAction::Retry => self.retry(ctx, &strategy, &err, operation),
            RecoveryAction::Fallback => fallback(ctx, &strategy, &err),
            RecoveryAction::CircuitBreak => Outcome::failed(
                0,
                Error::CircuitOpen {
                    breaker: boundary.clone(),
                    source: Arc::clone(&err),
                },
            ),
            RecoveryAction::Ignore => Outcome::handled(),
            RecoveryAction::Escalate => {
                self.notifier.notify(&Escalation {
                    strategy: strategy.name.clone(),
                    request_id: ctx.request_id.clone(),
                    path: ctx.path.clone(),
                    classification: classification.clone(),
                    error: Arc::clone(&err),
                });
                Outcome {
                    final_error: Some(Error::Escalated {
                        strategy: strategy.name.clone(),
                        source: Arc::clone(&err),
                    }),
                    ..Outcome::handled()
                }
            }
        };

        if outcome.success {
            breaker.on_success();
        } else {
            breaker.on_failure();
        }

        let result = finish(
            err,
            Some(classification),
            Some(strategy.name.clone()),
            strategy.action,
            started,
            outcome,
        );
        self.stats.record(
            result.action,
            Some(category),
            Some(&strategy.name),
            result.success,
            result.duration,
        );
        result
    }

    fn retry(
        &self,
        ctx: &mut Context,
        strategy: &RecoveryStrategy,
        err: &SharedError,
        operation: Option<RetryOperation>,
    ) -> Outcome {
        let Some(operation) = operation else {
            debug!(strategy = %strategy.name, "No retry operation available");
            return Outcome::failed(
                0,
                Error::RecoveryExhausted {
                    strategy: strategy.name.clone(),
                    attempts: 0,
                    source: Arc::clone(err),
                },
            );
        };

        let policy = &strategy.retry;
        let started = Instant::now();
        let mut delay = policy.interval.min(MAX_RETRY_DELAY);
        let mut delays = Vec::new();
        let mut last_error = Arc::clone(err);
        let mut attempts = 0;

        while attempts < policy.max_retries {
            if attempts > 0 {
                if !policy.timeout.is_zero() && started.elapsed() + delay > policy.timeout {
                    debug!(
                        strategy = %strategy.name,
                        attempts,
                        timeout = ?policy.timeout,
                        "Retry timeout reached"
                    );
                    break;
                }
                std::thread::sleep(delay);
                delays.push(delay);
                delay = policy.next_delay(delay);
            }

            attempts += 1;
            match operation(ctx) {
                Ok(()) => {
                    info!(strategy = %strategy.name, attempts, "Retry succeeded");
                    return Outcome {
                        attempts,
                        delays,
                        success: true,
                        final_error: None,
                    };
                }
                Err(e) => {
                    debug!(strategy = %strategy.name, attempt = attempts, error = %e, "Retry attempt failed");
                    last_error = e;
                }
            }
        }

        warn!(
            strategy = %strategy.name,
            attempts,
            error = %last_error,
            "Retry budget exhausted"
        );
        Outcome {
            attempts,
            delays,
            success: false,
            final_error: Some(Error::RecoveryExhausted {
                strategy: strategy.name.clone(),
                attempts,
                source: last_error,
            }),
        }
    }

    /// Current recovery statistics
    pub fn stats(&self) -> RecoveryStats {
        self.stats.snapshot()
    }
}

impl Default for RecoveryEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RecoveryEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecoveryEngine")
            .field("enabled", &self.is_enabled())
            .field("strategies", &self.strategies())
            .field("classifier", &self.classifier)
            .field("breakers", &self.breakers)
            .finish_non_exhaustive()
    }
}

fn fallback(ctx: &mut Context, strategy: &RecoveryStrategy, err: &SharedError) -> Outcome {
    match &strategy.fallback {
        Some(fallback) => match fallback(ctx, err) {
            Ok(()) => Outcome::handled(),
            Err(e) => {
                warn!(strategy = %strategy.name, error = %e, "Fallback failed");
                Outcome::failed(
                    1,
                    Error::RecoveryExhausted {
                        strategy: strategy.name.clone(),
                        attempts: 1,
                        source: e,
                    },
                )
            }
        },
        None => {
            if !ctx.is_written() {
                responses::service_unavailable(ctx);
            }
            ctx.abort();
            Outcome::handled()
        }
    }
}

fn finish(
    err: SharedError,
    classification: Option<ErrorClassification>,
    strategy_name: Option<String>,
    action: RecoveryAction,
    started: Instant,
    outcome: Outcome,
) -> RecoveryResult {
    RecoveryResult {
        original_error: err,
        classification,
        strategy_name,
        action,
        attempt_count: outcome.attempts,
        backoff_delays: outcome.delays,
        success: outcome.success,
        final_error: outcome.final_error,
        duration: started.elapsed(),
        recovered_at: Utc::now(),
    }
}

/// Stable sort, highest priority first
fn sorted(mut strategies: Vec<Arc<RecoveryStrategy>>) -> Vec<Arc<RecoveryStrategy>> {
    strategies.sort_by_key(|s| std::cmp::Reverse(s.priority()));
    strategies
}

/// Builder for [`RecoveryEngine`]
pub struct RecoveryEngineBuilder {
    enabled: bool,
    use_defaults: bool,
    classifier: Option<Arc<ErrorClassifier>>,
    breakers: Option<Arc<CircuitBreakerRegistry>>,
    notifier: Option<Arc<dyn EscalationNotifier>>,
    strategies: Vec<RecoveryStrategy>,
}

impl Default for RecoveryEngineBuilder {
    fn default() -> Self {
        Self {
            enabled: true,
            use_defaults: true,
            classifier: None,
            breakers: None,
            notifier: None,
            strategies: Vec::new(),
        }
    }
}

impl RecoveryEngineBuilder {
    /// Start enabled or disabled
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Skip the default strategy set
    pub fn without_default_strategies(mut self) -> Self {
        self.use_defaults = false;
        self
    }

    /// Share an existing classifier
    pub fn classifier(mut self, classifier: Arc<ErrorClassifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    /// Share an existing breaker registry
    pub fn breakers(mut self, breakers: Arc<CircuitBreakerRegistry>) -> Self {
        self.breakers = Some(breakers);
        self
    }

    /// Replace the escalation hook
    pub fn notifier(mut self, notifier: Arc<dyn EscalationNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Add a strategy after the defaults
    pub fn strategy(mut self, strategy: RecoveryStrategy) -> Self {
        self.strategies.push(strategy);
        self
    }

    /// Build the engine. Fails on duplicate strategy names.
    pub fn build(self) -> Result<RecoveryEngine> {
        let engine = RecoveryEngine::from_parts(
            self.enabled,
            self.classifier.unwrap_or_default(),
            Vec::new(),
            self.breakers.unwrap_or_default(),
            self.notifier.unwrap_or_else(|| Arc::new(TracingNotifier)),
        );

        let defaults = if self.use_defaults {
            default_strategies()
        } else {
            Vec::new()
        };
        for strategy in defaults.into_iter().chain(self.strategies) {
            engine.add_strategy(strategy)?;
        }
        Ok(engine)
    }
}

impl fmt::Debug for RecoveryEngineBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecoveryEngineBuilder")
            .field("enabled", &self.enabled)
            .field("use_defaults", &self.use_defaults)
            .field("strategies", &self.strategies)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::CircuitBreakerConfig;
    use crate::strategy::{CategoryCondition, RetryPolicy, RetryableCondition, SeverityCondition};
    use proptest::prelude::*;
    use std::sync::atomic::AtomicU32;
    use strata_core::{Method, StatusCode};

    fn request() -> Context {
        Context::request(Method::GET, "/orders")
    }

    fn timeout_error() -> SharedError {
        Error::Timeout("upstream did not answer".into()).into_shared()
    }

    fn retry_engine(policy: RetryPolicy) -> RecoveryEngine {
        RecoveryEngine::builder()
            .without_default_strategies()
            .strategy(
                RecoveryStrategy::new(
                    "timeout_retry",
                    CategoryCondition::new(ErrorCategory::Timeout),
                    RecoveryAction::Retry,
                )
                .with_retry(policy),
            )
            .build()
            .unwrap()
    }

    fn always_failing() -> RetryOperation {
        Arc::new(|_ctx: &mut Context| -> Result<(), SharedError> { Err(timeout_error()) })
    }

    #[test]
    fn test_default_strategy_order() {
        let engine = RecoveryEngine::new();
        assert_eq!(
            engine.strategies(),
            vec![
                "critical_escalate",
                "timeout_retry",
                "network_retry",
                "database_retry",
                "rate_limit_retry",
                "business_ignore",
                "external_fallback",
            ]
        );
    }

    #[test]
    fn test_retry_backoff_law() {
        let engine = retry_engine(
            RetryPolicy::new(3, Duration::from_millis(10), 2.0).with_timeout(Duration::ZERO),
        );
        let mut ctx = request();

        let result = engine.recover_with(&mut ctx, timeout_error(), Some(always_failing()));

        assert_eq!(result.action, RecoveryAction::Retry);
        assert_eq!(result.attempt_count, 3);
        assert_eq!(
            result.backoff_delays,
            vec![Duration::from_millis(10), Duration::from_millis(20)]
        );
        assert!(!result.success);
        assert!(matches!(
            result.final_error,
            Some(Error::RecoveryExhausted { attempts: 3, .. })
        ));
    }

    #[test]
    fn test_retry_stops_on_first_success() {
        let engine = retry_engine(RetryPolicy::new(5, Duration::from_millis(1), 1.0));
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let mut ctx = request();
        ctx.set_retry_operation(move |_ctx: &mut Context| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(timeout_error())
            } else {
                Ok(())
            }
        });

        let result = engine.recover(&mut ctx, timeout_error());
        assert!(result.success);
        assert_eq!(result.attempt_count, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(result.final_error.is_none());
    }

    #[test]
    fn test_retry_without_operation() {
        let engine = retry_engine(RetryPolicy::default());
        let mut ctx = request();

        let result = engine.recover(&mut ctx, timeout_error());
        assert!(!result.success);
        assert_eq!(result.attempt_count, 0);
        assert!(matches!(
            result.final_error,
            Some(Error::RecoveryExhausted { attempts: 0, .. })
        ));
    }

    #[test]
    fn test_retry_timeout_is_a_ceiling() {
        let engine = retry_engine(
            RetryPolicy::new(10, Duration::from_millis(30), 1.0)
                .with_timeout(Duration::from_millis(100)),
        );
        let mut ctx = request();

        let result = engine.recover_with(&mut ctx, timeout_error(), Some(always_failing()));

        assert!(!result.success);
        assert!(result.attempt_count >= 2);
        assert!(result.attempt_count < 10);
        let slept: Duration = result.backoff_delays.iter().sum();
        assert!(slept <= Duration::from_millis(100));
    }

    #[test]
    fn test_unbounded_backoff_factor_is_capped() {
        let engine = retry_engine(RetryPolicy::new(3, Duration::from_millis(1), f64::INFINITY));
        let mut ctx = request();

        let result = engine.recover_with(&mut ctx, timeout_error(), Some(always_failing()));

        // The capped second delay exceeds the 30s ceiling, so retrying stops
        assert!(!result.success);
        assert_eq!(result.attempt_count, 2);
        assert_eq!(result.backoff_delays, vec![Duration::from_millis(1)]);
        assert!(matches!(
            result.final_error,
            Some(Error::RecoveryExhausted { attempts: 2, .. })
        ));
    }

    #[test]
    fn test_critical_severity_escalates_before_retry() {
        let mut notifier = MockEscalationNotifier::new();
        notifier
            .expect_notify()
            .withf(|e: &Escalation| e.strategy == "critical_escalate" && e.path == "/orders")
            .times(1)
            .return_const(());

        let engine = RecoveryEngine::builder()
            .notifier(Arc::new(notifier))
            .build()
            .unwrap();
        let err = Error::Network("connection reset by peer".into()).into_shared();
        engine.learn(err.as_ref(), ErrorCategory::Network, Severity::Critical);

        let mut ctx = request();
        let result = engine.recover(&mut ctx, Arc::clone(&err));

        assert_eq!(result.strategy_name.as_deref(), Some("critical_escalate"));
        assert_eq!(result.action, RecoveryAction::Escalate);
        assert!(result.success);
        assert!(matches!(result.final_error, Some(Error::Escalated { .. })));
    }

    #[test]
    fn test_open_breaker_denies_recovery() {
        let breakers = Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig {
            max_failures: 1,
            timeout: Duration::from_secs(60),
            single_probe: false,
        }));
        breakers.global().on_failure();

        let engine = RecoveryEngine::builder()
            .breakers(Arc::clone(&breakers))
            .build()
            .unwrap();
        let mut ctx = request();
        let result = engine.recover(&mut ctx, timeout_error());

        assert_eq!(result.action, RecoveryAction::CircuitBreak);
        assert!(!result.success);
        assert!(result.strategy_name.is_none());
        assert!(matches!(
            result.final_error,
            Some(Error::CircuitOpen { ref breaker, .. }) if breaker == GLOBAL_BREAKER
        ));
        assert_eq!(breakers.global().snapshot().rejected, 1);
    }

    #[test]
    fn test_boundary_selects_breaker() {
        let engine = RecoveryEngine::builder()
            .without_default_strategies()
            .strategy(
                RecoveryStrategy::new(
                    "payments_fallback",
                    CategoryCondition::new(ErrorCategory::External),
                    RecoveryAction::Fallback,
                )
                .with_fallback(|_ctx: &mut Context, err: &SharedError| Err(Arc::clone(err))),
            )
            .build()
            .unwrap();

        let mut ctx = request();
        ctx.set(BOUNDARY_KEY, "payments");
        let result = engine.recover(
            &mut ctx,
            Error::External("card processor unavailable".into()).into_shared(),
        );

        assert!(!result.success);
        assert!(matches!(
            result.final_error,
            Some(Error::RecoveryExhausted { attempts: 1, .. })
        ));
        assert_eq!(engine.breakers().get("payments").failure_count(), 1);
        assert_eq!(engine.breakers().global().failure_count(), 0);
    }

    #[test]
    fn test_default_fallback_writes_503() {
        let engine = RecoveryEngine::new();
        let mut ctx = request();

        let result = engine.recover(
            &mut ctx,
            Error::External("geo service down".into()).into_shared(),
        );

        assert_eq!(result.action, RecoveryAction::Fallback);
        assert!(result.success);
        assert_eq!(ctx.status(), Some(StatusCode::SERVICE_UNAVAILABLE));
        assert!(ctx.is_aborted());
    }

    #[test]
    fn test_business_errors_are_ignored() {
        let engine = RecoveryEngine::new();
        let mut ctx = request();

        let result = engine.recover(
            &mut ctx,
            Error::Business("insufficient balance".into()).into_shared(),
        );

        assert_eq!(result.action, RecoveryAction::Ignore);
        assert!(result.success);
        assert!(result.final_error.is_none());
    }

    #[test]
    fn test_disabled_engine() {
        let engine = RecoveryEngine::new();
        engine.set_enabled(false);
        let mut ctx = request();

        let result = engine.recover(&mut ctx, timeout_error());
        assert_eq!(result.action, RecoveryAction::Ignore);
        assert!(!result.success);
        assert!(result.classification.is_none());
        assert_eq!(engine.stats().total_attempts, 0);
    }

    #[test]
    fn test_no_matching_strategy() {
        let engine = RecoveryEngine::builder()
            .without_default_strategies()
            .build()
            .unwrap();
        let mut ctx = request();

        let result = engine.recover(&mut ctx, timeout_error());
        assert_eq!(result.action, RecoveryAction::Ignore);
        assert!(!result.success);
        assert!(matches!(
            result.final_error,
            Some(Error::NotFound { kind: "recovery strategy", .. })
        ));
        assert_eq!(engine.breakers().global().snapshot().total_failures, 0);
    }

    #[test]
    fn test_duplicate_strategy_rejected() {
        let engine = RecoveryEngine::new();
        let duplicate = RecoveryStrategy::new(
            "timeout_retry",
            CategoryCondition::new(ErrorCategory::Timeout),
            RecoveryAction::Ignore,
        );
        assert!(matches!(
            engine.add_strategy(duplicate),
            Err(Error::AlreadyRegistered { .. })
        ));
    }

    #[test]
    fn test_stats_after_recoveries() {
        let engine = RecoveryEngine::new();
        let mut ctx = request();

        engine.recover(&mut ctx, Error::Business("duplicate order".into()).into_shared());
        engine.recover(&mut ctx, timeout_error());

        let stats = engine.stats();
        assert_eq!(stats.total_attempts, 2);
        assert_eq!(stats.successes, 1);
        assert_eq!(stats.failures, 1);
        assert_eq!(stats.by_action["ignore"], 1);
        assert_eq!(stats.by_action["retry"], 1);
        assert_eq!(stats.by_category["business"], 1);
        assert_eq!(stats.by_strategy["business_ignore"].usage_count, 1);
        assert_eq!(stats.by_strategy["timeout_retry"].failure_count, 1);
    }

    #[test]
    fn test_summary_serializes() {
        let engine = RecoveryEngine::new();
        let mut ctx = request();
        let result = engine.recover(&mut ctx, timeout_error());

        let value = serde_json::to_value(result.summary()).unwrap();
        assert_eq!(value["action"], "retry");
        assert_eq!(value["strategy"], "timeout_retry");
        assert_eq!(value["classification"]["category"], "timeout");
        assert_eq!(value["success"], false);
    }

    proptest! {
        #[test]
        fn strategies_ordered_by_priority_then_registration(kinds in prop::collection::vec(0u8..3, 1..12)) {
            let engine = RecoveryEngine::builder().without_default_strategies().build().unwrap();
            for (i, kind) in kinds.iter().enumerate() {
                let name = format!("s{i}");
                let strategy = match kind {
                    0 => RecoveryStrategy::new(name, SeverityCondition::at_least(Severity::High), RecoveryAction::Escalate),
                    1 => RecoveryStrategy::new(name, CategoryCondition::new(ErrorCategory::Network), RecoveryAction::Retry),
                    _ => RecoveryStrategy::new(name, RetryableCondition::new(true), RecoveryAction::Retry),
                };
                engine.add_strategy(strategy).unwrap();
            }

            let priority = |kind: u8| match kind { 0 => 80, 1 => 50, _ => 30 };
            let mut expected: Vec<(i32, usize)> = kinds.iter().enumerate().map(|(i, k)| (priority(*k), i)).collect();
            expected.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
            let expected: Vec<String> = expected.into_iter().map(|(_, i)| format!("s{i}")).collect();

            prop_assert_eq!(engine.strategies(), expected);
        }
    }
}
