//! Runtime assembly
//!
//! A [`Runtime`] wires a [`PipelineManager`] and a [`RecoveryEngine`] together
//! from one [`Config`]. [`Runtime::handle`] runs a compiled chain and hands
//! every error the handlers left on the context to recovery.

use crate::shutdown::ShutdownSignal;
use crate::RuntimeState;
use parking_lot::RwLock;
use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use strata_config::{BreakerSettings, ConditionConfig, Config, StrategyConfig};
use strata_core::{responses, Context, Error, Result, SharedError, StatusCode};
use strata_middleware::{
    HealthThresholds, Layer, MiddlewareRegistry, PipelineManager, PipelineManagerConfig,
    PipelineStats,
};
use strata_recovery::{
    CategoryCondition, CircuitBreakerConfig, CircuitBreakerMetrics, CircuitBreakerRegistry,
    ClassifierStats, ErrorCategory, ErrorClassifier, EscalationNotifier, RecoveryAction,
    RecoveryCondition, RecoveryEngine, RecoveryResult, RecoveryStats, RecoveryStrategy,
    RetryPolicy, RetryableCondition, Severity, SeverityCondition,
};
use tracing::{debug, info, warn};

/// Runtime statistics
#[derive(Debug, Clone, Serialize)]
pub struct RuntimeStats {
    /// Requests handled
    pub requests: u64,
    /// Pipeline counters
    pub pipeline: PipelineStats,
    /// Recovery counters
    pub recovery: RecoveryStats,
    /// Classifier counters
    pub classifier: ClassifierStats,
    /// Circuit breakers, sorted by name
    pub breakers: Vec<CircuitBreakerMetrics>,
}

/// Pipeline plus recovery, built from configuration
pub struct Runtime {
    config: Config,
    manager: PipelineManager,
    recovery: Arc<RecoveryEngine>,
    state: RwLock<RuntimeState>,
    shutdown: ShutdownSignal,
    requests: AtomicU64,
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("state", &self.state())
            .field("manager", &self.manager)
            .field("recovery", &self.recovery)
            .field("requests", &self.requests)
            .finish()
    }
}

impl Runtime {
    /// Create a new runtime builder
    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::new()
    }

    /// Build a runtime from configuration alone
    pub fn from_config(config: Config) -> Result<Self> {
        Self::builder().config(config).build()
    }

    /// The configuration the runtime was built from
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The pipeline manager
    pub fn manager(&self) -> &PipelineManager {
        &self.manager
    }

    /// The recovery engine
    pub fn recovery(&self) -> &Arc<RecoveryEngine> {
        &self.recovery
    }

    /// Get the current state
    pub fn state(&self) -> RuntimeState {
        *self.state.read()
    }

    /// Get shutdown signal
    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    /// Run the chain for `layers` and recover every error it produced.
    ///
    /// An error that stays unrecovered gets a structured error response,
    /// unless a handler already wrote one.
    pub fn handle(&self, ctx: &mut Context, layers: &[Layer]) -> Result<Vec<RecoveryResult>> {
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.manager.execute_compiled_chain(ctx, layers)?;

        let errors = ctx.take_errors();
        if errors.is_empty() {
            return Ok(Vec::new());
        }

        debug!(
            request_id = %ctx.request_id,
            errors = errors.len(),
            "Recovering request errors"
        );

        let mut results = Vec::with_capacity(errors.len());
        for err in errors {
            let result = self.recovery.recover(ctx, err);
            if !result.success && !ctx.is_written() {
                let status = status_for(&result.original_error);
                responses::error(ctx, status, "request_failed", result.original_error.to_string());
            }
            results.push(result);
        }
        Ok(results)
    }

    /// Start the maintenance loops. Needs a tokio runtime.
    pub fn start(&self) -> Result<()> {
        self.manager.start()?;
        *self.state.write() = RuntimeState::Running;
        info!(
            middleware = self.config.middleware.len(),
            strategies = self.recovery.strategies().len(),
            "Runtime started"
        );
        Ok(())
    }

    /// Start, wait for the shutdown signal, then stop
    pub async fn run(&self) -> Result<()> {
        self.start()?;
        self.shutdown.wait().await;
        self.shutdown().await;
        Ok(())
    }

    /// Stop the maintenance loops
    pub async fn shutdown(&self) {
        *self.state.write() = RuntimeState::ShuttingDown;
        info!("Runtime shutting down");
        self.manager.shutdown().await;
        *self.state.write() = RuntimeState::Stopped;
        info!(requests = self.requests.load(Ordering::Relaxed), "Runtime stopped");
    }

    /// Current statistics
    pub fn stats(&self) -> RuntimeStats {
        RuntimeStats {
            requests: self.requests.load(Ordering::Relaxed),
            pipeline: self.manager.stats(),
            recovery: self.recovery.stats(),
            classifier: self.recovery.classifier().stats(),
            breakers: self.recovery.breakers().snapshot_all(),
        }
    }
}

fn status_for(err: &SharedError) -> StatusCode {
    err.downcast_ref::<Error>()
        .map_or(StatusCode::INTERNAL_SERVER_ERROR, Error::to_status_code)
}

/// Runtime builder
pub struct RuntimeBuilder {
    config: Option<Config>,
    registry: Option<MiddlewareRegistry>,
    notifier: Option<Arc<dyn EscalationNotifier>>,
    strategies: Vec<RecoveryStrategy>,
}

impl fmt::Debug for RuntimeBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeBuilder")
            .field("config", &self.config)
            .field("strategies", &self.strategies)
            .finish_non_exhaustive()
    }
}

impl Default for RuntimeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RuntimeBuilder {
    /// Create a new builder
    pub fn new() -> Self {
        Self {
            config: None,
            registry: None,
            notifier: None,
            strategies: Vec::new(),
        }
    }

    /// Set configuration
    pub fn config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    /// Use a registry with extra builtins or custom handlers
    pub fn registry(mut self, registry: MiddlewareRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Replace the escalation hook
    pub fn notifier(mut self, notifier: Arc<dyn EscalationNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Add a strategy that configuration cannot express, such as a custom fallback
    pub fn strategy(mut self, strategy: RecoveryStrategy) -> Self {
        self.strategies.push(strategy);
        self
    }

    /// Validate the configuration and build the runtime
    pub fn build(self) -> Result<Runtime> {
        let config = self.config.unwrap_or_default();
        strata_config::validate_config(&config)?;

        let manager = PipelineManager::with_registry(
            manager_config(&config)?,
            self.registry.unwrap_or_else(MiddlewareRegistry::with_builtins),
        );
        for entry in &config.middleware {
            let layer = Layer::from_str(&entry.layer)?;
            manager.use_builtin_as(
                layer,
                &entry.name,
                entry.builtin_name(),
                &entry.config,
                entry.priority,
            )?;
            if !entry.enabled {
                manager.disable(layer, &entry.name)?;
            }
        }

        let breakers = config.circuit_breaker.boundaries.iter().fold(
            CircuitBreakerRegistry::new(breaker_config(&config.circuit_breaker.defaults())),
            |registry, (name, settings)| registry.with_override(name, breaker_config(settings)),
        );

        let classifier = ErrorClassifier::new();
        for rule in &config.recovery.learned_rules {
            classifier.learn_message(
                &rule.message,
                ErrorCategory::from_str(&rule.category)?,
                Severity::from_str(&rule.severity)?,
            );
        }

        let mut engine = RecoveryEngine::builder()
            .enabled(config.recovery.enabled)
            .classifier(Arc::new(classifier))
            .breakers(Arc::new(breakers));
        if !config.recovery.use_default_strategies {
            engine = engine.without_default_strategies();
        }
        if let Some(notifier) = self.notifier {
            engine = engine.notifier(notifier);
        }
        for strategy in &config.recovery.strategies {
            engine = engine.strategy(strategy_from_config(strategy)?);
        }
        for strategy in self.strategies {
            engine = engine.strategy(strategy);
        }
        let recovery = Arc::new(engine.build()?);

        if config.middleware.iter().all(|m| m.builtin_name() != "recovery") {
            warn!("No recovery middleware configured; handler panics will not be caught");
        }

        Ok(Runtime {
            config,
            manager,
            recovery,
            state: RwLock::new(RuntimeState::Initializing),
            shutdown: ShutdownSignal::new(),
            requests: AtomicU64::new(0),
        })
    }
}

fn manager_config(config: &Config) -> Result<PipelineManagerConfig> {
    let pipeline = &config.pipeline;
    let warm_layer_sets = pipeline
        .warm_layer_sets
        .iter()
        .map(|set| set.iter().map(|l| Layer::from_str(l)).collect::<Result<Vec<_>>>())
        .collect::<Result<Vec<_>>>()?;

    Ok(PipelineManagerConfig {
        auto_recompile: pipeline.auto_recompile,
        compile_interval: pipeline.compile_interval,
        health_check: pipeline.health_check,
        health_check_interval: pipeline.health_check_interval,
        thresholds: HealthThresholds {
            min_cache_hit_rate: pipeline.min_cache_hit_rate,
            max_error_rate: pipeline.max_error_rate,
        },
        warm_layer_sets,
    })
}

fn breaker_config(settings: &BreakerSettings) -> CircuitBreakerConfig {
    CircuitBreakerConfig {
        max_failures: settings.max_failures,
        timeout: settings.timeout,
        single_probe: settings.single_probe,
    }
}

/// Turn a configured strategy into a [`RecoveryStrategy`]
pub fn strategy_from_config(config: &StrategyConfig) -> Result<RecoveryStrategy> {
    let condition: Arc<dyn RecoveryCondition> = match &config.condition {
        ConditionConfig::Category(category) => {
            Arc::new(CategoryCondition::new(ErrorCategory::from_str(category)?))
        }
        ConditionConfig::Severity(severity) => {
            Arc::new(SeverityCondition::at_least(Severity::from_str(severity)?))
        }
        ConditionConfig::Retryable(retryable) => Arc::new(RetryableCondition::new(*retryable)),
    };

    Ok(RecoveryStrategy {
        name: config.name.clone(),
        condition,
        action: RecoveryAction::from_str(&config.action)?,
        retry: RetryPolicy::new(config.max_retries, config.retry_interval, config.backoff_factor)
            .with_timeout(config.timeout),
        fallback: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use strata_config::{ConfigBuilder, MiddlewareConfig};
    use strata_core::{handler_fn, Method};

    fn quiet() -> ConfigBuilder {
        ConfigBuilder::new().maintenance(false)
    }

    #[test]
    fn test_build_from_config() {
        let mut disabled = MiddlewareConfig::new("route", "cors", 1);
        disabled.enabled = false;

        let config = quiet()
            .use_builtin("global", "recovery", 5)
            .use_builtin("global", "logger", 10)
            .middleware(disabled)
            .build()
            .unwrap();
        let runtime = Runtime::from_config(config).unwrap();

        assert_eq!(runtime.state(), RuntimeState::Initializing);
        let chain = runtime.manager().get_compiled_chain(&[Layer::Global]).unwrap();
        assert_eq!(chain.handler_names(), &["global/recovery", "global/logger"]);

        let chain = runtime
            .manager()
            .get_compiled_chain(&[Layer::Global, Layer::Route])
            .unwrap();
        assert_eq!(chain.len(), 2);
    }

    #[test]
    fn test_unknown_builtin_fails_build() {
        let config = quiet().use_builtin("global", "gzip", 1).build().unwrap();
        assert!(matches!(
            Runtime::from_config(config),
            Err(Error::NotFound { .. })
        ));
    }

    #[test]
    fn test_configured_strategy_and_rules() {
        let config = quiet()
            .default_strategies(false)
            .strategy(StrategyConfig {
                name: "shed_load".into(),
                condition: ConditionConfig::Severity("high".into()),
                action: "circuit_break".into(),
                max_retries: 1,
                retry_interval: Duration::from_millis(10),
                backoff_factor: 1.0,
                timeout: Duration::ZERO,
            })
            .learned_rule("deadlock detected on orders", "database", "critical")
            .build()
            .unwrap();
        let runtime = Runtime::from_config(config).unwrap();

        assert_eq!(runtime.recovery().strategies(), vec!["shed_load"]);
        assert_eq!(runtime.recovery().classifier().learned_rules().len(), 1);
    }

    #[test]
    fn test_handle_recovers_errors() {
        let config = quiet().use_builtin("global", "recovery", 5).build().unwrap();
        let runtime = Runtime::from_config(config).unwrap();
        runtime
            .manager()
            .use_handler(
                Layer::Controller,
                "create_order",
                handler_fn(|ctx| ctx.push_error(Error::Business("order limit reached".into()))),
                0,
            )
            .unwrap();

        let mut ctx = Context::request(Method::POST, "/orders");
        let results = runtime
            .handle(&mut ctx, &[Layer::Global, Layer::Controller])
            .unwrap();

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].action, RecoveryAction::Ignore);
        assert!(results[0].success);
        assert!(!ctx.has_errors());
        assert_eq!(runtime.stats().requests, 1);
    }

    #[test]
    fn test_unrecovered_error_writes_response() {
        let config = quiet().default_strategies(false).build().unwrap();
        let runtime = Runtime::from_config(config).unwrap();
        runtime
            .manager()
            .use_handler(
                Layer::Controller,
                "login",
                handler_fn(|ctx| ctx.push_error(Error::Authentication("bad token".into()))),
                0,
            )
            .unwrap();

        let mut ctx = Context::request(Method::POST, "/login");
        let results = runtime.handle(&mut ctx, &[Layer::Controller]).unwrap();

        assert!(!results[0].success);
        assert_eq!(ctx.status(), Some(StatusCode::UNAUTHORIZED));
        assert_eq!(ctx.body().unwrap()["error"], "request_failed");
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let runtime = Runtime::from_config(quiet().build().unwrap()).unwrap();
        runtime.start().unwrap();
        assert_eq!(runtime.state(), RuntimeState::Running);

        runtime.shutdown().await;
        assert_eq!(runtime.state(), RuntimeState::Stopped);
    }

    #[tokio::test]
    async fn test_run_until_signal() {
        let runtime = Arc::new(Runtime::from_config(quiet().build().unwrap()).unwrap());
        let signal = runtime.shutdown_signal();

        let task = tokio::spawn({
            let runtime = Arc::clone(&runtime);
            async move { runtime.run().await }
        });
        tokio::task::yield_now().await;
        signal.trigger();

        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(runtime.state(), RuntimeState::Stopped);
    }
}
