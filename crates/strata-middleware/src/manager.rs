//! Pipeline manager
//!
//! Facade over the registry, the layered pipeline and the chain compiler.
//! Every mutation of a layer invalidates the cached chains built from it.
//! Two optional background loops keep common chains warm and evaluate health.

use crate::compiler::{ChainCompiler, CompiledChain, CompilerStats};
use crate::health::{HealthReport, HealthThresholds};
use crate::layer::{Layer, LayeredPipeline};
use crate::registry::{MiddlewareMetadata, MiddlewareRegistry, RegistryStats};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use strata_core::{BoxedHandler, Context, Error, Result};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Manager configuration
#[derive(Debug, Clone)]
pub struct PipelineManagerConfig {
    /// Run the cache warm-up loop
    pub auto_recompile: bool,
    /// Warm-up period
    pub compile_interval: Duration,
    /// Run the health-check loop
    pub health_check: bool,
    /// Health-check period
    pub health_check_interval: Duration,
    /// Degradation thresholds
    pub thresholds: HealthThresholds,
    /// Layer combinations compiled by the warm-up loop
    pub warm_layer_sets: Vec<Vec<Layer>>,
}

impl Default for PipelineManagerConfig {
    fn default() -> Self {
        Self {
            auto_recompile: true,
            compile_interval: Duration::from_secs(300),
            health_check: true,
            health_check_interval: Duration::from_secs(60),
            thresholds: HealthThresholds::default(),
            warm_layer_sets: Layer::common_sets(),
        }
    }
}

/// Pipeline statistics
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineStats {
    /// Registry counts
    pub registry: RegistryStats,
    /// Compiled-chain cache counters
    pub compiler: CompilerStats,
    /// Chains executed
    pub executions: u64,
    /// Executions that left an error on the context
    pub execution_errors: u64,
    /// execution_errors / executions
    pub error_rate: f64,
    /// Mean execution time
    #[serde(with = "humantime_serde")]
    pub average_execution: Duration,
}

struct Inner {
    config: PipelineManagerConfig,
    registry: MiddlewareRegistry,
    pipeline: LayeredPipeline,
    compiler: ChainCompiler,
    executions: AtomicU64,
    execution_errors: AtomicU64,
    execution_nanos: AtomicU64,
    last_health: RwLock<Option<HealthReport>>,
}

impl Inner {
    fn warm_cache(&self) -> usize {
        let mut warmed = 0;
        for layers in &self.config.warm_layer_sets {
            match self.compiler.compile_chain(&self.pipeline, layers) {
                Ok(_) => warmed += 1,
                Err(e) => warn!(layers = ?layers, error = %e, "Failed to warm chain"),
            }
        }
        debug!(warmed, "Chain cache warmed");
        warmed
    }

    fn check_health(&self) -> HealthReport {
        let report = HealthReport::evaluate(
            &self.config.thresholds,
            &self.compiler.stats(),
            self.executions.load(Ordering::Relaxed),
            self.execution_errors.load(Ordering::Relaxed),
        );

        if report.cache_degraded {
            warn!(
                hit_rate = report.cache_hit_rate,
                threshold = self.config.thresholds.min_cache_hit_rate,
                "Chain cache hit-rate degraded"
            );
        }
        if report.errors_degraded {
            warn!(
                error_rate = report.error_rate,
                threshold = self.config.thresholds.max_error_rate,
                "Pipeline error-rate degraded"
            );
        }

        *self.last_health.write() = Some(report.clone());
        report
    }
}

/// Owns the registry, pipeline and compiler, and runs maintenance loops
pub struct PipelineManager {
    inner: Arc<Inner>,
    cancel: Mutex<CancellationToken>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl PipelineManager {
    /// Create a manager with the builtin catalog registered
    pub fn new(config: PipelineManagerConfig) -> Self {
        Self::with_registry(config, MiddlewareRegistry::with_builtins())
    }

    /// Create a manager around an existing registry
    pub fn with_registry(config: PipelineManagerConfig, registry: MiddlewareRegistry) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                registry,
                pipeline: LayeredPipeline::new(),
                compiler: ChainCompiler::new(),
                executions: AtomicU64::new(0),
                execution_errors: AtomicU64::new(0),
                execution_nanos: AtomicU64::new(0),
                last_health: RwLock::new(None),
            }),
            cancel: Mutex::new(CancellationToken::new()),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// The middleware registry
    pub fn registry(&self) -> &MiddlewareRegistry {
        &self.inner.registry
    }

    /// The layered pipeline
    pub fn pipeline(&self) -> &LayeredPipeline {
        &self.inner.pipeline
    }

    /// The chain compiler
    pub fn compiler(&self) -> &ChainCompiler {
        &self.inner.compiler
    }

    /// The manager configuration
    pub fn config(&self) -> &PipelineManagerConfig {
        &self.inner.config
    }

    // --- registration ------------------------------------------------------

    /// Register a builtin factory
    pub fn register_builtin<F>(
        &self,
        name: impl Into<String>,
        factory: F,
        metadata: MiddlewareMetadata,
    ) -> Result<()>
    where
        F: Fn(&serde_json::Value) -> Result<BoxedHandler> + Send + Sync + 'static,
    {
        self.inner.registry.register_builtin(name, factory, metadata)
    }

    /// Register a custom handler
    pub fn register_custom(
        &self,
        name: impl Into<String>,
        handler: BoxedHandler,
        metadata: MiddlewareMetadata,
    ) -> Result<()> {
        self.inner.registry.register_custom(name, handler, metadata)
    }

    /// Add a handler to `layer`
    pub fn use_handler(
        &self,
        layer: Layer,
        name: &str,
        handler: BoxedHandler,
        priority: i32,
    ) -> Result<()> {
        self.add(layer, name, name, handler, priority)
    }

    /// Instantiate builtin `name` with `config` and add it to `layer` under the same name
    pub fn use_builtin(
        &self,
        layer: Layer,
        name: &str,
        config: &serde_json::Value,
        priority: i32,
    ) -> Result<()> {
        self.use_builtin_as(layer, name, name, config, priority)
    }

    /// Instantiate builtin `builtin` and add it to `layer` as `entry_name`,
    /// so one builtin can appear several times with different settings
    pub fn use_builtin_as(
        &self,
        layer: Layer,
        entry_name: &str,
        builtin: &str,
        config: &serde_json::Value,
        priority: i32,
    ) -> Result<()> {
        let handler = self.inner.registry.instantiate(builtin, config)?;
        self.add(layer, entry_name, builtin, handler, priority)
    }

    /// Add the custom handler registered as `name` to `layer`
    pub fn use_registered(&self, layer: Layer, name: &str, priority: i32) -> Result<()> {
        let handler = self
            .inner
            .registry
            .lookup_custom(name)
            .ok_or_else(|| Error::not_found("custom middleware", name))?;
        self.add(layer, name, name, handler, priority)
    }

    fn add(
        &self,
        layer: Layer,
        entry_name: &str,
        registered_name: &str,
        handler: BoxedHandler,
        priority: i32,
    ) -> Result<()> {
        self.inner
            .pipeline
            .use_handler(layer, entry_name, handler, priority)?;

        let present: Vec<String> = Layer::ALL
            .iter()
            .filter(|l| **l <= layer)
            .flat_map(|l| self.inner.pipeline.entries(*l))
            .map(|e| e.name)
            .collect();
        let unmet = self.inner.registry.unmet_dependencies(registered_name, &present);
        if !unmet.is_empty() {
            warn!(
                layer = %layer,
                middleware = %entry_name,
                missing = ?unmet,
                "Middleware used before its dependencies"
            );
        }

        self.inner.compiler.invalidate_layer(layer);
        Ok(())
    }

    /// Re-enable an entry
    pub fn enable(&self, layer: Layer, name: &str) -> Result<()> {
        if self.inner.pipeline.enable_middleware(layer, name)? {
            self.inner.compiler.invalidate_layer(layer);
        }
        Ok(())
    }

    /// Disable an entry, keeping its position
    pub fn disable(&self, layer: Layer, name: &str) -> Result<()> {
        if self.inner.pipeline.disable_middleware(layer, name)? {
            self.inner.compiler.invalidate_layer(layer);
        }
        Ok(())
    }

    // --- execution ---------------------------------------------------------

    /// Compiled chain for `layers`, from cache when possible
    pub fn get_compiled_chain(&self, layers: &[Layer]) -> Result<Arc<CompiledChain>> {
        self.inner.compiler.compile_chain(&self.inner.pipeline, layers)
    }

    /// Run the chain for `layers` against `ctx`.
    ///
    /// Only compilation failures are returned. Errors raised by handlers stay
    /// on the context for the caller to hand to recovery.
    pub fn execute_compiled_chain(&self, ctx: &mut Context, layers: &[Layer]) -> Result<()> {
        let chain = self.get_compiled_chain(layers)?;

        let errors_before = ctx.errors().len();
        let start = Instant::now();
        chain.execute(ctx);
        let elapsed = start.elapsed();

        self.inner.executions.fetch_add(1, Ordering::Relaxed);
        self.inner
            .execution_nanos
            .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
        if ctx.errors().len() > errors_before {
            self.inner.execution_errors.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    // --- maintenance -------------------------------------------------------

    /// Compile every configured warm-up layer set. Returns how many succeeded.
    pub fn warm_cache(&self) -> usize {
        self.inner.warm_cache()
    }

    /// Evaluate health now and store the report
    pub fn check_health(&self) -> HealthReport {
        self.inner.check_health()
    }

    /// Most recent health report
    pub fn last_health(&self) -> Option<HealthReport> {
        self.inner.last_health.read().clone()
    }

    /// Current statistics
    pub fn stats(&self) -> PipelineStats {
        let executions = self.inner.executions.load(Ordering::Relaxed);
        let execution_errors = self.inner.execution_errors.load(Ordering::Relaxed);
        let nanos = self.inner.execution_nanos.load(Ordering::Relaxed);

        PipelineStats {
            registry: self.inner.registry.stats(),
            compiler: self.inner.compiler.stats(),
            executions,
            execution_errors,
            error_rate: if executions == 0 {
                0.0
            } else {
                execution_errors as f64 / executions as f64
            },
            average_execution: if executions == 0 {
                Duration::ZERO
            } else {
                Duration::from_nanos(nanos / executions)
            },
        }
    }

    /// Spawn the enabled maintenance loops on the current tokio runtime.
    ///
    /// Can be called again after [`shutdown`](Self::shutdown).
    pub fn start(&self) -> Result<()> {
        let config = &self.inner.config;
        if config.auto_recompile && config.compile_interval.is_zero() {
            return Err(Error::Config("compile_interval must be > 0".to_string()));
        }
        if config.health_check && config.health_check_interval.is_zero() {
            return Err(Error::Config("health_check_interval must be > 0".to_string()));
        }

        let handle = tokio::runtime::Handle::try_current()
            .map_err(|e| Error::Internal(format!("maintenance loops need a tokio runtime: {e}")))?;

        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            debug!("Maintenance loops already running");
            return Ok(());
        }

        let cancel = {
            let mut cancel = self.cancel.lock();
            if cancel.is_cancelled() {
                *cancel = CancellationToken::new();
            }
            cancel.clone()
        };

        if config.auto_recompile {
            tasks.push(handle.spawn(recompile_loop(
                Arc::clone(&self.inner),
                config.compile_interval,
                cancel.clone(),
            )));
        }
        if config.health_check {
            tasks.push(handle.spawn(health_loop(
                Arc::clone(&self.inner),
                config.health_check_interval,
                cancel,
            )));
        }

        info!(
            auto_recompile = config.auto_recompile,
            health_check = config.health_check,
            "Pipeline manager started"
        );
        Ok(())
    }

    /// Cancel the maintenance loops and wait for them to finish
    pub async fn shutdown(&self) {
        self.cancel.lock().cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Maintenance task ended abnormally");
            }
        }
        info!("Pipeline manager stopped");
    }
}

impl Drop for PipelineManager {
    fn drop(&mut self) {
        self.cancel.get_mut().cancel();
    }
}

impl fmt::Debug for PipelineManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineManager")
            .field("pipeline", &self.inner.pipeline)
            .field("compiler", &self.inner.compiler)
            .field("tasks", &self.tasks.lock().len())
            .finish()
    }
}

async fn recompile_loop(inner: Arc<Inner>, period: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(period);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                inner.warm_cache();
            }
        }
    }
    debug!("Recompile loop stopped");
}

async fn health_loop(inner: Arc<Inner>, period: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(period);
    // The first tick completes immediately; there is nothing to judge yet
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                inner.check_health();
            }
        }
    }
    debug!("Health-check loop stopped");
}
