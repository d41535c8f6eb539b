//! Chain compilation and caching
//!
//! A chain is the concatenation of the enabled entries of a set of layers,
//! in layer precedence order. Compiled chains are cached under an identity
//! derived from exactly the inputs that determine their behavior.

use crate::layer::{Layer, LayerSnapshot, LayeredPipeline};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use strata_core::{BoxedHandler, Context, Error, Handler, Result};
use tracing::debug;

/// A flattened, immutable middleware chain.
///
/// Safe to execute concurrently from any number of requests.
pub struct CompiledChain {
    id: String,
    layers: Vec<Layer>,
    handler_names: Vec<String>,
    handlers: Arc<[BoxedHandler]>,
    built_at: DateTime<Utc>,
}

impl CompiledChain {
    /// Chain identity (cache key)
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Layers the chain was built from, in precedence order
    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    /// `layer/name` of every handler in execution order
    pub fn handler_names(&self) -> &[String] {
        &self.handler_names
    }

    /// Number of handlers
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether the chain has no handlers
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// When the chain was compiled
    pub fn built_at(&self) -> DateTime<Utc> {
        self.built_at
    }

    /// Run the chain against `ctx`
    pub fn execute(&self, ctx: &mut Context) {
        ctx.run_chain(Arc::clone(&self.handlers));
    }
}

impl Handler for CompiledChain {
    fn handle(&self, ctx: &mut Context) {
        self.execute(ctx);
    }
}

impl fmt::Debug for CompiledChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledChain")
            .field("id", &self.id)
            .field("layers", &self.layers)
            .field("handlers", &self.handler_names)
            .field("built_at", &self.built_at)
            .finish()
    }
}

/// Cache statistics
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CompilerStats {
    /// Lookups served from cache
    pub hits: u64,
    /// Lookups that required compilation
    pub misses: u64,
    /// Chains compiled
    pub compiles: u64,
    /// Chains currently cached
    pub cached: usize,
    /// hits / (hits + misses), 1.0 when there were no lookups
    pub hit_rate: f64,
}

/// Compiles layer combinations into [`CompiledChain`]s and memoizes them
pub struct ChainCompiler {
    cache: RwLock<HashMap<String, Arc<CompiledChain>>>,
    hits: AtomicU64,
    misses: AtomicU64,
    compiles: AtomicU64,
}

impl ChainCompiler {
    /// Create a compiler with an empty cache
    pub fn new() -> Self {
        Self {
            cache: RwLock::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            compiles: AtomicU64::new(0),
        }
    }

    /// Get the compiled chain for `layers`, compiling it on a cache miss.
    ///
    /// `layers` may be given in any order; duplicates and an empty list are
    /// rejected with [`Error::Compile`].
    pub fn compile_chain(
        &self,
        pipeline: &LayeredPipeline,
        layers: &[Layer],
    ) -> Result<Arc<CompiledChain>> {
        let layers = normalize_layers(layers)?;
        let snapshots: Vec<LayerSnapshot> = layers.iter().map(|l| pipeline.snapshot(*l)).collect();
        let id = chain_id(&snapshots);

        if let Some(chain) = self.cache.read().get(&id) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            debug!(chain_id = %id, "Chain cache hit");
            return Ok(Arc::clone(chain));
        }

        let mut cache = self.cache.write();
        // Another thread may have compiled it while we waited for the lock
        if let Some(chain) = cache.get(&id) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(Arc::clone(chain));
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let chain = Arc::new(build_chain(id.clone(), layers, snapshots));
        self.compiles.fetch_add(1, Ordering::Relaxed);

        debug!(
            chain_id = %id,
            handlers = chain.len(),
            layers = ?chain.layers(),
            "Chain compiled"
        );

        cache.insert(id, Arc::clone(&chain));
        Ok(chain)
    }

    /// Evict every cached chain that includes `layer`. Returns how many were evicted.
    pub fn invalidate_layer(&self, layer: Layer) -> usize {
        let mut cache = self.cache.write();
        let before = cache.len();
        cache.retain(|_, chain| !chain.layers.contains(&layer));
        let evicted = before - cache.len();

        if evicted > 0 {
            debug!(layer = %layer, evicted, "Invalidated cached chains");
        }
        evicted
    }

    /// Drop every cached chain
    pub fn clear(&self) {
        self.cache.write().clear();
    }

    /// Whether a chain with this identity is cached
    pub fn is_cached(&self, chain_id: &str) -> bool {
        self.cache.read().contains_key(chain_id)
    }

    /// Current statistics
    pub fn stats(&self) -> CompilerStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;

        CompilerStats {
            hits,
            misses,
            compiles: self.compiles.load(Ordering::Relaxed),
            cached: self.cache.read().len(),
            hit_rate: if lookups == 0 {
                1.0
            } else {
                hits as f64 / lookups as f64
            },
        }
    }
}

impl Default for ChainCompiler {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ChainCompiler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChainCompiler")
            .field("stats", &self.stats())
            .finish()
    }
}

/// Sort layers into precedence order, rejecting empty and duplicated input
pub fn normalize_layers(layers: &[Layer]) -> Result<Vec<Layer>> {
    if layers.is_empty() {
        return Err(Error::Compile("no layers requested".to_string()));
    }

    let mut sorted = layers.to_vec();
    sorted.sort();

    if let Some(pair) = sorted.windows(2).find(|w| w[0] == w[1]) {
        return Err(Error::Compile(format!("layer '{}' requested twice", pair[0])));
    }

    Ok(sorted)
}

/// Deterministic identity of a chain built from `snapshots`
pub fn chain_id(snapshots: &[LayerSnapshot]) -> String {
    let canonical: Vec<String> = snapshots.iter().map(LayerSnapshot::describe).collect();
    let digest = Sha256::digest(canonical.join("|").as_bytes());
    digest[..16].iter().map(|b| format!("{b:02x}")).collect()
}

fn build_chain(id: String, layers: Vec<Layer>, snapshots: Vec<LayerSnapshot>) -> CompiledChain {
    let total = snapshots.iter().map(|s| s.entries.len()).sum();
    let mut handlers = Vec::with_capacity(total);
    let mut handler_names = Vec::with_capacity(total);

    for snapshot in snapshots {
        for (name, _, handler) in snapshot.entries {
            handler_names.push(format!("{}/{}", snapshot.layer, name));
            handlers.push(handler);
        }
    }

    CompiledChain {
        id,
        layers,
        handler_names,
        handlers: handlers.into(),
        built_at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use strata_core::handler_fn;

    fn recorder() -> Arc<Mutex<Vec<String>>> {
        Arc::new(Mutex::new(Vec::new()))
    }

    fn recording(log: &Arc<Mutex<Vec<String>>>, name: &str) -> BoxedHandler {
        let log = Arc::clone(log);
        let name = name.to_string();
        handler_fn(move |_ctx| log.lock().push(name.clone()))
    }

    #[test]
    fn test_compilation_is_idempotent() {
        let pipeline = LayeredPipeline::new();
        let log = recorder();
        pipeline.use_handler(Layer::Global, "a", recording(&log, "a"), 2).unwrap();
        pipeline.use_handler(Layer::Group, "b", recording(&log, "b"), 1).unwrap();

        let compiler = ChainCompiler::new();
        let first = compiler.compile_chain(&pipeline, &[Layer::Global, Layer::Group]).unwrap();
        let second = compiler.compile_chain(&pipeline, &[Layer::Global, Layer::Group]).unwrap();

        assert_eq!(first.id(), second.id());
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.handler_names(), second.handler_names());

        let stats = compiler.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.compiles, 1);
    }

    #[test]
    fn test_recompilation_from_cold_cache_matches() {
        let pipeline = LayeredPipeline::new();
        pipeline.use_handler(Layer::Global, "x", handler_fn(|_| {}), 3).unwrap();

        let a = ChainCompiler::new().compile_chain(&pipeline, &[Layer::Global]).unwrap();
        let b = ChainCompiler::new().compile_chain(&pipeline, &[Layer::Global]).unwrap();
        assert_eq!(a.id(), b.id());
        assert_eq!(a.handler_names(), b.handler_names());
    }

    #[test]
    fn test_layer_order_is_normalized() {
        let pipeline = LayeredPipeline::new();
        let log = recorder();
        pipeline.use_handler(Layer::Route, "route", recording(&log, "route"), 0).unwrap();
        pipeline.use_handler(Layer::Global, "global", recording(&log, "global"), 99).unwrap();

        let compiler = ChainCompiler::new();
        let chain = compiler.compile_chain(&pipeline, &[Layer::Route, Layer::Global]).unwrap();
        chain.execute(&mut Context::new());

        assert_eq!(*log.lock(), vec!["global", "route"]);
        assert_eq!(chain.layers(), &[Layer::Global, Layer::Route]);
    }

    #[test]
    fn test_malformed_layer_lists() {
        let pipeline = LayeredPipeline::new();
        let compiler = ChainCompiler::new();

        assert!(matches!(
            compiler.compile_chain(&pipeline, &[]),
            Err(Error::Compile(_))
        ));
        assert!(matches!(
            compiler.compile_chain(&pipeline, &[Layer::Group, Layer::Group]),
            Err(Error::Compile(_))
        ));
    }

    #[test]
    fn test_abort_short_circuits_later_layers() {
        let pipeline = LayeredPipeline::new();
        let log = recorder();
        pipeline.use_handler(Layer::Global, "g", recording(&log, "g"), 0).unwrap();
        pipeline
            .use_handler(Layer::Route, "guard", handler_fn(|ctx| ctx.abort()), 0)
            .unwrap();
        pipeline.use_handler(Layer::Route, "r2", recording(&log, "r2"), 1).unwrap();
        pipeline
            .use_handler(Layer::Controller, "c", recording(&log, "c"), 0)
            .unwrap();

        let compiler = ChainCompiler::new();
        let chain = compiler.compile_chain(&pipeline, &Layer::ALL).unwrap();
        let mut ctx = Context::new();
        chain.execute(&mut ctx);

        assert_eq!(*log.lock(), vec!["g"]);
        assert!(ctx.is_aborted());
    }

    #[test]
    fn test_invalidation_only_touches_dependent_chains() {
        let pipeline = LayeredPipeline::new();
        pipeline.use_handler(Layer::Global, "g", handler_fn(|_| {}), 0).unwrap();
        pipeline.use_handler(Layer::Route, "r", handler_fn(|_| {}), 0).unwrap();

        let compiler = ChainCompiler::new();
        let global = compiler.compile_chain(&pipeline, &[Layer::Global]).unwrap();
        let with_route = compiler
            .compile_chain(&pipeline, &[Layer::Global, Layer::Route])
            .unwrap();
        assert_eq!(compiler.stats().cached, 2);

        pipeline.disable_middleware(Layer::Route, "r").unwrap();
        assert_eq!(compiler.invalidate_layer(Layer::Route), 1);
        assert!(compiler.is_cached(global.id()));
        assert!(!compiler.is_cached(with_route.id()));

        let hits_before = compiler.stats().hits;
        let again = compiler.compile_chain(&pipeline, &[Layer::Global]).unwrap();
        assert_eq!(again.id(), global.id());
        assert_eq!(compiler.stats().hits, hits_before + 1);

        let rebuilt = compiler
            .compile_chain(&pipeline, &[Layer::Global, Layer::Route])
            .unwrap();
        assert_ne!(rebuilt.id(), with_route.id());
        assert_eq!(rebuilt.len(), 1);
    }

    #[test]
    fn test_chain_id_depends_on_priority() {
        let a = LayeredPipeline::new();
        a.use_handler(Layer::Global, "m", handler_fn(|_| {}), 1).unwrap();
        let b = LayeredPipeline::new();
        b.use_handler(Layer::Global, "m", handler_fn(|_| {}), 2).unwrap();

        let id_a = chain_id(&[a.snapshot(Layer::Global)]);
        let id_b = chain_id(&[b.snapshot(Layer::Global)]);
        assert_ne!(id_a, id_b);
        assert_eq!(id_a.len(), 32);
    }

    #[test]
    fn test_separator_names_compile_distinct_chains() {
        let pipeline = LayeredPipeline::new();
        pipeline.use_handler(Layer::Global, "x:1,y", handler_fn(|_| {}), 2).unwrap();
        pipeline.use_handler(Layer::Global, "x", handler_fn(|_| {}), 1).unwrap();
        pipeline.use_handler(Layer::Global, "y", handler_fn(|_| {}), 2).unwrap();
        pipeline.disable_middleware(Layer::Global, "x").unwrap();
        pipeline.disable_middleware(Layer::Global, "y").unwrap();

        let compiler = ChainCompiler::new();
        let first = compiler.compile_chain(&pipeline, &[Layer::Global]).unwrap();
        assert_eq!(first.handler_names(), &["global/x:1,y"]);

        pipeline.disable_middleware(Layer::Global, "x:1,y").unwrap();
        pipeline.enable_middleware(Layer::Global, "x").unwrap();
        pipeline.enable_middleware(Layer::Global, "y").unwrap();

        // No invalidation: the identity alone must tell the two sets apart
        let second = compiler.compile_chain(&pipeline, &[Layer::Global]).unwrap();
        assert_ne!(first.id(), second.id());
        assert_eq!(second.handler_names(), &["global/x", "global/y"]);
    }

    #[test]
    fn test_stats_hit_rate_without_lookups() {
        let compiler = ChainCompiler::new();
        assert_eq!(compiler.stats().hit_rate, 1.0);
    }
}
