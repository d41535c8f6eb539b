//! Layered middleware pipeline
//!
//! Middleware is registered into one of four fixed layers. Within a layer,
//! entries are kept sorted by ascending priority; entries with equal priority
//! keep their registration order.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use strata_core::{BoxedHandler, Error, Result};
use tracing::{debug, info};

/// Precedence tier a middleware is registered into
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum Layer {
    /// Runs first, for every request
    Global = 0,
    /// Route-group middleware
    Group = 1,
    /// Per-route middleware
    Route = 2,
    /// Controller-level middleware, runs last
    Controller = 3,
}

impl Layer {
    /// All layers in precedence order
    pub const ALL: [Layer; 4] = [Layer::Global, Layer::Group, Layer::Route, Layer::Controller];

    /// Layer name
    pub const fn name(self) -> &'static str {
        match self {
            Layer::Global => "global",
            Layer::Group => "group",
            Layer::Route => "route",
            Layer::Controller => "controller",
        }
    }

    /// Position in precedence order
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Layer combinations most requests resolve to
    pub fn common_sets() -> Vec<Vec<Layer>> {
        (1..=Self::ALL.len())
            .map(|n| Self::ALL[..n].to_vec())
            .collect()
    }
}

impl fmt::Display for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Layer {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "global" => Ok(Layer::Global),
            "group" => Ok(Layer::Group),
            "route" => Ok(Layer::Route),
            "controller" => Ok(Layer::Controller),
            _ => Err(Error::not_found("layer", s)),
        }
    }
}

/// A middleware registered into a layer
#[derive(Clone)]
pub struct MiddlewareEntry {
    /// Entry name, unique within its layer
    pub name: String,
    /// The handler
    pub handler: BoxedHandler,
    /// Lower runs first
    pub priority: i32,
    /// Disabled entries keep their position but are skipped at compile time
    pub enabled: bool,
}

impl fmt::Debug for MiddlewareEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MiddlewareEntry")
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("enabled", &self.enabled)
            .finish()
    }
}

/// Introspection view of an entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntryInfo {
    /// Entry name
    pub name: String,
    /// Priority
    pub priority: i32,
    /// Whether the entry is enabled
    pub enabled: bool,
}

/// The enabled entries of one layer at one point in time
#[derive(Clone)]
pub struct LayerSnapshot {
    /// Layer the snapshot was taken from
    pub layer: Layer,
    /// Enabled entries in execution order
    pub entries: Vec<(String, i32, BoxedHandler)>,
}

impl LayerSnapshot {
    /// Canonical description used for chain identity, e.g. `global[8:recovery:5,6:logger:10]`.
    ///
    /// Names are length-prefixed so separators inside a name cannot collide
    /// with another entry set.
    pub fn describe(&self) -> String {
        let entries: Vec<String> = self
            .entries
            .iter()
            .map(|(name, priority, _)| format!("{}:{name}:{priority}", name.len()))
            .collect();
        format!("{}[{}]", self.layer, entries.join(","))
    }
}

impl fmt::Debug for LayerSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe())
    }
}

/// Four independently locked layers of middleware entries
pub struct LayeredPipeline {
    layers: [RwLock<Vec<MiddlewareEntry>>; 4],
}

impl LayeredPipeline {
    /// Create an empty pipeline
    pub fn new() -> Self {
        Self {
            layers: std::array::from_fn(|_| RwLock::new(Vec::new())),
        }
    }

    fn slot(&self, layer: Layer) -> &RwLock<Vec<MiddlewareEntry>> {
        &self.layers[layer.index()]
    }

    /// Add a handler to `layer`.
    ///
    /// The entry is inserted after every existing entry whose priority is
    /// lower or equal, which keeps the layer sorted and same-priority entries
    /// in registration order.
    pub fn use_handler(
        &self,
        layer: Layer,
        name: impl Into<String>,
        handler: BoxedHandler,
        priority: i32,
    ) -> Result<()> {
        let name = name.into();
        let mut entries = self.slot(layer).write();

        if entries.iter().any(|e| e.name == name) {
            return Err(Error::already_registered("middleware entry", name));
        }

        let position = entries.partition_point(|e| e.priority <= priority);
        entries.insert(
            position,
            MiddlewareEntry {
                name: name.clone(),
                handler,
                priority,
                enabled: true,
            },
        );

        info!(layer = %layer, middleware = %name, priority, "Middleware added to layer");
        Ok(())
    }

    /// Enable an entry. Returns whether its state changed.
    pub fn enable_middleware(&self, layer: Layer, name: &str) -> Result<bool> {
        self.set_enabled(layer, name, true)
    }

    /// Disable an entry without removing it. Returns whether its state changed.
    pub fn disable_middleware(&self, layer: Layer, name: &str) -> Result<bool> {
        self.set_enabled(layer, name, false)
    }

    fn set_enabled(&self, layer: Layer, name: &str, enabled: bool) -> Result<bool> {
        let mut entries = self.slot(layer).write();
        let entry = entries
            .iter_mut()
            .find(|e| e.name == name)
            .ok_or_else(|| Error::not_found("middleware entry", format!("{layer}/{name}")))?;

        if entry.enabled == enabled {
            return Ok(false);
        }
        entry.enabled = enabled;

        debug!(layer = %layer, middleware = %name, enabled, "Middleware toggled");
        Ok(true)
    }

    /// Enabled entries of `layer` in execution order
    pub fn snapshot(&self, layer: Layer) -> LayerSnapshot {
        let entries = self.slot(layer).read();
        LayerSnapshot {
            layer,
            entries: entries
                .iter()
                .filter(|e| e.enabled)
                .map(|e| (e.name.clone(), e.priority, e.handler.clone()))
                .collect(),
        }
    }

    /// All entries of `layer`, enabled or not, in execution order
    pub fn entries(&self, layer: Layer) -> Vec<EntryInfo> {
        self.slot(layer)
            .read()
            .iter()
            .map(|e| EntryInfo {
                name: e.name.clone(),
                priority: e.priority,
                enabled: e.enabled,
            })
            .collect()
    }

    /// Whether `layer` has an entry called `name`
    pub fn contains(&self, layer: Layer, name: &str) -> bool {
        self.slot(layer).read().iter().any(|e| e.name == name)
    }

    /// Number of entries in `layer`
    pub fn len(&self, layer: Layer) -> usize {
        self.slot(layer).read().len()
    }

    /// Whether every layer is empty
    pub fn is_empty(&self) -> bool {
        Layer::ALL.iter().all(|l| self.len(*l) == 0)
    }

    /// Total number of entries across all layers
    pub fn total(&self) -> usize {
        Layer::ALL.iter().map(|l| self.len(*l)).sum()
    }
}

impl Default for LayeredPipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for LayeredPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("LayeredPipeline");
        for layer in Layer::ALL {
            s.field(layer.name(), &self.len(layer));
        }
        s.finish()
    }
}
