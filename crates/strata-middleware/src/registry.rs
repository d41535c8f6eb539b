//! Middleware registry
//!
//! Two independent namespaces: builtin factories, which build a handler from
//! a configuration value, and custom handlers registered ready to use.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use strata_core::{BoxedHandler, Error, Result};
use tracing::info;

/// Builds a handler from an opaque configuration value
pub type BuiltinFactory = Arc<dyn Fn(&serde_json::Value) -> Result<BoxedHandler> + Send + Sync>;

/// Descriptive metadata stored alongside every registration
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MiddlewareMetadata {
    /// Middleware name
    pub name: String,
    /// Version string
    pub version: String,
    /// Short description
    pub description: String,
    /// Author
    pub author: String,
    /// Names of middleware that must run before this one
    pub dependencies: Vec<String>,
    /// Whether this is a builtin factory
    pub is_builtin: bool,
    /// Registration time, set by the registry
    pub created_at: DateTime<Utc>,
}

impl MiddlewareMetadata {
    /// Create metadata with the given name
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: "0.0.0".to_string(),
            description: String::new(),
            author: String::new(),
            dependencies: Vec::new(),
            is_builtin: false,
            created_at: Utc::now(),
        }
    }

    /// Set the version
    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Set the description
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Set the author
    pub fn author(mut self, author: impl Into<String>) -> Self {
        self.author = author.into();
        self
    }

    /// Declare a dependency
    pub fn depends_on(mut self, name: impl Into<String>) -> Self {
        self.dependencies.push(name.into());
        self
    }
}

struct BuiltinEntry {
    factory: BuiltinFactory,
    metadata: MiddlewareMetadata,
}

struct CustomEntry {
    handler: BoxedHandler,
    metadata: MiddlewareMetadata,
}

/// Registration counts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RegistryStats {
    /// Builtin factories
    pub builtin: usize,
    /// Custom handlers
    pub custom: usize,
}

/// Catalog of named middleware
pub struct MiddlewareRegistry {
    builtin: RwLock<HashMap<String, BuiltinEntry>>,
    custom: RwLock<HashMap<String, CustomEntry>>,
}

impl MiddlewareRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            builtin: RwLock::new(HashMap::new()),
            custom: RwLock::new(HashMap::new()),
        }
    }

    /// Create a registry with the builtin catalog already registered
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        crate::builtin::register_all(&registry);
        registry
    }

    /// Register a builtin factory
    pub fn register_builtin<F>(
        &self,
        name: impl Into<String>,
        factory: F,
        mut metadata: MiddlewareMetadata,
    ) -> Result<()>
    where
        F: Fn(&serde_json::Value) -> Result<BoxedHandler> + Send + Sync + 'static,
    {
        let name = name.into();
        let mut builtin = self.builtin.write();
        if builtin.contains_key(&name) {
            return Err(Error::already_registered("builtin middleware", name));
        }

        metadata.name = name.clone();
        metadata.is_builtin = true;
        metadata.created_at = Utc::now();
        builtin.insert(
            name.clone(),
            BuiltinEntry {
                factory: Arc::new(factory),
                metadata,
            },
        );

        info!(middleware = %name, "Builtin middleware registered");
        Ok(())
    }

    /// Register a ready-made handler
    pub fn register_custom(
        &self,
        name: impl Into<String>,
        handler: BoxedHandler,
        mut metadata: MiddlewareMetadata,
    ) -> Result<()> {
        let name = name.into();
        let mut custom = self.custom.write();
        if custom.contains_key(&name) {
            return Err(Error::already_registered("custom middleware", name));
        }

        metadata.name = name.clone();
        metadata.is_builtin = false;
        metadata.created_at = Utc::now();
        custom.insert(name.clone(), CustomEntry { handler, metadata });

        info!(middleware = %name, "Custom middleware registered");
        Ok(())
    }

    /// Builtin factory registered under `name`
    pub fn lookup_builtin(&self, name: &str) -> Option<BuiltinFactory> {
        self.builtin.read().get(name).map(|e| Arc::clone(&e.factory))
    }

    /// Custom handler registered under `name`
    pub fn lookup_custom(&self, name: &str) -> Option<BoxedHandler> {
        self.custom.read().get(name).map(|e| Arc::clone(&e.handler))
    }

    /// Build a handler from the builtin factory `name`
    pub fn instantiate(&self, name: &str, config: &serde_json::Value) -> Result<BoxedHandler> {
        let factory = self
            .lookup_builtin(name)
            .ok_or_else(|| Error::not_found("builtin middleware", name))?;
        factory(config)
    }

    /// Metadata for `name`, custom namespace first
    pub fn metadata(&self, name: &str) -> Option<MiddlewareMetadata> {
        if let Some(entry) = self.custom.read().get(name) {
            return Some(entry.metadata.clone());
        }
        self.builtin.read().get(name).map(|e| e.metadata.clone())
    }

    /// Names of builtin factories, sorted
    pub fn list_builtin(&self) -> Vec<String> {
        let mut names: Vec<String> = self.builtin.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Names of custom handlers, sorted
    pub fn list_custom(&self) -> Vec<String> {
        let mut names: Vec<String> = self.custom.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Dependencies of `name` that are not in `present`
    pub fn unmet_dependencies(&self, name: &str, present: &[String]) -> Vec<String> {
        self.metadata(name)
            .map(|m| {
                m.dependencies
                    .into_iter()
                    .filter(|d| !present.contains(d))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Registration counts
    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            builtin: self.builtin.read().len(),
            custom: self.custom.read().len(),
        }
    }
}

impl Default for MiddlewareRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MiddlewareRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MiddlewareRegistry")
            .field("builtin", &self.list_builtin())
            .field("custom", &self.list_custom())
            .finish()
    }
}
