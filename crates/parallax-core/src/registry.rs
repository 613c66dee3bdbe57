//! Name-based lookup of parallelized functions and batch strategies.
//!
//! Units that cross a process boundary only carry names. The receiving
//! process resolves them against a [`Registry`] it built from the same
//! statics the sending process used.

use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::error::{Error, Result};
use crate::intercept::Dispatchable;
use crate::strategy::{BatchStrategy, Exhaustive, Sequential};

/// Lookup table from stable names to functions and strategies.
///
/// The built-in strategies are always registered.
#[derive(Clone)]
pub struct Registry {
    functions: FxHashMap<&'static str, &'static dyn Dispatchable>,
    strategies: FxHashMap<String, Arc<dyn BatchStrategy>>,
}

impl Registry {
    pub fn new() -> Self {
        let mut registry = Self {
            functions: FxHashMap::default(),
            strategies: FxHashMap::default(),
        };
        registry.add_strategy(Arc::new(Sequential));
        registry.add_strategy(Arc::new(Exhaustive));
        registry
    }

    /// Register a function under its own name.
    pub fn function(mut self, function: &'static dyn Dispatchable) -> Self {
        self.add_function(function);
        self
    }

    /// Register a batch strategy under its own name.
    pub fn strategy(mut self, strategy: impl BatchStrategy + 'static) -> Self {
        self.add_strategy(Arc::new(strategy));
        self
    }

    pub fn add_function(&mut self, function: &'static dyn Dispatchable) {
        if let Some(previous) = self.functions.insert(function.name(), function)
            && !std::ptr::addr_eq(previous, function)
        {
            tracing::warn!("Function {} registered twice; keeping the latest", function.name());
        }
    }

    pub fn add_strategy(&mut self, strategy: Arc<dyn BatchStrategy>) {
        self.strategies.insert(strategy.name().to_string(), strategy);
    }

    /// Resolve a function by name.
    pub fn resolve_function(&self, name: &str) -> Result<&'static dyn Dispatchable> {
        self.functions
            .get(name)
            .copied()
            .ok_or_else(|| Error::UnknownFunction(name.to_string()))
    }

    /// Resolve a batch strategy by name.
    pub fn resolve_strategy(&self, name: &str) -> Result<Arc<dyn BatchStrategy>> {
        self.strategies
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownStrategy(name.to_string()))
    }

    /// Number of registered functions.
    pub fn function_count(&self) -> usize {
        self.functions.len()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
