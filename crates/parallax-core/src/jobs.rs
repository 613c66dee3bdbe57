//! Job registry and grouping model.
//!
//! Intercepted calls are accumulated into a fixed three-level structure:
//!
//! ```text
//! JobSpec
//!  └── RoutingKey            one job unit per key
//!       └── StrategyGroup    keyed by batch strategy name
//!            └── FunctionGroup  keyed by function name
//!                 └── Vec<Invocation>
//! ```
//!
//! Groups are created explicitly on first use; nothing auto-vivifies.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::intercept::Dispatchable;
use crate::strategy::BatchStrategy;

/// Normalized grouping key for job units.
///
/// Keys are stored as canonical JSON text: the user's key value is converted
/// to a `serde_json::Value` (object members sorted) and rendered compactly.
/// Two values that serialize identically land in the same unit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoutingKey(String);

impl RoutingKey {
    /// Normalize an arbitrary serializable value into a routing key.
    ///
    /// Fails for values JSON cannot represent as a stable structure, such as
    /// maps with non-string keys.
    pub fn normalize<K: Serialize + ?Sized>(value: &K) -> std::result::Result<Self, serde_json::Error> {
        let value = serde_json::to_value(value)?;
        Ok(Self(value.to_string()))
    }

    /// The key shared by every call when no key function is configured.
    pub fn unit() -> Self {
        Self("null".to_string())
    }

    /// Canonical text form.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoutingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One recorded call: the positional arguments as a JSON array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invocation {
    pub args: serde_json::Value,
}

impl Invocation {
    /// Serialize an argument tuple.
    pub fn from_args<A: Serialize>(args: &A) -> std::result::Result<Self, serde_json::Error> {
        Ok(Self {
            args: serde_json::to_value(args)?,
        })
    }
}

/// All calls to one function under one strategy within a unit.
#[derive(Clone)]
pub struct FunctionGroup {
    pub function: &'static dyn Dispatchable,
    pub calls: Vec<Invocation>,
}

impl fmt::Debug for FunctionGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionGroup")
            .field("function", &self.function.name())
            .field("calls", &self.calls)
            .finish()
    }
}

/// Function groups sharing one batch strategy.
#[derive(Clone)]
pub struct StrategyGroup {
    pub strategy: Arc<dyn BatchStrategy>,
    pub functions: BTreeMap<&'static str, FunctionGroup>,
}

impl fmt::Debug for StrategyGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StrategyGroup")
            .field("strategy", &self.strategy.name())
            .field("functions", &self.functions)
            .finish()
    }
}

/// Everything one job unit has to execute.
#[derive(Debug, Clone, Default)]
pub struct KeyGroup {
    pub strategies: BTreeMap<String, StrategyGroup>,
}

impl KeyGroup {
    /// Number of calls in this unit.
    pub fn call_count(&self) -> usize {
        self.strategies
            .values()
            .flat_map(|s| s.functions.values())
            .map(|f| f.calls.len())
            .sum()
    }

    /// Run every function group through its strategy, in key order.
    ///
    /// Stops at the first failing group.
    pub fn execute(&self) -> Result<()> {
        for group in self.strategies.values() {
            for functions in group.functions.values() {
                group.strategy.run(functions.function, &functions.calls)?;
            }
        }
        Ok(())
    }
}

/// Immutable snapshot of a capture phase, handed to a backend.
#[derive(Debug, Clone, Default)]
pub struct JobSpec {
    units: BTreeMap<RoutingKey, KeyGroup>,
}

impl JobSpec {
    /// Number of job units (distinct routing keys).
    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// Total number of recorded calls.
    pub fn call_count(&self) -> usize {
        self.units.values().map(KeyGroup::call_count).sum()
    }

    /// Look up one unit.
    pub fn unit(&self, key: &RoutingKey) -> Option<&KeyGroup> {
        self.units.get(key)
    }

    /// Iterate over units in key order.
    pub fn units(&self) -> impl Iterator<Item = (&RoutingKey, &KeyGroup)> {
        self.units.iter()
    }

    /// Consume the spec into its units.
    pub fn into_units(self) -> impl Iterator<Item = (RoutingKey, KeyGroup)> {
        self.units.into_iter()
    }
}

/// Mutable accumulator of intercepted calls.
#[derive(Debug, Default)]
pub struct JobRegistry {
    units: BTreeMap<RoutingKey, KeyGroup>,
    calls: usize,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `invocation` under `[key][strategy][function]`.
    pub fn record(
        &mut self,
        key: RoutingKey,
        strategy: Arc<dyn BatchStrategy>,
        function: &'static dyn Dispatchable,
        invocation: Invocation,
    ) {
        let unit = self.units.entry(key).or_insert_with(KeyGroup::default);

        let strategy_name = strategy.name().to_string();
        let strategy_group = unit
            .strategies
            .entry(strategy_name)
            .or_insert_with(|| StrategyGroup {
                strategy,
                functions: BTreeMap::new(),
            });

        strategy_group
            .functions
            .entry(function.name())
            .or_insert_with(|| FunctionGroup {
                function,
                calls: Vec::new(),
            })
            .calls
            .push(invocation);

        self.calls += 1;
    }

    /// Number of recorded calls.
    pub fn len(&self) -> usize {
        self.calls
    }

    pub fn is_empty(&self) -> bool {
        self.calls == 0
    }

    /// Copy the current structure for handoff to a backend.
    pub fn snapshot(&self) -> JobSpec {
        JobSpec {
            units: self.units.clone(),
        }
    }
}
