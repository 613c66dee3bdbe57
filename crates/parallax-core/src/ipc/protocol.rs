//! Unit files exchanged with worker processes.
//!
//! A unit crosses a process boundary as a JSON file holding everything the
//! worker needs: the routing key, a handle to reopen the persistent cache and
//! the recorded calls, with functions and strategies referenced by name. The
//! worker answers with an outcome file next to it.

use std::fs;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::cache::CacheHandle;
use crate::error::{Error, Result};
use crate::jobs::{FunctionGroup, Invocation, KeyGroup, RoutingKey, StrategyGroup};
use crate::registry::Registry;

/// Version tag written into every unit file.
pub const UNIT_FILE_VERSION: u32 = 1;

/// Serialized job unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitFile {
    pub version: u32,
    pub key: RoutingKey,
    pub cache: CacheHandle,
    pub groups: Vec<UnitGroup>,
}

/// Calls to one function under one strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitGroup {
    pub strategy: String,
    pub function: String,
    pub calls: Vec<Invocation>,
}

impl UnitFile {
    /// Flatten a key group into its portable form.
    pub fn new(key: RoutingKey, group: &KeyGroup, cache: CacheHandle) -> Self {
        let groups = group
            .strategies
            .iter()
            .flat_map(|(strategy, sg)| {
                sg.functions.iter().map(move |(function, fg)| UnitGroup {
                    strategy: strategy.clone(),
                    function: function.to_string(),
                    calls: fg.calls.clone(),
                })
            })
            .collect();

        Self {
            version: UNIT_FILE_VERSION,
            key,
            cache,
            groups,
        }
    }

    /// Rebuild the executable key group by resolving names in `registry`.
    pub fn to_key_group(&self, registry: &Registry) -> Result<KeyGroup> {
        let mut key_group = KeyGroup::default();
        for group in &self.groups {
            let function = registry.resolve_function(&group.function)?;
            if !key_group.strategies.contains_key(&group.strategy) {
                let strategy = registry.resolve_strategy(&group.strategy)?;
                key_group.strategies.insert(
                    group.strategy.clone(),
                    StrategyGroup {
                        strategy,
                        functions: Default::default(),
                    },
                );
            }
            if let Some(sg) = key_group.strategies.get_mut(&group.strategy) {
                sg.functions
                    .entry(function.name())
                    .or_insert_with(|| FunctionGroup {
                        function,
                        calls: Vec::new(),
                    })
                    .calls
                    .extend(group.calls.iter().cloned());
            }
        }
        Ok(key_group)
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        write_json(path, self)
    }

    pub fn read(path: &Path) -> Result<Self> {
        let unit: Self = read_json(path)?.ok_or_else(|| {
            Error::Ipc(format!("unit file {} does not exist", path.display()))
        })?;
        if unit.version != UNIT_FILE_VERSION {
            return Err(Error::Ipc(format!(
                "unit file {} has version {}, expected {}",
                path.display(),
                unit.version,
                UNIT_FILE_VERSION
            )));
        }
        Ok(unit)
    }
}

/// Result a worker reports for one unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum UnitOutcome {
    Succeeded,
    Failed { message: String },
}

impl UnitOutcome {
    pub fn write(&self, path: &Path) -> Result<()> {
        write_json(path, self)
    }

    /// `None` if the worker has not written an outcome.
    pub fn read(path: &Path) -> Result<Option<Self>> {
        read_json(path)
    }
}

/// Where the worker reports the outcome of `unit_path`.
pub fn outcome_path(unit_path: &Path) -> PathBuf {
    unit_path.with_extension("outcome.json")
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value).map_err(|e| Error::Serialization(e.to_string()))?;
    // Readers poll for this file; never let them see it half written
    let tmp = path.with_extension(format!("tmp.{}", uuid::Uuid::new_v4().simple()));
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|e| Error::Deserialization(format!("{}: {}", path.display(), e)))
}
