//! Worker side of cross-process units.
//!
//! A binary that hosts parallelized functions becomes a worker by calling
//! [`run_if_requested`] first thing in `main`:
//!
//! ```no_run
//! use parallax_core::{Registry, worker};
//!
//! fn main() -> std::process::ExitCode {
//!     let registry = Registry::new();
//!     if let Some(code) = worker::run_if_requested(&registry) {
//!         return code;
//!     }
//!     // ... normal program ...
//!     std::process::ExitCode::SUCCESS
//! }
//! ```

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use crate::backend::run_unit;
use crate::error::{Error, Result};
use crate::registry::Registry;

use super::protocol::{UnitFile, UnitOutcome, outcome_path};

/// Environment variable carrying the unit file a worker should execute.
pub const UNIT_FILE_ENV: &str = "PARALLAX_UNIT_FILE";

/// Environment variable overriding the worker executable.
pub const WORKER_PATH_ENV: &str = "PARALLAX_WORKER_PATH";

/// Execute the unit named by `PARALLAX_UNIT_FILE`, if set.
///
/// Returns `None` when this process was not started as a worker.
pub fn run_if_requested(registry: &Registry) -> Option<ExitCode> {
    let path = std::env::var_os(UNIT_FILE_ENV)?;
    let path = PathBuf::from(path);

    Some(match run_unit_file(&path, registry) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("Unit {} failed: {}", path.display(), e);
            ExitCode::FAILURE
        }
    })
}

/// Execute one unit file and write its outcome file.
///
/// The outcome is written for every failure that happens after the unit file
/// was read, including unresolvable names and cache errors.
pub fn run_unit_file(path: &Path, registry: &Registry) -> Result<()> {
    let unit = UnitFile::read(path)?;
    tracing::debug!("Worker executing unit {} from {}", unit.key, path.display());

    let result = unit
        .cache
        .open()
        .and_then(|cache| Ok((cache, unit.to_key_group(registry)?)))
        .and_then(|(cache, group)| run_unit(&unit.key, &group, Some(cache)));

    let outcome = match &result {
        Ok(()) => UnitOutcome::Succeeded,
        Err(Error::Remote { message, .. }) => UnitOutcome::Failed {
            message: message.clone(),
        },
        Err(e) => UnitOutcome::Failed {
            message: e.to_string(),
        },
    };
    outcome.write(&outcome_path(path))?;
    result
}

/// Locate the executable that serves units.
///
/// Order:
/// 1. `PARALLAX_WORKER_PATH` environment variable
/// 2. the current executable
pub fn find_worker_binary() -> Result<PathBuf> {
    if let Ok(path) = std::env::var(WORKER_PATH_ENV) {
        let path = PathBuf::from(path);
        if path.exists() {
            return Ok(path);
        }
        tracing::warn!(
            "{} points at missing file {}; falling back to current executable",
            WORKER_PATH_ENV,
            path.display()
        );
    }

    std::env::current_exe()
        .map_err(|e| Error::Ipc(format!("Could not determine worker executable: {}", e)))
}

/// Resolve a program name the way a shell would.
///
/// Names containing a path separator are taken as paths.
pub fn resolve_program(program: &str) -> Result<PathBuf> {
    if program.contains(std::path::MAIN_SEPARATOR) {
        return Ok(PathBuf::from(program));
    }
    which::which(program).map_err(|e| Error::Ipc(format!("Could not find '{}': {}", program, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheHandle, DirectoryCache, PersistentCache, cached};
    use crate::intercept::Dispatchable;
    use crate::jobs::{Invocation, JobRegistry, RoutingKey};
    use crate::strategy::Sequential;
    use serde_json::json;
    use std::sync::Arc;
    use tempfile::TempDir;

    struct Square;

    impl Dispatchable for Square {
        fn name(&self) -> &'static str {
            "worker::square"
        }

        fn invoke(&self, args: &serde_json::Value) -> Result<()> {
            let n = args[0].as_i64().ok_or_else(|| Error::Execution("not a number".into()))?;
            cached(self.name(), args, || n * n);
            Ok(())
        }
    }

    static SQUARE: Square = Square;

    fn write_unit(dir: &Path, cache: CacheHandle, args: serde_json::Value) -> PathBuf {
        let key = RoutingKey::normalize(&0).unwrap();
        let mut registry = JobRegistry::new();
        registry.record(key.clone(), Arc::new(Sequential), &SQUARE, Invocation { args });
        let spec = registry.snapshot();
        let path = dir.join("square.unit.json");
        UnitFile::new(key.clone(), spec.unit(&key).unwrap(), cache)
            .write(&path)
            .unwrap();
        path
    }

    #[test]
    fn test_run_unit_file_fills_cache_and_reports_success() {
        let temp = TempDir::new().unwrap();
        let cache = DirectoryCache::new(temp.path().join("cache")).unwrap();
        let path = write_unit(temp.path(), cache.handle().unwrap(), json!([7]));

        run_unit_file(&path, &Registry::new().function(&SQUARE)).unwrap();

        let key = crate::cache::cache_key("worker::square", &json!([7])).unwrap();
        let stored: i64 = serde_json::from_slice(&cache.get(&key).unwrap().unwrap()).unwrap();
        assert_eq!(stored, 49);
        assert_eq!(
            UnitOutcome::read(&outcome_path(&path)).unwrap(),
            Some(UnitOutcome::Succeeded)
        );
    }

    #[test]
    fn test_run_unit_file_reports_failure() {
        let temp = TempDir::new().unwrap();
        let cache = DirectoryCache::new(temp.path().join("cache")).unwrap();
        let path = write_unit(temp.path(), cache.handle().unwrap(), json!(["x"]));

        let err = run_unit_file(&path, &Registry::new().function(&SQUARE)).unwrap_err();
        assert!(err.is_remote());

        match UnitOutcome::read(&outcome_path(&path)).unwrap() {
            Some(UnitOutcome::Failed { message }) => assert!(message.contains("not a number")),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_function_still_writes_outcome() {
        let temp = TempDir::new().unwrap();
        let cache = DirectoryCache::new(temp.path().join("cache")).unwrap();
        let path = write_unit(temp.path(), cache.handle().unwrap(), json!([1]));

        assert!(run_unit_file(&path, &Registry::new()).is_err());
        assert!(matches!(
            UnitOutcome::read(&outcome_path(&path)).unwrap(),
            Some(UnitOutcome::Failed { .. })
        ));
    }

    #[test]
    fn test_resolve_program_keeps_paths() {
        let path = format!("{}bin{}sh", std::path::MAIN_SEPARATOR, std::path::MAIN_SEPARATOR);
        assert_eq!(resolve_program(&path).unwrap(), PathBuf::from(&path));
    }
}
