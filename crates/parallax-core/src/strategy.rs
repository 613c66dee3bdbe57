//! Batch strategies.
//!
//! A strategy decides how the calls recorded for one function inside one job
//! unit are executed together. Strategies are identified by name so a worker
//! process can resolve them from its [`Registry`](crate::Registry).

use crate::error::Result;
use crate::intercept::Dispatchable;
use crate::jobs::Invocation;

/// How a group of calls to the same function runs inside a unit.
pub trait BatchStrategy: Send + Sync {
    /// Stable name used for grouping and for remote resolution.
    fn name(&self) -> &str;

    /// Execute `calls` against `function`.
    fn run(&self, function: &dyn Dispatchable, calls: &[Invocation]) -> Result<()>;
}

/// Default strategy: one call at a time, in recording order, stopping at the
/// first failure.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sequential;

impl BatchStrategy for Sequential {
    fn name(&self) -> &str {
        "sequential"
    }

    fn run(&self, function: &dyn Dispatchable, calls: &[Invocation]) -> Result<()> {
        for call in calls {
            function.invoke(&call.args)?;
        }
        Ok(())
    }
}

/// Runs every call even when some fail, then reports the first failure.
///
/// Useful when calls are independent and partial results are still worth
/// caching.
#[derive(Debug, Clone, Copy, Default)]
pub struct Exhaustive;

impl BatchStrategy for Exhaustive {
    fn name(&self) -> &str {
        "exhaustive"
    }

    fn run(&self, function: &dyn Dispatchable, calls: &[Invocation]) -> Result<()> {
        let mut first_error = None;
        for call in calls {
            if let Err(e) = function.invoke(&call.args) {
                tracing::debug!("{} failed, continuing batch: {}", function.name(), e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}
