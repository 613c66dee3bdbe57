//! Demonstration computation.

use std::sync::atomic::{AtomicUsize, Ordering};

use parallax::prelude::*;

/// Calls the `run` command makes, in order.
pub const INPUTS: [(i64, i64); 3] = [(1, 2), (3, 4), (5, 6)];

/// Executions of `add` performed by this process (cache hits excluded).
static LOCAL_EXECUTIONS: AtomicUsize = AtomicUsize::new(0);

#[parallelized(key = |a, _b| *a, name = "demo::add")]
pub fn add(a: i64, b: i64) -> i64 {
    cached("demo::add", &(a, b), || {
        LOCAL_EXECUTIONS.fetch_add(1, Ordering::SeqCst);
        tracing::debug!("Computing add({}, {})", a, b);
        a + b
    })
}

pub fn local_executions() -> usize {
    LOCAL_EXECUTIONS.load(Ordering::SeqCst)
}

/// Everything a worker process may be asked to run.
pub fn registry() -> Registry {
    Registry::new().function(&ADD_PARALLELIZED)
}
