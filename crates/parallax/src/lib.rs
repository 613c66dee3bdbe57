//! Parallax: capture function calls, run them on a parallel backend, replay
//! the results from a persistent cache.
//!
//! Parallax provides:
//! - **Capture**: inside a [`ParallelizedEnvironment`], calls to parallelized
//!   functions are recorded and return a placeholder
//! - **Dispatch**: recorded calls are grouped by routing key into job units and
//!   run on a backend (in-process, thread pool, worker processes, batch queue)
//! - **Replay**: the same code runs again and every call finds its result in
//!   the persistent cache
//!
//! The functions themselves are expected to memoize through [`cached`]; Parallax
//! only decides where and when they first run.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use parallax::prelude::*;
//!
//! #[parallelized(key = |a, _b| *a)]
//! pub fn add(a: i64, b: i64) -> i64 {
//!     cached("add", &(a, b), || a + b)
//! }
//!
//! set_persistent_cache(Some(Arc::new(DirectoryCache::new("cache")?)));
//! let mut env = ParallelizedEnvironment::new(Some(Arc::new(PoolBackend::new(4)?)))?;
//! while env.advance()? {
//!     // First pass: placeholders. Second pass: real results.
//!     let total = add(1, 2) + add(3, 4);
//! }
//! ```
//!
//! # Worker processes
//!
//! The process and batch backends re-run the current executable with
//! `PARALLAX_UNIT_FILE` set. Binaries using them hand control to the worker
//! entry before doing anything else:
//!
//! ```rust,ignore
//! fn main() -> ExitCode {
//!     let registry = Registry::new().function(&ADD_PARALLELIZED);
//!     if let Some(code) = worker::run_if_requested(&registry) {
//!         return code;
//!     }
//!     // ...
//! }
//! ```
//!
//! Engine internals (job registry, capture context, unit files) live in
//! `parallax-core` and may change without notice.

extern crate self as parallax;

pub use parallax_macros::parallelized;

pub use parallax_core::{
    Backend, BatchBackend, BatchConfig, BatchStrategy, CacheHandle, CacheScope, CompletionMode,
    DirectoryCache, DispatchCallback, Dispatchable, EnvState, Error, Exhaustive, JobHandle,
    MemoryCache, MonitorConfig, Notifier, Parallelized, ParallelizedEnvironment,
    PersistentCache, PoolBackend, ProcessBackend, Registry, Result, Sequential, SyncBackend,
    UnitId, cached, caching_into, persistent_cache, set_persistent_cache, worker,
};

pub mod prelude {
    //! Common imports for code using parallelized functions.
    //!
    //! ```rust,ignore
    //! use parallax::prelude::*;
    //! ```

    pub use crate::parallelized;
    pub use crate::{
        Backend, BatchBackend, BatchConfig, DirectoryCache, DispatchCallback, MemoryCache,
        MonitorConfig, Parallelized, ParallelizedEnvironment, PersistentCache, PoolBackend,
        ProcessBackend, Registry, SyncBackend, cached, set_persistent_cache, worker,
    };

    // Arguments and results travel as JSON
    pub use serde::{Deserialize, Serialize};

    pub use std::process::ExitCode;
    pub use std::sync::Arc;
}

/// Items the `#[parallelized]` expansion refers to.
#[doc(hidden)]
pub mod __private {
    pub use std::sync::LazyLock;
}
