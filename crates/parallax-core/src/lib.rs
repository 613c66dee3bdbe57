//! Core engine for Parallax parallelized functions.
//!
//! This crate provides:
//! - Thread-local capture of calls to parallelized functions
//! - Grouping of captured calls into job units by routing key
//! - Execution backends (synchronous, thread pool, worker processes, batch queue)
//! - The environment state machine that drives capture, dispatch and replay
//! - The persistent cache interface results travel through

pub mod backend;
pub mod cache;
pub mod capture;
pub mod env;
pub mod error;
pub mod intercept;
pub mod ipc;
pub mod jobs;
pub mod registry;
pub mod strategy;

pub use backend::{
    Backend, BatchBackend, BatchConfig, CompletionMode, JobHandle, Notifier, PoolBackend,
    ProcessBackend, SyncBackend, UnitId,
};
pub use cache::{
    CacheHandle, CacheScope, DirectoryCache, MemoryCache, PersistentCache, cached, caching_into,
    persistent_cache, set_persistent_cache,
};
pub use env::{DispatchCallback, EnvState, MonitorConfig, ParallelizedEnvironment};
pub use error::{Error, Result};
pub use intercept::{Dispatchable, Parallelized};
pub use ipc::worker;
pub use jobs::{Invocation, JobRegistry, JobSpec, KeyGroup, RoutingKey};
pub use registry::Registry;
pub use strategy::{BatchStrategy, Exhaustive, Sequential};
