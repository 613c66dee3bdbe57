//! Thread pool backend.
//!
//! Units run on a dedicated rayon pool so the number of concurrently running
//! units is bounded by the pool size, independent of the global rayon pool.

use std::sync::Arc;

use rayon::{ThreadPool, ThreadPoolBuilder};

use crate::cache::PersistentCache;
use crate::error::{Error, Result};
use crate::jobs::JobSpec;

use super::slot::{UnitSlot, prune_slots, wait_slot};
use super::{Backend, CompletionMode, JobHandle, Notifier, UnitId, run_unit};

/// Executes units on a fixed-size worker pool and notifies on completion.
pub struct PoolBackend {
    pool: ThreadPool,
    workers: usize,
}

impl PoolBackend {
    /// Create a pool with `workers` threads (at least one).
    pub fn new(workers: usize) -> Result<Self> {
        let workers = workers.max(1);
        let pool = ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("parallax-pool-{}", i))
            .build()
            .map_err(|e| Error::Backend(format!("failed to build thread pool: {}", e)))?;
        Ok(Self { pool, workers })
    }

    /// Pool sized to the available parallelism.
    pub fn with_available_parallelism() -> Result<Self> {
        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self::new(workers)
    }

    pub fn workers(&self) -> usize {
        self.workers
    }
}

impl std::fmt::Debug for PoolBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolBackend")
            .field("workers", &self.workers)
            .finish()
    }
}

impl Backend for PoolBackend {
    fn name(&self) -> &str {
        "pool"
    }

    fn mode(&self) -> CompletionMode {
        CompletionMode::Notify
    }

    fn start(
        &self,
        cache: Arc<dyn PersistentCache>,
        jobs: JobSpec,
        notifier: Option<Notifier>,
    ) -> Result<Vec<JobHandle>> {
        let mut handles = Vec::with_capacity(jobs.len());
        for (key, group) in jobs.into_units() {
            let unit = UnitId::next();
            let slot = Arc::new(UnitSlot::new());
            handles.push(JobHandle::new(unit, key.clone(), slot.clone()));

            let cache = cache.clone();
            let notifier = notifier.clone();
            self.pool.spawn(move || {
                slot.finish(run_unit(&key, &group, Some(cache)));
                if let Some(notifier) = notifier {
                    notifier.notify(unit);
                }
            });
        }
        tracing::debug!("Queued {} units on {} pool threads", handles.len(), self.workers);
        Ok(handles)
    }

    fn prune(&self, handles: &[JobHandle]) -> Result<Vec<JobHandle>> {
        prune_slots(self.name(), handles)
    }

    fn wait(&self, handle: &JobHandle) -> Result<()> {
        wait_slot(self.name(), handle)
    }
}
