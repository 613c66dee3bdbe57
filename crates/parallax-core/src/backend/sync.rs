//! Synchronous backend.

use std::sync::Arc;

use crate::cache::PersistentCache;
use crate::error::Result;
use crate::jobs::JobSpec;

use super::slot::{UnitSlot, prune_slots, wait_slot};
use super::{Backend, CompletionMode, JobHandle, Notifier, UnitId, run_unit};

/// Runs every unit to completion inside `start`, in key order.
///
/// All handles it returns are already complete, so the first prune reports
/// any failure.
#[derive(Debug, Clone, Copy, Default)]
pub struct SyncBackend;

impl SyncBackend {
    pub fn new() -> Self {
        Self
    }
}

impl Backend for SyncBackend {
    fn name(&self) -> &str {
        "sync"
    }

    fn mode(&self) -> CompletionMode {
        CompletionMode::Poll
    }

    fn start(
        &self,
        cache: Arc<dyn PersistentCache>,
        jobs: JobSpec,
        _notifier: Option<Notifier>,
    ) -> Result<Vec<JobHandle>> {
        let mut handles = Vec::with_capacity(jobs.len());
        for (key, group) in jobs.into_units() {
            let slot = Arc::new(UnitSlot::new());
            slot.finish(run_unit(&key, &group, Some(cache.clone())));
            handles.push(JobHandle::new(UnitId::next(), key, slot));
        }
        Ok(handles)
    }

    fn prune(&self, handles: &[JobHandle]) -> Result<Vec<JobHandle>> {
        prune_slots(self.name(), handles)
    }

    fn wait(&self, handle: &JobHandle) -> Result<()> {
        wait_slot(self.name(), handle)
    }
}
