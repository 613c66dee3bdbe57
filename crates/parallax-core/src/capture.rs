//! Thread-local capture marker.
//!
//! Holds the capture context of the environment that is currently capturing
//! on this thread. Parallelized functions consult it on every call.

use std::cell::RefCell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::{Error, Result};
use crate::jobs::JobRegistry;

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// Capture context of the environment capturing on this thread, if any.
    static ACTIVE: RefCell<Option<Arc<CaptureContext>>> = const { RefCell::new(None) };
}

/// Recording target for one capture phase.
///
/// Owns the job registry that intercepted calls are appended to. The first
/// error raised while recording poisons the context; the environment reports
/// it when capture ends.
#[derive(Debug)]
pub struct CaptureContext {
    id: u64,
    jobs: Mutex<JobRegistry>,
    poisoned: Mutex<Option<Error>>,
}

impl CaptureContext {
    /// Create an empty context.
    pub fn new() -> Self {
        Self {
            id: NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed),
            jobs: Mutex::new(JobRegistry::new()),
            poisoned: Mutex::new(None),
        }
    }

    /// Process-unique identifier of this context.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Lock the job registry.
    ///
    /// A poisoned lock only means a recording thread panicked mid-append;
    /// the registry itself stays structurally valid.
    pub fn jobs(&self) -> MutexGuard<'_, JobRegistry> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Remember a recording failure. Only the first one is kept.
    pub fn poison(&self, error: Error) {
        let mut slot = self.poisoned.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            *slot = Some(error);
        }
    }

    /// Take the recording failure, if any.
    pub fn take_poison(&self) -> Option<Error> {
        self.poisoned
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

impl Default for CaptureContext {
    fn default() -> Self {
        Self::new()
    }
}

/// The capture context active on this thread.
pub fn active() -> Option<Arc<CaptureContext>> {
    ACTIVE.with(|cell| cell.borrow().clone())
}

/// Whether any capture context is active on this thread.
pub fn is_capturing() -> bool {
    ACTIVE.with(|cell| cell.borrow().is_some())
}

/// Install `context` as the active capture context for this thread.
///
/// Fails if a different context is already installed. Re-installing the same
/// context is a no-op.
pub fn install(context: Arc<CaptureContext>) -> Result<()> {
    ACTIVE.with(|cell| {
        let mut slot = cell.borrow_mut();
        match slot.as_ref() {
            Some(current) if current.id != context.id => Err(Error::CaptureActive),
            _ => {
                *slot = Some(context);
                Ok(())
            }
        }
    })
}

/// Remove `context` from this thread if it is the active one.
///
/// Returns whether anything was removed.
pub fn clear(context: &CaptureContext) -> bool {
    ACTIVE.with(|cell| {
        let mut slot = cell.borrow_mut();
        if slot.as_ref().is_some_and(|current| current.id == context.id) {
            *slot = None;
            true
        } else {
            false
        }
    })
}
