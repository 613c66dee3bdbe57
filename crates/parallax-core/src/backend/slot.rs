//! Completion slot shared by in-process backends.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

use crate::error::Result;

use super::JobHandle;

#[derive(Debug)]
enum SlotState {
    Running,
    Finished(Result<()>),
    Reported,
}

/// Outcome cell for one unit executing in this process.
///
/// Moves `Running -> Finished -> Reported`. The outcome is handed out once,
/// which is what makes a failure surface exactly once.
#[derive(Debug)]
pub struct UnitSlot {
    state: Mutex<SlotState>,
    done: Condvar,
}

impl UnitSlot {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SlotState::Running),
            done: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SlotState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record the unit's outcome and wake waiters.
    pub fn finish(&self, outcome: Result<()>) {
        let mut state = self.lock();
        if matches!(*state, SlotState::Running) {
            *state = SlotState::Finished(outcome);
        }
        self.done.notify_all();
    }

    pub fn is_running(&self) -> bool {
        matches!(*self.lock(), SlotState::Running)
    }

    /// `None` while running; afterwards the outcome on the first call and
    /// `Some(Ok(()))` on every later one.
    pub fn take_outcome(&self) -> Option<Result<()>> {
        let mut state = self.lock();
        match std::mem::replace(&mut *state, SlotState::Reported) {
            SlotState::Running => {
                *state = SlotState::Running;
                None
            }
            SlotState::Finished(outcome) => Some(outcome),
            SlotState::Reported => Some(Ok(())),
        }
    }

    /// Block until the unit has finished.
    pub fn wait(&self) {
        let mut state = self.lock();
        while matches!(*state, SlotState::Running) {
            state = self.done.wait(state).unwrap_or_else(PoisonError::into_inner);
        }
    }
}

impl Default for UnitSlot {
    fn default() -> Self {
        Self::new()
    }
}

/// `prune` for backends whose handles carry a [`UnitSlot`].
pub(crate) fn prune_slots(backend: &str, handles: &[JobHandle]) -> Result<Vec<JobHandle>> {
    let mut remaining = Vec::with_capacity(handles.len());
    for handle in handles {
        let slot = handle.expect_token::<UnitSlot>(backend)?;
        match slot.take_outcome() {
            None => remaining.push(handle.clone()),
            Some(Ok(())) => {}
            Some(Err(e)) => {
                tracing::debug!("{} reported failure of {}", backend, handle.unit());
                return Err(e);
            }
        }
    }
    Ok(remaining)
}

/// `wait` for backends whose handles carry a [`UnitSlot`].
pub(crate) fn wait_slot(backend: &str, handle: &JobHandle) -> Result<()> {
    handle.expect_token::<UnitSlot>(backend)?.wait();
    Ok(())
}
