//! Dispatch progress callbacks.

/// Observer for an environment's compute phase.
pub trait DispatchCallback: Send + Sync {
    /// Capture ended with `units` job units holding `calls` calls.
    fn on_captured(&self, _units: usize, _calls: usize) {}

    /// A prune left `total - completed` units running.
    fn on_progress(&self, completed: usize, total: usize);

    /// Every unit finished successfully.
    fn on_computed(&self) {}
}
