//! Completion monitor.
//!
//! Drives a backend's handles to completion, either by polling at a fixed
//! interval or by reacting to completion notifications.

use crossbeam_channel::Receiver;

use crate::backend::{Backend, JobHandle, UnitId};
use crate::error::{Error, Result};

use super::callback::DispatchCallback;
use super::config::MonitorConfig;

pub(crate) struct Monitor<'a> {
    backend: &'a dyn Backend,
    config: &'a MonitorConfig,
    callback: Option<&'a dyn DispatchCallback>,
    total: usize,
}

impl<'a> Monitor<'a> {
    pub(crate) fn new(
        backend: &'a dyn Backend,
        config: &'a MonitorConfig,
        callback: Option<&'a dyn DispatchCallback>,
        total: usize,
    ) -> Self {
        Self {
            backend,
            config,
            callback,
            total,
        }
    }

    /// Prune, sleep, repeat until nothing is left.
    ///
    /// The first prune happens immediately so backends that finish inside
    /// `start` never pay an interval.
    pub(crate) fn poll(&self, mut handles: Vec<JobHandle>) -> Result<()> {
        loop {
            handles = self.backend.prune(&handles)?;
            self.report(handles.len());
            if handles.is_empty() {
                return Ok(());
            }
            std::thread::sleep(self.config.poll_interval);
        }
    }

    /// Wait for notifications until nothing is left.
    ///
    /// A notification may arrive before the backend marks the unit complete,
    /// so the unit is waited on before pruning. Notifications for units that
    /// are already gone are ignored.
    pub(crate) fn notify(&self, mut handles: Vec<JobHandle>, rx: Receiver<UnitId>) -> Result<()> {
        while !handles.is_empty() {
            match rx.recv() {
                Ok(unit) => {
                    let Some(handle) = handles.iter().find(|h| h.unit() == unit) else {
                        tracing::trace!("Ignoring stale notification for {}", unit);
                        continue;
                    };
                    self.backend.wait(handle)?;
                }
                Err(_) => {
                    // Every notifier is gone; nothing else will arrive
                    tracing::debug!(
                        "Notification channel closed with {} units left; waiting on them",
                        handles.len()
                    );
                    for handle in &handles {
                        self.backend.wait(handle)?;
                    }
                    handles = self.backend.prune(&handles)?;
                    self.report(handles.len());
                    if !handles.is_empty() {
                        return Err(Error::Backend(format!(
                            "{} backend still reports {} running units after waiting on them",
                            self.backend.name(),
                            handles.len()
                        )));
                    }
                    return Ok(());
                }
            }

            handles = self.backend.prune(&handles)?;
            self.report(handles.len());
        }
        Ok(())
    }

    fn report(&self, remaining: usize) {
        let completed = self.total.saturating_sub(remaining);
        if self.config.progress {
            tracing::info!("{}/{} job units complete", completed, self.total);
        }
        if let Some(callback) = self.callback {
            callback.on_progress(completed, self.total);
        }
    }
}
