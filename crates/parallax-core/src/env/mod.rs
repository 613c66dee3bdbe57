//! Parallelized environment.
//!
//! A [`ParallelizedEnvironment`] runs the same body of code twice: once while
//! capturing, when parallelized calls are only recorded, and once after the
//! recorded calls were executed on a backend, when the same calls find their
//! results in the persistent cache. During that second pass the environment's
//! cache is the current cache of the calling thread.
//!
//! ```text
//!  NotCaptured ──advance──► Captured ──advance──► Computed ──advance──► Done
//!       │        (true)                 (true)                (false)
//!       └── no backend ──advance──► Done (true)
//! ```
//!
//! ```ignore
//! let mut env = ParallelizedEnvironment::new(Some(backend))?;
//! while env.advance()? {
//!     let total = add(1, 2) + add(3, 4);
//! }
//! ```

mod callback;
mod config;
mod monitor;

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::backend::{Backend, CompletionMode, Notifier};
use crate::cache::{CacheScope, PersistentCache, persistent_cache};
use crate::capture::{self, CaptureContext};
use crate::error::{Error, Result};

pub use callback::DispatchCallback;
pub use config::{MonitorConfig, POLL_INTERVAL_ENV, PROGRESS_ENV};

use monitor::Monitor;

/// Lifecycle state of an environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvState {
    NotCaptured,
    Captured,
    Computed,
    Done,
}

/// Capture/dispatch driver for a body of code.
///
/// Bound to the thread that created it, since capture state is thread-local.
pub struct ParallelizedEnvironment {
    backend: Option<Arc<dyn Backend>>,
    cache: Option<Arc<dyn PersistentCache>>,
    config: MonitorConfig,
    callback: Option<Arc<dyn DispatchCallback>>,
    context: Arc<CaptureContext>,
    state: EnvState,
    replay: Option<CacheScope>,
    _thread: PhantomData<*const ()>,
}

impl ParallelizedEnvironment {
    /// Create an environment using the current persistent cache.
    ///
    /// With a backend, a persistent cache is required; without one, calls run
    /// transparently and no cache is needed.
    pub fn new(backend: Option<Arc<dyn Backend>>) -> Result<Self> {
        let cache = persistent_cache();
        if backend.is_some() && cache.is_none() {
            return Err(Error::Configuration(
                "a persistent cache must be set before creating a parallelized environment"
                    .to_string(),
            ));
        }
        Ok(Self::build(backend, cache))
    }

    /// Create an environment with an explicit cache.
    pub fn with_cache(backend: Option<Arc<dyn Backend>>, cache: Arc<dyn PersistentCache>) -> Self {
        Self::build(backend, Some(cache))
    }

    fn build(backend: Option<Arc<dyn Backend>>, cache: Option<Arc<dyn PersistentCache>>) -> Self {
        Self {
            backend,
            cache,
            config: MonitorConfig::default(),
            callback: None,
            context: Arc::new(CaptureContext::new()),
            state: EnvState::NotCaptured,
            replay: None,
            _thread: PhantomData,
        }
    }

    /// Replace the monitor configuration.
    pub fn with_config(mut self, config: MonitorConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the progress callback.
    pub fn set_callback(&mut self, callback: impl DispatchCallback + 'static) {
        self.callback = Some(Arc::new(callback));
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    pub fn state(&self) -> EnvState {
        self.state
    }

    /// Whether parallelized calls on this thread are currently being recorded.
    pub fn capturing(&self) -> bool {
        self.state == EnvState::Captured
    }

    /// Move to the next state.
    ///
    /// Returns whether the caller should run its body (again). Errors end the
    /// environment in [`EnvState::Done`].
    pub fn advance(&mut self) -> Result<bool> {
        match self.state {
            EnvState::NotCaptured => {
                if self.backend.is_none() {
                    tracing::debug!("No backend configured; running body directly");
                    self.state = EnvState::Done;
                    return Ok(true);
                }
                if let Err(e) = capture::install(self.context.clone()) {
                    self.state = EnvState::Done;
                    return Err(e);
                }
                tracing::debug!("Capture started (context {})", self.context.id());
                self.state = EnvState::Captured;
                Ok(true)
            }
            EnvState::Captured => match self.compute() {
                Ok(()) => {
                    // Replay reads results from the environment's cache
                    self.replay = self.cache.clone().map(CacheScope::enter);
                    self.state = EnvState::Computed;
                    Ok(true)
                }
                Err(e) => {
                    self.state = EnvState::Done;
                    Err(e)
                }
            },
            EnvState::Computed | EnvState::Done => {
                self.replay = None;
                self.state = EnvState::Done;
                Ok(false)
            }
        }
    }

    /// Run `body` through the whole lifecycle and return its last value.
    ///
    /// Values produced while capturing are placeholders and are discarded.
    pub fn run<T>(&mut self, mut body: impl FnMut() -> T) -> Result<T> {
        let mut last = None;
        while self.advance()? {
            last = Some(body());
        }
        last.ok_or_else(|| Error::Configuration("environment has already run".to_string()))
    }

    /// End capture and execute everything recorded.
    fn compute(&self) -> Result<()> {
        capture::clear(&self.context);
        if let Some(e) = self.context.take_poison() {
            return Err(e);
        }

        let jobs = self.context.jobs().snapshot();
        tracing::debug!("Captured {} calls in {} job units", jobs.call_count(), jobs.len());
        if let Some(callback) = &self.callback {
            callback.on_captured(jobs.len(), jobs.call_count());
        }
        if jobs.is_empty() {
            return Ok(());
        }

        let (Some(backend), Some(cache)) = (&self.backend, &self.cache) else {
            return Err(Error::Configuration(
                "cannot dispatch captured calls without a backend and a persistent cache"
                    .to_string(),
            ));
        };

        let total = jobs.len();
        let monitor = Monitor::new(
            backend.as_ref(),
            &self.config,
            self.callback.as_deref(),
            total,
        );

        match backend.mode() {
            CompletionMode::Poll => {
                let handles = backend.start(cache.clone(), jobs, None)?;
                tracing::debug!("{} backend started {} units; polling", backend.name(), total);
                monitor.poll(handles)?;
            }
            CompletionMode::Notify => {
                let (notifier, rx) = Notifier::channel();
                let handles = backend.start(cache.clone(), jobs, Some(notifier))?;
                tracing::debug!("{} backend started {} units; awaiting notifications", backend.name(), total);
                monitor.notify(handles, rx)?;
            }
        }

        if let Some(callback) = &self.callback {
            callback.on_computed();
        }
        Ok(())
    }
}

impl Drop for ParallelizedEnvironment {
    fn drop(&mut self) {
        capture::clear(&self.context);
    }
}

impl fmt::Debug for ParallelizedEnvironment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParallelizedEnvironment")
            .field("backend", &self.backend.as_ref().map(|b| b.name().to_string()))
            .field("cache", &self.cache)
            .field("config", &self.config)
            .field("state", &self.state)
            .finish()
    }
}
