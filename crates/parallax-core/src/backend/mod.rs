//! Execution backends for captured jobs.
//!
//! Every backend launches one asynchronous unit per routing key and lets the
//! environment monitor those units through [`Backend::prune`].
//!
//! # Backends
//!
//! - **`SyncBackend`** - Runs every unit inside `start`. Poll mode; useful as a
//!   reference implementation and in tests.
//! - **`PoolBackend`** - Rayon thread pool with bounded concurrency. Notify mode.
//! - **`ProcessBackend`** - One worker process per unit, re-launching a binary
//!   that hosts the same parallelized functions, with at most `max_workers`
//!   running at once. Poll mode.
//! - **`BatchBackend`** - Writes a self-contained script per unit and hands it
//!   to a batch queue (`qsub` style). Poll mode.
//!
//! # Architecture
//!
//! ```text
//! ParallelizedEnvironment
//!     │
//!     ├── Backend::start(cache, JobSpec, notifier) ──► Vec<JobHandle>
//!     │        one unit per RoutingKey
//!     │
//!     └── monitor loop
//!             ├── Poll:   sleep ─► prune ─► repeat
//!             └── Notify: recv(unit) ─► wait(unit) ─► prune ─► repeat
//! ```

mod batch;
mod pool;
mod process;
mod slot;
mod sync;

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_channel::{Receiver, Sender};

use crate::cache::{PersistentCache, caching_into};
use crate::error::{Error, Result};
use crate::jobs::{JobSpec, KeyGroup, RoutingKey};

pub use batch::{BatchBackend, BatchConfig};
pub use pool::PoolBackend;
pub use process::ProcessBackend;
pub use slot::UnitSlot;
pub use sync::SyncBackend;

/// How the environment learns that units have finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionMode {
    /// The environment re-checks at a fixed interval.
    Poll,
    /// The backend signals through a [`Notifier`].
    Notify,
}

/// Process-unique identifier of a launched unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UnitId(u64);

static NEXT_UNIT_ID: AtomicU64 = AtomicU64::new(1);

impl UnitId {
    /// Allocate a fresh id.
    pub fn next() -> Self {
        Self(NEXT_UNIT_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unit-{}", self.0)
    }
}

/// Handle to one unit in flight.
///
/// Cheap to clone. The token is backend-specific state; only the backend
/// that created the handle knows how to read it.
#[derive(Clone)]
pub struct JobHandle {
    unit: UnitId,
    key: RoutingKey,
    token: Arc<dyn Any + Send + Sync>,
}

impl JobHandle {
    pub fn new(unit: UnitId, key: RoutingKey, token: Arc<dyn Any + Send + Sync>) -> Self {
        Self { unit, key, token }
    }

    pub fn unit(&self) -> UnitId {
        self.unit
    }

    pub fn key(&self) -> &RoutingKey {
        &self.key
    }

    /// Downcast the backend token.
    pub fn token<T: Any>(&self) -> Option<&T> {
        self.token.downcast_ref::<T>()
    }

    /// Downcast the backend token, failing for handles from another backend.
    pub fn expect_token<T: Any>(&self, backend: &str) -> Result<&T> {
        self.token::<T>().ok_or_else(|| {
            Error::Backend(format!("{} was not started by the {} backend", self.unit, backend))
        })
    }
}

impl fmt::Debug for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobHandle")
            .field("unit", &self.unit)
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

/// Completion signal a Notify backend fires after a unit finishes.
///
/// Safe to clone and call from any thread. Firing does not guarantee the
/// backend already reports the unit as complete; the monitor waits on the
/// unit before trusting `prune`.
#[derive(Clone)]
pub struct Notifier {
    notify: Arc<dyn Fn(UnitId) + Send + Sync>,
}

impl Notifier {
    /// A notifier feeding a channel, plus the receiving end.
    pub fn channel() -> (Self, Receiver<UnitId>) {
        let (tx, rx): (Sender<UnitId>, Receiver<UnitId>) = crossbeam_channel::unbounded();
        let notifier = Self::from_fn(move |unit| {
            // The monitor may already be gone after a failure; nothing to tell then
            let _ = tx.send(unit);
        });
        (notifier, rx)
    }

    /// Wrap an arbitrary callback.
    pub fn from_fn(f: impl Fn(UnitId) + Send + Sync + 'static) -> Self {
        Self { notify: Arc::new(f) }
    }

    pub fn notify(&self, unit: UnitId) {
        (self.notify)(unit)
    }
}

impl fmt::Debug for Notifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Notifier")
    }
}

/// Contract every execution substrate implements.
///
/// Backends must be reusable across independent dispatch runs.
pub trait Backend: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &str;

    /// Whether the environment polls or waits for notifications.
    fn mode(&self) -> CompletionMode;

    /// Launch one unit per routing key without blocking.
    ///
    /// Notify backends must call `notifier` at least once after each unit
    /// completes. Poll backends receive `None`.
    fn start(
        &self,
        cache: Arc<dyn PersistentCache>,
        jobs: JobSpec,
        notifier: Option<Notifier>,
    ) -> Result<Vec<JobHandle>>;

    /// Return the handles that are still running.
    ///
    /// Never mutates `handles`. A completed unit's failure is returned exactly
    /// once; pruning the same handle again drops it silently.
    fn prune(&self, handles: &[JobHandle]) -> Result<Vec<JobHandle>>;

    /// Block until the unit behind `handle` is complete.
    fn wait(&self, handle: &JobHandle) -> Result<()>;
}

/// Execute one unit in the current thread under `cache`.
///
/// Failures and panics come back as [`Error::Remote`] tagged with the key.
pub fn run_unit(
    key: &RoutingKey,
    group: &KeyGroup,
    cache: Option<Arc<dyn PersistentCache>>,
) -> Result<()> {
    tracing::debug!("Running unit {} ({} calls)", key, group.call_count());

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| match cache {
        Some(cache) => caching_into(cache, || group.execute()),
        None => group.execute(),
    }));

    match outcome {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e @ Error::Remote { .. })) => Err(e),
        Ok(Err(e)) => Err(Error::Remote {
            key: key.to_string(),
            message: e.to_string(),
        }),
        Err(payload) => Err(Error::Remote {
            key: key.to_string(),
            message: format!("panicked: {}", panic_message(payload.as_ref())),
        }),
    }
}

/// Create a backend metadata directory, rejecting an existing non-directory.
pub(crate) fn prepare_dir(dir: &Path) -> Result<PathBuf> {
    if dir.exists() && !dir.is_dir() {
        return Err(Error::Configuration(format!(
            "{} exists and is not a directory",
            dir.display()
        )));
    }
    std::fs::create_dir_all(dir)?;
    Ok(dir.canonicalize()?)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intercept::Dispatchable;
    use crate::jobs::{Invocation, JobRegistry};
    use crate::strategy::Sequential;

    struct Explodes;

    impl Dispatchable for Explodes {
        fn name(&self) -> &'static str {
            "explodes"
        }

        fn invoke(&self, _args: &serde_json::Value) -> Result<()> {
            panic!("kaboom");
        }
    }

    static EXPLODES: Explodes = Explodes;

    #[test]
    fn test_run_unit_converts_panics() {
        let key = RoutingKey::normalize(&"k").unwrap();
        let mut registry = JobRegistry::new();
        registry.record(
            key.clone(),
            Arc::new(Sequential),
            &EXPLODES,
            Invocation { args: serde_json::json!([]) },
        );
        let spec = registry.snapshot();

        match run_unit(&key, spec.unit(&key).unwrap(), None) {
            Err(Error::Remote { key: k, message }) => {
                assert_eq!(k, key.to_string());
                assert!(message.contains("kaboom"));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn test_notifier_channel_delivers() {
        let (notifier, rx) = Notifier::channel();
        let unit = UnitId::next();
        let clone = notifier.clone();
        std::thread::spawn(move || clone.notify(unit)).join().unwrap();
        assert_eq!(rx.recv().unwrap(), unit);
    }

    #[test]
    fn test_handle_token_downcast() {
        let handle = JobHandle::new(UnitId::next(), RoutingKey::unit(), Arc::new(7u32));
        assert_eq!(handle.token::<u32>(), Some(&7));
        assert!(handle.token::<String>().is_none());
        assert!(matches!(handle.expect_token::<String>("test"), Err(Error::Backend(_))));
    }

    #[test]
    fn test_prepare_dir_rejects_files() {
        let temp = tempfile::TempDir::new().unwrap();
        let nested = temp.path().join("a/b");
        assert!(prepare_dir(&nested).unwrap().is_dir());

        let file = temp.path().join("file");
        std::fs::write(&file, "x").unwrap();
        assert!(matches!(prepare_dir(&file), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_unit_ids_are_unique() {
        assert_ne!(UnitId::next(), UnitId::next());
    }
}
