//! Local worker process backend.
//!
//! Each unit runs in its own child process. The child is a fresh copy of a
//! binary that registered the same parallelized functions and calls
//! [`worker::run_if_requested`](crate::ipc::worker::run_if_requested) on start.
//!
//! At most `max_workers` children run at once; the rest stay queued and are
//! spawned by `prune` and `wait` as running children exit. If a spawn fails,
//! every child of the same `start` is killed and its unit files removed.

use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use crate::cache::PersistentCache;
use crate::error::{Error, Result};
use crate::ipc::worker::{UNIT_FILE_ENV, find_worker_binary};
use crate::ipc::{UnitFile, UnitOutcome, outcome_path};
use crate::jobs::JobSpec;

use super::{Backend, CompletionMode, JobHandle, Notifier, UnitId, prepare_dir};

/// How long [`Backend::wait`] sleeps while its unit is still queued.
const QUEUED_WAIT: Duration = Duration::from_millis(20);

/// Runs each unit in a worker process, at most `max_workers` at a time, and
/// polls them with `try_wait`.
#[derive(Debug, Clone)]
pub struct ProcessBackend {
    dir: PathBuf,
    worker: PathBuf,
    args: Vec<String>,
    max_workers: usize,
}

enum Worker {
    Queued,
    Running(Child),
    Exited(ExitStatus),
}

/// Per-unit state behind a [`JobHandle`].
struct ProcessUnit {
    worker: Mutex<Worker>,
    unit_path: PathBuf,
    reported: AtomicBool,
    launch: Arc<Launch>,
}

impl ProcessUnit {
    fn worker(&self) -> MutexGuard<'_, Worker> {
        self.worker.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Exit status, once the child has exited.
    fn poll(&self) -> Result<Option<ExitStatus>> {
        let mut worker = self.worker();
        match &mut *worker {
            Worker::Queued => Ok(None),
            Worker::Exited(status) => Ok(Some(*status)),
            Worker::Running(child) => {
                let status = child.try_wait()?;
                if let Some(status) = status {
                    *worker = Worker::Exited(status);
                }
                Ok(status)
            }
        }
    }

    fn remove_files(&self) {
        let _ = std::fs::remove_file(&self.unit_path);
        let _ = std::fs::remove_file(outcome_path(&self.unit_path));
    }
}

/// Units from one `start` call, launched in order as slots free up.
struct Launch {
    backend: ProcessBackend,
    units: Mutex<Vec<Weak<ProcessUnit>>>,
    aborted: AtomicBool,
}

impl Launch {
    fn units(&self) -> MutexGuard<'_, Vec<Weak<ProcessUnit>>> {
        self.units.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record exits of running children without reporting them.
    fn reap(&self) -> Result<()> {
        for unit in self.units().iter().filter_map(Weak::upgrade) {
            unit.poll()?;
        }
        Ok(())
    }

    /// Spawn queued units until `max_workers` children are running.
    fn fill(&self) -> Result<()> {
        if self.aborted.load(Ordering::SeqCst) {
            return Ok(());
        }
        let units = self.units();
        let live: Vec<_> = units.iter().filter_map(Weak::upgrade).collect();
        let mut running = live
            .iter()
            .filter(|unit| matches!(*unit.worker(), Worker::Running(_)))
            .count();

        for unit in &live {
            if running >= self.backend.max_workers {
                break;
            }
            let mut worker = unit.worker();
            if matches!(*worker, Worker::Queued) && !unit.reported.load(Ordering::SeqCst) {
                let child = self.backend.spawn(&unit.unit_path)?;
                tracing::debug!("Spawned worker {} for {}", child.id(), unit.unit_path.display());
                *worker = Worker::Running(child);
                running += 1;
            }
        }
        Ok(())
    }

    /// Kill and reap every running child and drop all unit files.
    fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
        for unit in self.units().iter().filter_map(Weak::upgrade) {
            let mut worker = unit.worker();
            if let Worker::Running(child) = &mut *worker {
                let _ = child.kill();
                match child.wait() {
                    Ok(status) => *worker = Worker::Exited(status),
                    Err(e) => tracing::warn!("Could not reap worker {}: {}", child.id(), e),
                }
            }
            unit.reported.store(true, Ordering::SeqCst);
            unit.remove_files();
        }
    }

    fn fill_or_abort(&self) -> Result<()> {
        self.fill().inspect_err(|e| {
            tracing::error!("Aborting {} process units: {}", self.units().len(), e);
            self.abort();
        })
    }
}

impl ProcessBackend {
    /// Backend keeping unit files under `dir`, using the discovered worker and
    /// one process per available CPU.
    pub fn new(dir: impl AsRef<Path>) -> Result<Self> {
        let max_workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Ok(Self {
            dir: prepare_dir(dir.as_ref())?,
            worker: find_worker_binary()?,
            args: Vec::new(),
            max_workers,
        })
    }

    /// Use `worker` instead of the discovered executable.
    pub fn with_worker(mut self, worker: impl Into<PathBuf>) -> Self {
        self.worker = worker.into();
        self
    }

    /// Extra arguments passed to every worker.
    pub fn with_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Limit the number of concurrently running workers (at least one).
    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers.max(1);
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn worker(&self) -> &Path {
        &self.worker
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    fn spawn(&self, unit_path: &Path) -> Result<Child> {
        Command::new(&self.worker)
            .args(&self.args)
            .env(UNIT_FILE_ENV, unit_path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| {
                Error::Ipc(format!(
                    "Failed to spawn worker process '{}': {}",
                    self.worker.display(),
                    e
                ))
            })
    }

    /// Outcome of a worker that has exited.
    fn collect(&self, handle: &JobHandle, unit: &ProcessUnit, status: ExitStatus) -> Result<()> {
        match UnitOutcome::read(&outcome_path(&unit.unit_path))? {
            Some(UnitOutcome::Succeeded) => {
                unit.remove_files();
                Ok(())
            }
            Some(UnitOutcome::Failed { message }) => Err(Error::Remote {
                key: handle.key().to_string(),
                message,
            }),
            None => Err(Error::Remote {
                key: handle.key().to_string(),
                message: format!("worker exited ({}) without reporting an outcome", status),
            }),
        }
    }
}

impl Backend for ProcessBackend {
    fn name(&self) -> &str {
        "process"
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
        let cache = cache.handle()?;
        let launch = Arc::new(Launch {
            backend: self.clone(),
            units: Mutex::new(Vec::with_capacity(jobs.len())),
            aborted: AtomicBool::new(false),
        });

        let mut handles = Vec::with_capacity(jobs.len());
        for (key, group) in jobs.into_units() {
            let unit_path = self
                .dir
                .join(format!("{}.unit.json", uuid::Uuid::new_v4().simple()));
            if let Err(e) = UnitFile::new(key.clone(), &group, cache.clone()).write(&unit_path) {
                launch.abort();
                return Err(e);
            }

            let unit = Arc::new(ProcessUnit {
                worker: Mutex::new(Worker::Queued),
                unit_path,
                reported: AtomicBool::new(false),
                launch: launch.clone(),
            });
            launch.units().push(Arc::downgrade(&unit));
            handles.push(JobHandle::new(UnitId::next(), key, unit));
        }

        launch.fill_or_abort()?;
        tracing::debug!(
            "Queued {} units for at most {} worker processes",
            handles.len(),
            self.max_workers
        );
        Ok(handles)
    }

    fn prune(&self, handles: &[JobHandle]) -> Result<Vec<JobHandle>> {
        let mut remaining = Vec::with_capacity(handles.len());
        let mut launches: Vec<Arc<Launch>> = Vec::new();
        for handle in handles {
            let unit = handle.expect_token::<ProcessUnit>(self.name())?;
            if unit.reported.load(Ordering::SeqCst) {
                continue;
            }

            match unit.poll()? {
                None => remaining.push(handle.clone()),
                Some(status) => {
                    if !unit.reported.swap(true, Ordering::SeqCst) {
                        self.collect(handle, unit, status)?;
                    }
                }
            }
            if !launches.iter().any(|l| Arc::ptr_eq(l, &unit.launch)) {
                launches.push(unit.launch.clone());
            }
        }

        // Freed slots go to queued units, which are already in `remaining`
        for launch in launches {
            launch.fill_or_abort()?;
        }
        Ok(remaining)
    }

    fn wait(&self, handle: &JobHandle) -> Result<()> {
        let unit = handle.expect_token::<ProcessUnit>(self.name())?;
        loop {
            {
                let mut worker = unit.worker();
                match &mut *worker {
                    Worker::Running(child) => {
                        let status = child.wait()?;
                        *worker = Worker::Exited(status);
                        return Ok(());
                    }
                    Worker::Exited(_) => return Ok(()),
                    Worker::Queued => {}
                }
            }
            if unit.launch.aborted.load(Ordering::SeqCst) {
                return Ok(());
            }
            unit.launch.reap()?;
            unit.launch.fill_or_abort()?;
            if matches!(*unit.worker(), Worker::Queued) {
                std::thread::sleep(QUEUED_WAIT);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{DirectoryCache, MemoryCache};
    use crate::intercept::Dispatchable;
    use crate::jobs::{Invocation, JobRegistry, RoutingKey};
    use crate::strategy::Sequential;
    use tempfile::TempDir;

    struct Noop;

    impl Dispatchable for Noop {
        fn name(&self) -> &'static str {
            "process::noop"
        }

        fn invoke(&self, _args: &serde_json::Value) -> Result<()> {
            Ok(())
        }
    }

    static NOOP: Noop = Noop;

    fn one_unit() -> JobSpec {
        let mut registry = JobRegistry::new();
        registry.record(
            RoutingKey::unit(),
            Arc::new(Sequential),
            &NOOP,
            Invocation { args: serde_json::json!([]) },
        );
        registry.snapshot()
    }

    fn units(count: usize) -> JobSpec {
        let mut registry = JobRegistry::new();
        for i in 0..count {
            registry.record(
                RoutingKey::normalize(&i).unwrap(),
                Arc::new(Sequential),
                &NOOP,
                Invocation { args: serde_json::json!([i]) },
            );
        }
        registry.snapshot()
    }

    fn running(handles: &[JobHandle]) -> usize {
        handles
            .iter()
            .filter(|h| {
                let unit = h.token::<ProcessUnit>().unwrap();
                matches!(*unit.worker(), Worker::Running(_))
            })
            .count()
    }

    fn unit_files(dir: &Path) -> usize {
        std::fs::read_dir(dir)
            .unwrap()
            .filter(|entry| {
                let name = entry.as_ref().unwrap().file_name();
                name.to_string_lossy().ends_with(".unit.json")
            })
            .count()
    }

    const SUCCEED: &str =
        r#"printf '{"status":"succeeded"}' > "${PARALLAX_UNIT_FILE%.json}.outcome.json""#;

    #[test]
    fn test_memory_cache_is_rejected() {
        let temp = TempDir::new().unwrap();
        let backend = ProcessBackend::new(temp.path()).unwrap();

        let result = backend.start(Arc::new(MemoryCache::new()), one_unit(), None);
        assert!(matches!(result, Err(Error::Configuration(_))));
    }

    #[cfg(unix)]
    #[test]
    fn test_worker_without_outcome_is_a_remote_failure() {
        let temp = TempDir::new().unwrap();
        let cache = Arc::new(DirectoryCache::new(temp.path().join("cache")).unwrap());
        // `true` exits successfully without ever writing an outcome file
        let backend = ProcessBackend::new(temp.path().join("units"))
            .unwrap()
            .with_worker("/bin/sh")
            .with_args(["-c", "true"]);

        let handles = backend.start(cache, one_unit(), None).unwrap();
        backend.wait(&handles[0]).unwrap();

        let err = backend.prune(&handles).unwrap_err();
        assert!(err.is_remote());
        // Reported once; the handle is gone on the next prune
        assert!(backend.prune(&handles).unwrap().is_empty());
    }

    #[test]
    fn test_max_workers_is_at_least_one() {
        let temp = TempDir::new().unwrap();
        let backend = ProcessBackend::new(temp.path()).unwrap().with_max_workers(0);
        assert_eq!(backend.max_workers(), 1);
    }

    #[test]
    fn test_missing_worker_leaves_no_unit_files() {
        let temp = TempDir::new().unwrap();
        let cache = Arc::new(DirectoryCache::new(temp.path().join("cache")).unwrap());
        let dir = temp.path().join("units");
        let backend = ProcessBackend::new(&dir)
            .unwrap()
            .with_worker(temp.path().join("no-such-worker"));

        let err = backend.start(cache, units(3), None).unwrap_err();
        assert!(matches!(err, Error::Ipc(_)));
        assert_eq!(unit_files(&dir), 0);
    }

    #[cfg(unix)]
    #[test]
    fn test_running_workers_never_exceed_limit() {
        let temp = TempDir::new().unwrap();
        let cache = Arc::new(DirectoryCache::new(temp.path().join("cache")).unwrap());
        let dir = temp.path().join("units");
        let backend = ProcessBackend::new(&dir)
            .unwrap()
            .with_worker("/bin/sh")
            .with_args(["-c".to_string(), format!("sleep 0.2; {}", SUCCEED)])
            .with_max_workers(2);

        let handles = backend.start(cache, units(6), None).unwrap();
        assert_eq!(handles.len(), 6);

        let mut peak = running(&handles);
        let mut remaining = handles.clone();
        while !remaining.is_empty() {
            remaining = backend.prune(&remaining).unwrap();
            peak = peak.max(running(&handles));
            std::thread::sleep(Duration::from_millis(10));
        }

        assert!(peak >= 1);
        assert!(peak <= 2, "{} workers ran at once", peak);
        assert_eq!(unit_files(&dir), 0);
    }

    #[cfg(unix)]
    #[test]
    fn test_wait_launches_queued_units() {
        let temp = TempDir::new().unwrap();
        let cache = Arc::new(DirectoryCache::new(temp.path().join("cache")).unwrap());
        let backend = ProcessBackend::new(temp.path().join("units"))
            .unwrap()
            .with_worker("/bin/sh")
            .with_args(["-c", SUCCEED])
            .with_max_workers(1);

        let handles = backend.start(cache, units(3), None).unwrap();
        // The last unit is queued behind the other two
        backend.wait(&handles[2]).unwrap();
        for handle in &handles {
            backend.wait(handle).unwrap();
        }
        assert!(backend.prune(&handles).unwrap().is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn test_failed_spawn_kills_running_workers() {
        let temp = TempDir::new().unwrap();
        let cache = Arc::new(DirectoryCache::new(temp.path().join("cache")).unwrap());
        let dir = temp.path().join("units");
        let worker = temp.path().join("worker");
        std::os::unix::fs::symlink("/bin/sh", &worker).unwrap();

        // The first worker to take the lock succeeds, the others hang
        let script = format!(r#"mkdir "$0" 2>/dev/null && {{ {}; }} || sleep 30"#, SUCCEED);
        let backend = ProcessBackend::new(&dir)
            .unwrap()
            .with_worker(&worker)
            .with_args(vec![
                "-c".to_string(),
                script,
                temp.path().join("lock").display().to_string(),
            ])
            .with_max_workers(2);

        let handles = backend.start(cache, units(3), None).unwrap();
        assert_eq!(running(&handles), 2);
        // Later spawns of the third unit have nothing to execute
        std::fs::remove_file(&worker).unwrap();

        let mut remaining = handles.clone();
        let err = loop {
            match backend.prune(&remaining) {
                Ok(next) => remaining = next,
                Err(e) => break e,
            }
            assert!(!remaining.is_empty(), "third unit was never spawned");
            std::thread::sleep(Duration::from_millis(10));
        };

        assert!(matches!(err, Error::Ipc(_)), "{}", err);
        assert_eq!(running(&handles), 0);
        assert_eq!(unit_files(&dir), 0);
    }
}
