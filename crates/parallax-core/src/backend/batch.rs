//! Batch queue backend.
//!
//! Every unit becomes a small shell script that re-launches a worker binary on
//! a unit file. Scripts are handed to a submit command and tracked with a
//! status command, which covers `qsub`/`qstat` style schedulers:
//!
//! - the submit command prints the job id on stdout
//! - the status command exits zero while the job is still known to the queue
//!
//! Command templates may use `{script}`, `{dir}`, `{job}`, `{outcome}` and
//! `{exit}` (a file the script writes the worker's exit code to).

use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::cache::PersistentCache;
use crate::error::{Error, Result};
use crate::ipc::worker::{UNIT_FILE_ENV, find_worker_binary, resolve_program};
use crate::ipc::{UnitFile, UnitOutcome, outcome_path};
use crate::jobs::JobSpec;

use super::{Backend, CompletionMode, JobHandle, Notifier, UnitId, prepare_dir};

/// Batch queue settings.
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Metadata directory for scripts, unit files and outcomes. Must be
    /// visible to the machines that run the jobs.
    pub dir: PathBuf,
    /// Submit command; prints the job id.
    pub submit: Vec<String>,
    /// Status command; exits zero while the job is pending or running.
    pub status: Vec<String>,
    /// Worker command line. Empty means the discovered worker executable.
    pub worker: Vec<String>,
    /// Sleep between status checks in [`Backend::wait`].
    pub poll_interval: Duration,
}

impl BatchConfig {
    /// `qsub` to submit and `qstat` to check status.
    pub fn qsub(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            submit: vec!["qsub".into(), "{script}".into()],
            status: vec!["qstat".into(), "{job}".into()],
            worker: Vec::new(),
            poll_interval: Duration::from_secs(5),
        }
    }

    /// Run scripts as detached local processes.
    ///
    /// The job id is the pid; a job counts as finished once its exit file
    /// exists.
    pub fn local(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            submit: vec![
                "sh".into(),
                "-c".into(),
                r#"sh "$0" >/dev/null 2>&1 & echo $!"#.into(),
                "{script}".into(),
            ],
            status: vec!["test".into(), "!".into(), "-e".into(), "{exit}".into()],
            worker: Vec::new(),
            poll_interval: Duration::from_millis(200),
        }
    }

    pub fn with_worker(mut self, worker: Vec<String>) -> Self {
        self.worker = worker;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// Submits one script per unit to a batch queue.
#[derive(Debug, Clone)]
pub struct BatchBackend {
    config: BatchConfig,
    worker: Vec<String>,
}

struct BatchUnit {
    job: String,
    paths: UnitPaths,
    reported: AtomicBool,
}

/// Paths belonging to one submitted unit.
struct UnitPaths {
    unit: PathBuf,
    script: PathBuf,
    outcome: PathBuf,
    exit: PathBuf,
}

impl UnitPaths {
    fn new(dir: &Path) -> Self {
        let id = uuid::Uuid::new_v4().simple().to_string();
        let unit = dir.join(format!("{}.unit.json", id));
        Self {
            script: dir.join(format!("{}.sh", id)),
            outcome: outcome_path(&unit),
            exit: dir.join(format!("{}.exit", id)),
            unit,
        }
    }

    fn remove(&self) {
        for path in [&self.unit, &self.script, &self.outcome, &self.exit] {
            let _ = std::fs::remove_file(path);
        }
    }
}

impl BatchBackend {
    /// Validate `config` and create its metadata directory.
    pub fn new(mut config: BatchConfig) -> Result<Self> {
        if config.submit.is_empty() || config.status.is_empty() {
            return Err(Error::Configuration(
                "batch submit and status commands must not be empty".to_string(),
            ));
        }
        config.dir = prepare_dir(&config.dir)?;

        let worker = if config.worker.is_empty() {
            vec![find_worker_binary()?.to_string_lossy().into_owned()]
        } else {
            config.worker.clone()
        };
        Ok(Self { config, worker })
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    /// Whether the submit and status programs can be found on `PATH`.
    pub fn is_available(&self) -> bool {
        [&self.config.submit[0], &self.config.status[0]]
            .into_iter()
            .all(|program| resolve_program(program).is_ok())
    }

    fn script(&self, key: &str, paths: &UnitPaths) -> String {
        let mut script = String::from("#!/bin/sh\n");
        let _ = writeln!(script, "# parallax unit {}", key.replace('\n', " "));
        let _ = write!(script, "{}={}", UNIT_FILE_ENV, shell_quote(&paths.unit.to_string_lossy()));
        for arg in &self.worker {
            let _ = write!(script, " {}", shell_quote(arg));
        }
        let _ = writeln!(script, "\necho $? > {}", shell_quote(&paths.exit.to_string_lossy()));
        script
    }

    fn submit(&self, paths: &UnitPaths) -> Result<String> {
        let argv = self.expand(
            &self.config.submit,
            &[
                ("{script}", &*paths.script.to_string_lossy()),
                ("{outcome}", &*paths.outcome.to_string_lossy()),
                ("{exit}", &*paths.exit.to_string_lossy()),
            ],
        );
        let output = command(&argv)?
            .stdin(Stdio::null())
            .output()
            .map_err(|e| Error::Ipc(format!("Failed to run submit command '{}': {}", argv[0], e)))?;

        if !output.status.success() {
            return Err(Error::Backend(format!(
                "submit command exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let job = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if job.is_empty() {
            return Err(Error::Backend("submit command printed no job id".to_string()));
        }
        Ok(job)
    }

    fn is_running(&self, unit: &BatchUnit) -> Result<bool> {
        let argv = self.expand(
            &self.config.status,
            &[
                ("{job}", unit.job.as_str()),
                ("{outcome}", &*unit.paths.outcome.to_string_lossy()),
                ("{exit}", &*unit.paths.exit.to_string_lossy()),
            ],
        );
        let status = command(&argv)?
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map_err(|e| Error::Ipc(format!("Failed to run status command '{}': {}", argv[0], e)))?;
        Ok(status.success())
    }

    /// Substitute placeholders; `{dir}` is always available.
    fn expand(&self, template: &[String], vars: &[(&str, &str)]) -> Vec<String> {
        let dir = self.config.dir.to_string_lossy();
        template
            .iter()
            .map(|part| {
                let part = part.replace("{dir}", &dir);
                vars.iter()
                    .fold(part, |part, (name, value)| part.replace(name, value))
            })
            .collect()
    }
}

impl Backend for BatchBackend {
    fn name(&self) -> &str {
        "batch"
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

        let mut handles = Vec::with_capacity(jobs.len());
        for (key, group) in jobs.into_units() {
            let paths = UnitPaths::new(&self.config.dir);
            let submitted = UnitFile::new(key.clone(), &group, cache.clone())
                .write(&paths.unit)
                .and_then(|()| write_script(&paths.script, &self.script(key.as_str(), &paths)))
                .and_then(|()| self.submit(&paths));
            let job = match submitted {
                Ok(job) => job,
                Err(e) => {
                    paths.remove();
                    abandon(&handles);
                    return Err(e);
                }
            };
            tracing::debug!("Submitted unit {} as batch job {}", key, job);

            let token = BatchUnit {
                job,
                paths,
                reported: AtomicBool::new(false),
            };
            handles.push(JobHandle::new(UnitId::next(), key, Arc::new(token)));
        }
        Ok(handles)
    }

    fn prune(&self, handles: &[JobHandle]) -> Result<Vec<JobHandle>> {
        let mut remaining = Vec::with_capacity(handles.len());
        for handle in handles {
            let unit = handle.expect_token::<BatchUnit>(self.name())?;
            if unit.reported.load(Ordering::SeqCst) {
                continue;
            }
            if self.is_running(unit)? {
                remaining.push(handle.clone());
                continue;
            }
            if unit.reported.swap(true, Ordering::SeqCst) {
                continue;
            }

            match UnitOutcome::read(&unit.paths.outcome)? {
                Some(UnitOutcome::Succeeded) => unit.paths.remove(),
                Some(UnitOutcome::Failed { message }) => {
                    return Err(Error::Remote {
                        key: handle.key().to_string(),
                        message,
                    });
                }
                None => {
                    return Err(Error::Remote {
                        key: handle.key().to_string(),
                        message: format!("batch job {} finished without reporting an outcome", unit.job),
                    });
                }
            }
        }
        Ok(remaining)
    }

    fn wait(&self, handle: &JobHandle) -> Result<()> {
        let unit = handle.expect_token::<BatchUnit>(self.name())?;
        // Reported units may already have lost their exit file
        while !unit.reported.load(Ordering::SeqCst) && self.is_running(unit)? {
            std::thread::sleep(self.config.poll_interval);
        }
        Ok(())
    }
}

/// Drop the files of units from a failed `start`. Jobs already queued cannot
/// be recalled and will fail on their missing unit file.
fn abandon(handles: &[JobHandle]) {
    let jobs: Vec<&str> = handles
        .iter()
        .filter_map(|handle| handle.token::<BatchUnit>())
        .map(|unit| {
            unit.paths.remove();
            unit.job.as_str()
        })
        .collect();
    if !jobs.is_empty() {
        tracing::warn!("Abandoning submitted batch jobs: {}", jobs.join(", "));
    }
}

fn command(argv: &[String]) -> Result<Command> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| Error::Configuration("empty command template".to_string()))?;
    let mut command = Command::new(program);
    command.args(args);
    Ok(command)
}

fn write_script(path: &Path, contents: &str) -> Result<()> {
    std::fs::write(path, contents)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))?;
    }
    Ok(())
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}
