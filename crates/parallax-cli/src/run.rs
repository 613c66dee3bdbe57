//! Run command implementation for Parallax CLI.
//!
//! Drives the demonstration computation through a parallelized environment on
//! the selected backend and prints the replayed results.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use parallax::{
    Backend, BatchBackend, BatchConfig, DirectoryCache, MonitorConfig, ParallelizedEnvironment,
    PoolBackend, ProcessBackend, SyncBackend, set_persistent_cache,
};

use crate::BackendKind;
use crate::demo::{self, INPUTS, add};

/// Options of the `run` command.
#[derive(Debug)]
pub struct RunOptions {
    pub backend: BackendKind,
    pub workers: Option<usize>,
    pub cache_dir: PathBuf,
    pub work_dir: PathBuf,
    pub interval_ms: Option<u64>,
    pub progress: bool,
}

/// Execute the demonstration computation.
pub fn execute(options: &RunOptions) -> anyhow::Result<()> {
    let start = Instant::now();

    let cache = DirectoryCache::new(&options.cache_dir).with_context(|| {
        format!("Failed to open cache directory {}", options.cache_dir.display())
    })?;
    set_persistent_cache(Some(Arc::new(cache)));

    let backend = build_backend(options)?;
    let mut config = MonitorConfig::from_env();
    if let Some(ms) = options.interval_ms {
        config = config.with_poll_interval(Duration::from_millis(ms));
    }
    if options.progress {
        config = config.with_progress(true);
    }

    let mut env = ParallelizedEnvironment::new(backend)
        .context("Failed to create parallelized environment")?
        .with_config(config);

    let mut results = Vec::new();
    while env.advance()? {
        results = INPUTS.iter().map(|&(a, b)| (a, b, add(a, b))).collect();
    }

    for (a, b, sum) in &results {
        println!("add({}, {}) = {}", a, b, sum);
    }
    println!("local executions: {}", demo::local_executions());
    tracing::info!(
        "Completed {:?} run in {:.2}s",
        options.backend,
        start.elapsed().as_secs_f64()
    );

    Ok(())
}

fn build_backend(options: &RunOptions) -> anyhow::Result<Option<Arc<dyn Backend>>> {
    let backend: Arc<dyn Backend> = match options.backend {
        BackendKind::None => return Ok(None),
        BackendKind::Sync => Arc::new(SyncBackend::new()),
        BackendKind::Pool => Arc::new(match options.workers {
            Some(workers) => PoolBackend::new(workers)?,
            None => PoolBackend::with_available_parallelism()?,
        }),
        BackendKind::Process => {
            let backend = ProcessBackend::new(options.work_dir.join("process"))
                .context("Failed to prepare process backend")?;
            Arc::new(match options.workers {
                Some(workers) => backend.with_max_workers(workers),
                None => backend,
            })
        }
        BackendKind::Batch => {
            let mut config = BatchConfig::local(options.work_dir.join("batch"));
            if let Some(ms) = options.interval_ms {
                config = config.with_poll_interval(Duration::from_millis(ms));
            }
            let backend = BatchBackend::new(config).context("Failed to prepare batch backend")?;
            if !backend.is_available() {
                anyhow::bail!("batch backend needs `sh` and `test` on PATH");
            }
            Arc::new(backend)
        }
    };
    Ok(Some(backend))
}
