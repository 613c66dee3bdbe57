//! Parallax CLI - run parallelized computations and serve worker units.

mod demo;
mod run;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand, ValueEnum};
use parallax::worker;

#[derive(Parser)]
#[command(name = "parallax")]
#[command(about = "Capture function calls, run them on a parallel backend, replay from cache")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the demonstration computation
    Run {
        /// Where captured calls execute
        #[arg(short, long, value_enum, default_value_t = BackendKind::Pool)]
        backend: BackendKind,

        /// Worker threads (pool) or concurrent worker processes (process) (default: available parallelism)
        #[arg(short, long)]
        workers: Option<usize>,

        /// Persistent cache directory
        #[arg(long, default_value = ".parallax/cache")]
        cache_dir: PathBuf,

        /// Metadata directory for process and batch units
        #[arg(long, default_value = ".parallax/units")]
        work_dir: PathBuf,

        /// Completion poll interval in milliseconds (default: PARALLAX_POLL_INTERVAL_MS or 5000)
        #[arg(long)]
        interval_ms: Option<u64>,

        /// Log progress while units complete
        #[arg(long)]
        progress: bool,
    },
}

/// Execution backend selectable from the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BackendKind {
    /// Run units one after another in this process
    Sync,
    /// Run units on a thread pool
    Pool,
    /// Run each unit in a worker process
    Process,
    /// Submit each unit as a detached local batch job
    Batch,
    /// No backend: calls run directly
    None,
}

fn main() -> ExitCode {
    // Units handed to this binary by the process and batch backends
    if std::env::var_os(worker::UNIT_FILE_ENV).is_some() {
        init_logging(tracing::Level::WARN);
        if let Some(code) = worker::run_if_requested(&demo::registry()) {
            return code;
        }
    }

    let cli = Cli::parse();
    let progress = matches!(cli.command, Commands::Run { progress: true, .. });
    init_logging(if cli.verbose {
        tracing::Level::DEBUG
    } else if progress {
        tracing::Level::INFO
    } else {
        tracing::Level::WARN
    });

    let result = match cli.command {
        Commands::Run {
            backend,
            workers,
            cache_dir,
            work_dir,
            interval_ms,
            progress,
        } => run::execute(&run::RunOptions {
            backend,
            workers,
            cache_dir,
            work_dir,
            interval_ms,
            progress,
        }),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn init_logging(level: tracing::Level) {
    let filter = tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into());

    // Already installed when a worker falls through to the CLI
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}
