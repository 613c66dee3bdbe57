//! Error types for parallax-core.

use thiserror::Error;

/// Result type for parallax-core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in parallax-core.
#[derive(Debug, Error)]
pub enum Error {
    /// The environment is missing a collaborator it needs (e.g. no persistent cache).
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Another environment is already capturing on this thread.
    #[error("another parallelized environment is already capturing on this thread")]
    CaptureActive,

    /// A routing key could not be normalized into a stable representation.
    #[error("malformed routing key for {function}: {message}")]
    MalformedKey { function: String, message: String },

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Deserialization error.
    #[error("deserialization error: {0}")]
    Deserialization(String),

    /// No function with this name is registered.
    #[error("unknown parallelized function: {0}")]
    UnknownFunction(String),

    /// No batch strategy with this name is registered.
    #[error("unknown batch strategy: {0}")]
    UnknownStrategy(String),

    /// A call failed while executing inside a unit.
    #[error("execution error: {0}")]
    Execution(String),

    /// A job unit failed on the backend.
    #[error("job unit {key} failed: {message}")]
    Remote { key: String, message: String },

    /// The backend itself failed (submission, spawning, bookkeeping).
    #[error("backend error: {0}")]
    Backend(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Communication error with a worker process or batch queue.
    #[error("IPC error: {0}")]
    Ipc(String),
}

impl Error {
    /// Whether this error was raised by a job unit rather than by the engine.
    pub fn is_remote(&self) -> bool {
        matches!(self, Error::Remote { .. })
    }
}
