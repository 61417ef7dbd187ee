//! Error taxonomy for the build worker.
//!
//! Mirrors the propagation table from the design doc: a handful of error
//! kinds are fatal to the whole worker process, everything else is handled
//! locally (counted, logged, or turned into a failed-job report) without
//! tearing the worker down.

use thiserror::Error;

/// Errors that can surface from any layer of the worker.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// The lock file already exists and `--clean` was not requested.
    #[error("lock file '{0}' exists. Use --clean to remove this working context")]
    LockHeld(String),

    /// The coordinator no longer recognizes this worker-id when popping a job.
    #[error(
        "this worker can no longer pop items off the build queue. Did someone remove it manually?"
    )]
    WorkerNotFound,

    /// A coordinator HTTP call failed at the transport level.
    #[error("coordinator request failed: {0}")]
    Transport(#[from] ureq::Error),

    /// A metadata line had the right prefix but did not decode.
    #[error("malformed build-metadata line: {0}")]
    MalformedMetadata(String),

    /// Bad CLI flags or environment configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// The child process was killed by the supervisor after `iotimeout`
    /// seconds with no output.
    #[error("build timed out after {0}s with no output")]
    ChildTimeout(u64),

    /// The child process was killed by the supervisor on request (not a
    /// timeout — e.g. the worker itself is shutting down).
    #[error("build was killed before it finished")]
    ChildKilled,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}

pub type Result<T> = std::result::Result<T, WorkerError>;
