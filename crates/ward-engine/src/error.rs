//! Error types for the runner layer.
//!
//! These never reach engine callers directly: the supervisor turns them into
//! an `engine_crash` outcome on the affected execution.

use std::path::PathBuf;

use thiserror::Error;

/// Failures while staging, spawning or talking to an interpreter or host.
#[derive(Debug, Error)]
pub enum RunnerError {
    /// The script could not be written to a temporary file.
    #[error("failed to stage script: {0}")]
    Staging(#[source] std::io::Error),

    /// A process could not be started.
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        /// What was being started.
        program: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The `ward-host` binary could not be located.
    #[error("ward-host binary not found: {0}")]
    HostNotFound(String),

    /// The host binary path is not acceptable.
    #[error("refusing to use host binary {path}: {reason}")]
    InsecureBinary {
        /// Offending path.
        path: PathBuf,
        /// Why it was rejected.
        reason: String,
    },

    /// Reading or writing an IPC frame failed.
    #[error("host IPC failed: {0}")]
    Ipc(#[from] std::io::Error),

    /// A host did not answer a health check in time, or answered wrongly.
    #[error("host health check failed: {0}")]
    HealthCheck(String),

    /// Every host slot is in use.
    #[error("host pool at capacity ({max} hosts)")]
    PoolExhausted {
        /// Configured maximum.
        max: usize,
    },

    /// The pool no longer hands out hosts.
    #[error("host pool is shutting down")]
    PoolShuttingDown,
}
