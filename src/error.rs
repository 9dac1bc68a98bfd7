//! Error types for prefork.

use nix::errno::Errno;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::pool::frame::FrameError;

/// Main error type for pool operations.
#[derive(Error, Debug)]
pub enum PoolError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// An OS error the pool does not know how to recover from.
    #[error("OS error: {0}")]
    Os(Errno),

    /// Out-of-memory class failure. Never downgraded to a retry.
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(Errno),

    #[error("Worker error: {0}")]
    Worker(String),

    #[error("Cannot {op} while pool is in state {state}")]
    InvalidState {
        op: &'static str,
        state: crate::pool::PoolState,
    },

    #[error("No live workers available")]
    NoWorkers,

    #[error("Cannot shrink a pool of {size} workers by {by}")]
    CannotShrink { size: usize, by: usize },

    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("Pool has not been started")]
    NotStarted,
}

impl PoolError {
    /// Classify an errno coming out of a syscall the pool cannot retry.
    pub fn from_errno(errno: Errno) -> Self {
        if is_exhaustion(errno) {
            Self::ResourceExhausted(errno)
        } else {
            Self::Os(errno)
        }
    }

    /// True for errors that must always reach the pool owner.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::ResourceExhausted(_) | Self::Os(_))
    }
}

/// Errno values treated as resource exhaustion.
pub fn is_exhaustion(errno: Errno) -> bool {
    matches!(errno, Errno::ENOMEM | Errno::ENOBUFS)
}

/// Result type alias for pool operations.
pub type Result<T> = std::result::Result<T, PoolError>;

/// Why a single job did not produce a value.
///
/// Travels over the wire inside result frames, so it is serializable.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobFailure {
    /// The action ran and returned an error.
    #[error("job raised: {message}")]
    Raised { message: String },

    /// The worker has no action registered under this name.
    #[error("unknown action '{action}'")]
    UnknownAction { action: String },

    /// The worker exited or was killed while the job was outstanding.
    #[error("worker lost (exit code {exit_code})")]
    WorkerLost { exit_code: i32 },

    /// The hard time limit expired.
    #[error("hard time limit ({millis}ms) exceeded")]
    TimeLimit { millis: u64 },

    /// The pool was terminated before the job finished.
    #[error("pool terminated")]
    Terminated,

    /// The result frame could not be decoded.
    #[error("corrupt result frame: {reason}")]
    Corrupt { reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_exhaustion_classification() {
        assert!(matches!(
            PoolError::from_errno(Errno::ENOMEM),
            PoolError::ResourceExhausted(Errno::ENOMEM)
        ));
        assert!(matches!(
            PoolError::from_errno(Errno::ENOBUFS),
            PoolError::ResourceExhausted(Errno::ENOBUFS)
        ));
        assert!(matches!(
            PoolError::from_errno(Errno::EPERM),
            PoolError::Os(Errno::EPERM)
        ));
    }

    #[test]
    fn test_fatal_errors() {
        assert!(PoolError::Os(Errno::EIO).is_fatal());
        assert!(PoolError::ResourceExhausted(Errno::ENOMEM).is_fatal());
        assert!(!PoolError::NoWorkers.is_fatal());
    }

    #[test]
    fn test_invalid_state_message() {
        let err = PoolError::InvalidState {
            op: "apply_async",
            state: crate::pool::PoolState::Close,
        };
        let msg = err.to_string();
        assert!(msg.contains("apply_async"));
        assert!(msg.contains("CLOSE"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::BrokenPipe, "pipe closed");
        let err: PoolError = io_err.into();
        assert!(err.to_string().contains("pipe closed"));
    }

    #[test]
    fn test_job_failure_wire_format() {
        let failure = JobFailure::WorkerLost { exit_code: -9 };
        let json = serde_json::to_string(&failure).unwrap();
        assert!(json.contains("worker_lost"));
        let parsed: JobFailure = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, failure);
    }

    #[test]
    fn test_job_failure_display() {
        let failure = JobFailure::UnknownAction {
            action: "frobnicate".into(),
        };
        assert_eq!(failure.to_string(), "unknown action 'frobnicate'");
    }
}
