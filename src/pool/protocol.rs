//! IPC protocol between the pool and its worker processes.
//!
//! Frames are length-prefixed JSON, see [`super::frame`].

use crate::error::JobFailure;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Identifier correlating a dispatched job with its result frame.
pub type JobId = u64;

/// Positional job arguments.
pub type Args = Vec<Value>;

/// Keyword job arguments.
pub type Kwargs = Map<String, Value>;

/// Result of running one job.
pub type JobOutcome = Result<Value, JobFailure>;

/// Name of the built-in action that does nothing.
pub const NOOP: &str = "noop";

/// Job dispatch frame written to a worker's inbound channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    /// Registered action name.
    pub action: String,
    #[serde(default)]
    pub args: Args,
    #[serde(default)]
    pub kwargs: Kwargs,
}

impl Job {
    pub fn new(id: JobId, action: impl Into<String>, args: Args, kwargs: Kwargs) -> Self {
        Self {
            id,
            action: action.into(),
            args,
            kwargs,
        }
    }
}

/// Message from pool to worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Inbound {
    /// Run a job.
    Job(Job),
    /// Finish and exit.
    Exit,
}

/// Message from worker to pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Outbound {
    /// Liveness frame, written once before any other frame.
    WorkerUp { pid: i32 },
    /// The worker picked up a job.
    Ack { id: JobId, pid: i32 },
    /// The job finished.
    Ready { id: JobId, pid: i32, outcome: JobOutcome },
    /// A job frame the worker could not decode. `id` is set when the
    /// payload still carried one.
    Rejected {
        id: Option<JobId>,
        pid: i32,
        reason: String,
    },
}
