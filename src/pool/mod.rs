//! Prefork worker pool.
//!
//! The pool forks worker processes and talks to each of them over a pair
//! of pipes. Two backends implement [`PoolBackend`]:
//!
//! - [`AsyncPool`] dispatches without waiting for results. Results are
//!   collected from readiness events, either by its own
//!   [`AsyncPool::poll_once`] step or by an [`EventLoop`] it registered
//!   with.
//! - [`BlockingPool`] writes a job and reads the reply before returning.
//!
//! # Wire format
//!
//! Frames are a 4-byte big-endian length followed by a JSON payload.
//! Inbound frames carry [`Inbound`] messages, outbound frames carry
//! [`Outbound`] messages; a worker writes `WorkerUp` before anything else.

pub mod asynpool;
pub mod blocking;
pub mod boot;
pub mod frame;
pub mod hub;
pub mod ipc;
pub mod mux;
pub mod proc;
pub mod promise;
pub mod protocol;
pub mod registry;
pub mod result;
pub mod signals;
pub mod spawn;
pub mod worker;

pub use asynpool::{AsyncPool, PoolStats};
pub use blocking::BlockingPool;
pub use boot::{BootConfig, Destructor, Initializer, WorkerBoot};
pub use hub::{EventLoop, Hub, Interest};
pub use promise::Promise;
pub use protocol::{Args, Inbound, Job, JobId, JobOutcome, Kwargs, NOOP, Outbound};
pub use registry::ActionRegistry;
pub use worker::soft_limit_exceeded;

use crate::error::Result;
use serde::Serialize;
use std::fmt;
use std::rc::Rc;
use std::time::Duration;

/// Pool lifecycle state.
///
/// Moves forward only: `Run` to `Close` to `Terminate`, or straight from
/// `Run` to `Terminate`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PoolState {
    /// Accepting and dispatching jobs.
    Run,
    /// No new jobs; in-flight jobs finish.
    Close,
    /// Workers are gone or going.
    Terminate,
}

impl fmt::Display for PoolState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Run => write!(f, "RUN"),
            Self::Close => write!(f, "CLOSE"),
            Self::Terminate => write!(f, "TERMINATE"),
        }
    }
}

/// Completion callback for a job.
pub type Callback = Box<dyn FnOnce(JobOutcome)>;

/// Operations shared by every pool backend.
pub trait PoolBackend {
    /// Spawn the workers.
    fn start(&self) -> Result<()>;

    /// Stop accepting jobs; workers exit once their queues are empty.
    fn close(&self) -> Result<()>;

    /// Wait for every worker to exit after `close` or `terminate`.
    fn join(&self) -> Result<()>;

    /// Stop every worker now and fail outstanding jobs. Idempotent.
    fn terminate(&self) -> Result<()>;

    /// Replace every worker with a fresh one.
    fn restart(&self) -> Result<()>;

    /// Queue `action` on a worker. `callback` receives the outcome.
    fn apply_async(
        &self,
        action: &str,
        args: Args,
        kwargs: Kwargs,
        callback: Callback,
    ) -> Result<JobId>;

    /// Best-effort cancellation of a running job.
    fn terminate_job(&self, id: JobId) -> Result<()>;

    fn grow(&self, n: usize) -> Result<()>;

    fn shrink(&self, n: usize) -> Result<()>;

    /// Hook result collection and maintenance into `event_loop`.
    fn register_with_event_loop(&self, event_loop: Rc<dyn EventLoop>);

    /// Collect results without an event loop, waiting up to `timeout`.
    /// Returns the number of channels that had data.
    fn poll_once(&self, _timeout: Option<Duration>) -> Result<usize> {
        Ok(0)
    }

    /// True once the pool is running and no worker died during startup.
    fn did_start_ok(&self) -> bool;

    fn state(&self) -> PoolState;

    /// Workers currently counted towards the pool size.
    fn num_processes(&self) -> usize;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_state_display() {
        assert_eq!(PoolState::Run.to_string(), "RUN");
        assert_eq!(PoolState::Close.to_string(), "CLOSE");
        assert_eq!(PoolState::Terminate.to_string(), "TERMINATE");
        assert_eq!(
            serde_json::to_value(PoolState::Terminate).unwrap(),
            serde_json::json!("TERMINATE")
        );
    }
}
