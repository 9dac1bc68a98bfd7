//! Worker process spawning.
//!
//! Workers are forked from the pool process so they inherit the action
//! registry and hooks without any serialization. The child closes every
//! pool-side descriptor it inherited, runs the boot sequence and the job
//! loop, then leaves through `_exit` so no parent state is torn down twice.

use super::boot::{Destructor, Initializer, WorkerBoot};
use super::ipc::{FrameReader, FrameWriter, PipeFd, pipe};
use super::proc::{OutboundChannel, WorkerProc};
use super::registry::ActionRegistry;
use super::worker::{WorkerRuntime, run_worker};
use crate::config::PoolConfig;
use crate::error::{PoolError, Result};
use nix::unistd::{ForkResult, fork, getpid};
use std::os::unix::io::{AsRawFd, RawFd};
use std::panic::{self, AssertUnwindSafe};
use tracing::{debug, info};

/// Exit status of a worker whose job loop failed or panicked.
const WORKER_FAILURE_EXIT: i32 = 1;

/// Everything needed to create a worker, shared by every spawn of a pool.
#[derive(Clone)]
pub struct SpawnContext {
    pub config: PoolConfig,
    pub registry: ActionRegistry,
    pub initializer: Option<Initializer>,
    pub destructor: Option<Destructor>,
}

impl std::fmt::Debug for SpawnContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpawnContext")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .field("initializer", &self.initializer.is_some())
            .field("destructor", &self.destructor.is_some())
            .finish()
    }
}

/// A freshly forked worker: its handle and the read side of its results.
#[derive(Debug)]
pub struct Spawned {
    pub proc: WorkerProc,
    pub outbound: OutboundChannel,
}

impl SpawnContext {
    pub fn new(config: PoolConfig, registry: ActionRegistry) -> Self {
        Self {
            config,
            registry,
            initializer: None,
            destructor: None,
        }
    }

    pub fn with_initializer(mut self, hook: Initializer) -> Self {
        self.initializer = Some(hook);
        self
    }

    pub fn with_destructor(mut self, hook: Destructor) -> Self {
        self.destructor = Some(hook);
        self
    }

    /// Fork a worker.
    ///
    /// `inherited` lists pool-side descriptors of other workers; the child
    /// closes them so each pipe has exactly one writer and one reader.
    pub fn spawn(&self, index: usize, inherited: &[RawFd]) -> Result<Spawned> {
        let (in_r, in_w) = pipe()?;
        let (out_r, out_w) = pipe()?;

        // Safety: the child only touches its own copies of the pipes and
        // the registry, and always ends in `_exit`.
        match unsafe { fork() }.map_err(PoolError::from_errno)? {
            ForkResult::Child => {
                drop(in_w);
                drop(out_r);
                close_inherited(inherited, &[in_r.as_raw_fd(), out_w.as_raw_fd()]);
                let code = panic::catch_unwind(AssertUnwindSafe(|| {
                    self.run_child(index, in_r, out_w)
                }))
                .unwrap_or(WORKER_FAILURE_EXIT);
                // Safety: terminates the child without running the parent's
                // destructors or atexit handlers.
                unsafe { nix::libc::_exit(code) }
            }
            ForkResult::Parent { child } => {
                drop(in_r);
                drop(out_w);
                let outbound_fd = out_r.as_raw_fd();
                info!(
                    index,
                    pid = child.as_raw(),
                    inbound_fd = in_w.as_raw_fd(),
                    outbound_fd,
                    "Spawned worker"
                );
                Ok(Spawned {
                    proc: WorkerProc::new(index, child, in_w, outbound_fd),
                    outbound: OutboundChannel::new(child, out_r),
                })
            }
        }
    }

    fn run_child(&self, index: usize, inbound: PipeFd, outbound: PipeFd) -> i32 {
        let boot = WorkerBoot {
            index,
            pid: getpid(),
            hostname: self.config.hostname.clone(),
            config: self.config.boot.clone(),
        };
        debug!(index, pid = boot.pid.as_raw(), "Worker starting");
        run_worker(WorkerRuntime {
            boot,
            initializer: self.initializer.as_ref(),
            registry: &self.registry,
            max_tasks: self.config.max_tasks_per_child,
            reader: FrameReader::new(inbound),
            writer: FrameWriter::new(outbound),
        })
    }
}

/// Close descriptors the child inherited from the pool process.
///
/// Sweeps `/proc/self/fd` where available so pipes opened elsewhere in the
/// parent do not stay open in workers; `inherited` is always closed.
fn close_inherited(inherited: &[RawFd], keep: &[RawFd]) {
    let mut open: Vec<RawFd> = inherited.to_vec();
    if let Ok(entries) = std::fs::read_dir("/proc/self/fd") {
        open.extend(
            entries
                .flatten()
                .filter_map(|entry| entry.file_name().to_str()?.parse::<RawFd>().ok()),
        );
    }
    for fd in open {
        if fd > 2 && !keep.contains(&fd) {
            // Safety: the numbers belong to parent-side handles that are never
            // dropped in the child because it leaves through `_exit`.
            unsafe {
                nix::libc::close(fd);
            }
        }
    }
}
