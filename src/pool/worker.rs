//! Worker process main loop.
//!
//! Runs inside each forked worker. It announces itself, then reads jobs
//! from the inbound channel and writes an acknowledgement and a result
//! frame for each of them to the outbound channel.

use super::boot::{Initializer, WorkerBoot, process_initializer};
use super::ipc::{FrameReader, FrameWriter};
use super::protocol::{Inbound, Outbound};
use super::registry::ActionRegistry;
use nix::sys::signal::{self, SigHandler, Signal};
use serde::Deserialize;
use serde_json::Value;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, warn};

/// Set by SIGUSR1 when the running job passed its soft time limit.
static SOFT_LIMIT_EXCEEDED: AtomicBool = AtomicBool::new(false);

/// True once the pool signalled that the current job exceeded its soft
/// time limit. Long-running actions can poll this to wind down early.
pub fn soft_limit_exceeded() -> bool {
    SOFT_LIMIT_EXCEEDED.load(Ordering::Relaxed)
}

extern "C" fn on_soft_limit(_: nix::libc::c_int) {
    SOFT_LIMIT_EXCEEDED.store(true, Ordering::Relaxed);
}

fn install_soft_limit_handler() {
    // Safety: the handler only stores to an atomic, which is async-signal-safe.
    if let Err(e) = unsafe { signal::signal(Signal::SIGUSR1, SigHandler::Handler(on_soft_limit)) }
    {
        warn!(error = %e, "Failed to install soft time limit handler");
    }
}

/// Everything a worker needs after the fork.
pub struct WorkerRuntime<'a> {
    pub boot: WorkerBoot,
    pub initializer: Option<&'a Initializer>,
    pub registry: &'a ActionRegistry,
    pub max_tasks: Option<usize>,
    pub reader: FrameReader,
    pub writer: FrameWriter,
}

/// Read jobs until told to exit, the channel closes or the task cap is hit.
///
/// Returns the number of jobs executed.
pub fn worker_loop(
    pid: i32,
    reader: &mut FrameReader,
    writer: &mut FrameWriter,
    registry: &ActionRegistry,
    max_tasks: Option<usize>,
) -> io::Result<usize> {
    writer.send(&Outbound::WorkerUp { pid })?;

    let mut completed = 0;
    loop {
        if max_tasks.is_some_and(|max| completed >= max) {
            debug!(pid, completed, "Task limit reached, exiting");
            return Ok(completed);
        }

        let job = match reader.recv::<Value>()? {
            None => return Ok(completed),
            Some(Err(e)) => {
                warn!(pid, error = %e, "Undecodable job frame");
                writer.send(&Outbound::Rejected {
                    id: None,
                    pid,
                    reason: e.to_string(),
                })?;
                continue;
            }
            Some(Ok(value)) => match Inbound::deserialize(&value) {
                Ok(Inbound::Exit) => return Ok(completed),
                Ok(Inbound::Job(job)) => job,
                Err(e) => {
                    let id = value.get("id").and_then(Value::as_u64);
                    warn!(pid, ?id, error = %e, "Malformed job frame");
                    writer.send(&Outbound::Rejected {
                        id,
                        pid,
                        reason: e.to_string(),
                    })?;
                    continue;
                }
            },
        };

        SOFT_LIMIT_EXCEEDED.store(false, Ordering::Relaxed);
        writer.send(&Outbound::Ack { id: job.id, pid })?;
        let outcome = registry.run(&job);
        writer.send(&Outbound::Ready {
            id: job.id,
            pid,
            outcome,
        })?;
        completed += 1;
    }
}

/// Worker entry point. Returns the process exit code.
pub fn run_worker(runtime: WorkerRuntime<'_>) -> i32 {
    let WorkerRuntime {
        boot,
        initializer,
        registry,
        max_tasks,
        mut reader,
        mut writer,
    } = runtime;

    process_initializer(&boot, initializer);
    install_soft_limit_handler();

    match worker_loop(
        boot.pid.as_raw(),
        &mut reader,
        &mut writer,
        registry,
        max_tasks,
    ) {
        Ok(_) => 0,
        Err(e) if e.kind() == io::ErrorKind::BrokenPipe => 0,
        Err(e) => {
            eprintln!("Worker error: {}", e);
            1
        }
    }
}
