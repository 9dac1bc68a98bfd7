//! Synchronous pool backend.
//!
//! Each `apply_async` writes the job to the next worker and reads frames
//! until its result arrives, then runs the callback before returning.
//! Nothing is left in flight between calls, so there is nothing for an
//! event loop to drive.

use super::boot::process_destructor;
use super::hub::EventLoop;
use super::ipc::FrameReader;
use super::proc::WorkerProc;
use super::protocol::{Args, Job, JobId, JobOutcome, Kwargs, Outbound};
use super::signals::TerminationReason;
use super::spawn::{SpawnContext, Spawned};
use super::{Callback, PoolBackend, PoolState};
use crate::error::{JobFailure, PoolError, Result};
use std::cell::RefCell;
use std::os::unix::io::{AsRawFd, RawFd};
use std::rc::Rc;
use std::time::Instant;
use tracing::{debug, instrument, trace, warn};

/// A worker and the reader for its outbound channel.
#[derive(Debug)]
struct Slot {
    proc: WorkerProc,
    reader: FrameReader,
}

#[derive(Debug)]
struct Inner {
    state: PoolState,
    slots: Vec<Slot>,
    next: usize,
    target: usize,
    next_job_id: JobId,
    startup_failures: usize,
}

/// How a single request ended.
enum Reply {
    Done(JobOutcome),
    /// The channel closed before the result arrived.
    Lost,
}

/// Pool backend that waits for every job.
#[derive(Debug)]
pub struct BlockingPool {
    ctx: SpawnContext,
    inner: RefCell<Inner>,
}

impl BlockingPool {
    pub fn new(ctx: SpawnContext) -> Self {
        let target = ctx.config.concurrency;
        Self {
            ctx,
            inner: RefCell::new(Inner {
                state: PoolState::Run,
                slots: Vec::new(),
                next: 0,
                target,
                next_job_id: 0,
                startup_failures: 0,
            }),
        }
    }

    /// Fork a worker and wait for its liveness frame.
    fn spawn_slot(&self, index: usize, inherited: &[RawFd]) -> Result<Slot> {
        let Spawned { mut proc, outbound } = self.ctx.spawn(index, inherited)?;
        let mut reader = FrameReader::new(outbound.into_reader());
        match reader.recv::<Outbound>()? {
            Some(Ok(Outbound::WorkerUp { .. })) => {
                proc.mark_alive();
                Ok(Slot { proc, reader })
            }
            Some(Ok(other)) => Err(PoolError::Worker(format!(
                "Worker {} sent {:?} instead of announcing itself",
                proc.pid(),
                other
            ))),
            Some(Err(e)) => Err(e.into()),
            None => Err(PoolError::Worker(format!(
                "Worker {} closed its channel before announcing itself",
                proc.pid()
            ))),
        }
    }

    fn inherited(inner: &Inner, skip: Option<usize>) -> Vec<RawFd> {
        inner
            .slots
            .iter()
            .enumerate()
            .filter(|(i, _)| Some(*i) != skip)
            .flat_map(|(_, s)| [s.proc.inbound_fd(), s.reader.as_raw_fd()])
            .collect()
    }

    /// Stop a slot's worker and report it to the shutdown hook.
    fn retire(&self, slot: &mut Slot, exit: bool) -> TerminationReason {
        if exit {
            slot.proc.send_exit();
        } else {
            let _ = slot.proc.terminate();
        }
        let reason = slot
            .proc
            .stop(self.ctx.config.shutdown_grace)
            .unwrap_or_else(|e| {
                warn!(pid = slot.proc.pid().as_raw(), error = %e, "Failed to stop worker");
                TerminationReason::Unknown
            });
        process_destructor(
            slot.proc.pid(),
            reason.exit_code(),
            self.ctx.destructor.as_ref(),
        );
        reason
    }

    /// Put a fresh worker into slot `i`. The old one must be gone.
    fn replace(&self, inner: &mut Inner, i: usize) -> Result<()> {
        let inherited = Self::inherited(inner, Some(i));
        let index = inner.slots[i].proc.index();
        inner.slots[i] = self.spawn_slot(index, &inherited)?;
        Ok(())
    }

    /// Stop the worker in slot `i` and replace it.
    fn respawn(&self, inner: &mut Inner, i: usize, exit: bool) -> Result<TerminationReason> {
        let reason = self.retire(&mut inner.slots[i], exit);
        self.replace(inner, i)?;
        debug!(index = inner.slots[i].proc.index(), %reason, "Worker replaced");
        Ok(reason)
    }

    /// Make sure slot `i` holds a worker that can take a job.
    fn ensure_ready(&self, inner: &mut Inner, i: usize) -> Result<()> {
        let slot = &mut inner.slots[i];
        let capped = self
            .ctx
            .config
            .max_tasks_per_child
            .is_some_and(|max| slot.proc.tasks_done() >= max);
        if capped {
            debug!(pid = slot.proc.pid().as_raw(), "Worker reached its task limit");
            self.respawn(inner, i, true)?;
        } else if let Some(reason) = slot.proc.try_wait()? {
            warn!(pid = slot.proc.pid().as_raw(), %reason, "Worker exited unexpectedly");
            process_destructor(
                slot.proc.pid(),
                reason.exit_code(),
                self.ctx.destructor.as_ref(),
            );
            self.replace(inner, i)?;
        }
        Ok(())
    }

    fn request(slot: &mut Slot, job: &Job) -> Reply {
        if let Err(e) = slot.proc.send_job(job) {
            warn!(error = %e, "Failed to send job");
            return Reply::Lost;
        }
        loop {
            match slot.reader.recv::<Outbound>() {
                Ok(Some(Ok(Outbound::Ready { id, outcome, .. }))) if id == job.id => {
                    slot.proc.finish_job(id);
                    return Reply::Done(outcome);
                }
                Ok(Some(Ok(Outbound::Rejected { id, reason, .. })))
                    if id.is_none_or(|id| id == job.id) =>
                {
                    slot.proc.finish_job(job.id);
                    return Reply::Done(Err(JobFailure::Corrupt { reason }));
                }
                Ok(Some(Ok(frame))) => trace!(?frame, "Skipping frame"),
                Ok(Some(Err(e))) => {
                    slot.proc.finish_job(job.id);
                    return Reply::Done(Err(JobFailure::Corrupt {
                        reason: e.to_string(),
                    }));
                }
                Ok(None) => return Reply::Lost,
                Err(e) => {
                    warn!(error = %e, "Failed to read result");
                    return Reply::Lost;
                }
            }
        }
    }

    fn run_job(&self, inner: &mut Inner, job: Job) -> Result<JobOutcome> {
        let len = inner.slots.len();
        let i = inner.next % len;
        inner.next = (i + 1) % len;
        self.ensure_ready(inner, i)?;

        let start = Instant::now();
        let reply = Self::request(&mut inner.slots[i], &job);
        trace!(
            id = job.id,
            pid = inner.slots[i].proc.pid().as_raw(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Job finished"
        );
        match reply {
            Reply::Done(outcome) => Ok(outcome),
            Reply::Lost => {
                let reason = inner.slots[i].proc.kill()?;
                warn!(id = job.id, %reason, "Worker lost while running job");
                process_destructor(
                    inner.slots[i].proc.pid(),
                    reason.exit_code(),
                    self.ctx.destructor.as_ref(),
                );
                self.replace(inner, i)?;
                Ok(Err(JobFailure::WorkerLost {
                    exit_code: reason.exit_code(),
                }))
            }
        }
    }

    fn require_run(inner: &Inner, op: &'static str) -> Result<()> {
        if inner.state != PoolState::Run {
            return Err(PoolError::InvalidState {
                op,
                state: inner.state,
            });
        }
        Ok(())
    }
}

impl PoolBackend for BlockingPool {
    #[instrument(skip(self))]
    fn start(&self) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        Self::require_run(&inner, "start")?;
        while inner.slots.len() < inner.target {
            let index = inner.slots.len();
            let inherited = Self::inherited(&inner, None);
            match self.spawn_slot(index, &inherited) {
                Ok(slot) => inner.slots.push(slot),
                Err(e) => {
                    inner.startup_failures += 1;
                    return Err(e);
                }
            }
        }
        debug!(workers = inner.slots.len(), "Blocking pool started");
        Ok(())
    }

    fn close(&self) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        if inner.state == PoolState::Run {
            inner.state = PoolState::Close;
        }
        Ok(())
    }

    fn join(&self) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        if inner.state == PoolState::Run {
            return Err(PoolError::InvalidState {
                op: "join",
                state: inner.state,
            });
        }
        let mut slots = std::mem::take(&mut inner.slots);
        for slot in &mut slots {
            self.retire(slot, true);
        }
        inner.state = PoolState::Terminate;
        Ok(())
    }

    fn terminate(&self) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        if inner.state == PoolState::Terminate && inner.slots.is_empty() {
            return Ok(());
        }
        inner.state = PoolState::Terminate;
        let mut slots = std::mem::take(&mut inner.slots);
        for slot in &mut slots {
            self.retire(slot, false);
        }
        Ok(())
    }

    fn restart(&self) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        Self::require_run(&inner, "restart")?;
        for i in 0..inner.slots.len() {
            self.respawn(&mut inner, i, true)?;
        }
        Ok(())
    }

    fn apply_async(
        &self,
        action: &str,
        args: Args,
        kwargs: Kwargs,
        callback: Callback,
    ) -> Result<JobId> {
        let (id, outcome) = {
            let mut inner = self.inner.borrow_mut();
            Self::require_run(&inner, "apply_async")?;
            if inner.slots.is_empty() {
                return Err(if inner.target == 0 {
                    PoolError::NoWorkers
                } else {
                    PoolError::NotStarted
                });
            }
            inner.next_job_id += 1;
            let id = inner.next_job_id;
            let outcome = self.run_job(&mut inner, Job::new(id, action, args, kwargs))?;
            (id, outcome)
        };
        callback(outcome);
        Ok(id)
    }

    fn terminate_job(&self, id: JobId) -> Result<()> {
        debug!(id, "Jobs finish before apply_async returns, nothing to terminate");
        Ok(())
    }

    fn grow(&self, n: usize) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        Self::require_run(&inner, "grow")?;
        inner.target += n;
        for _ in 0..n {
            let index = inner.slots.len();
            let inherited = Self::inherited(&inner, None);
            let slot = self.spawn_slot(index, &inherited)?;
            inner.slots.push(slot);
        }
        Ok(())
    }

    fn shrink(&self, n: usize) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        Self::require_run(&inner, "shrink")?;
        let size = inner.slots.len();
        if n == 0 {
            return Ok(());
        }
        if n >= size {
            return Err(PoolError::CannotShrink { size, by: n });
        }
        for mut slot in inner.slots.split_off(size - n) {
            self.retire(&mut slot, true);
        }
        inner.target = inner.target.saturating_sub(n);
        inner.next %= inner.slots.len();
        Ok(())
    }

    fn register_with_event_loop(&self, _event_loop: Rc<dyn EventLoop>) {
        debug!("Blocking pool has nothing to register");
    }

    fn did_start_ok(&self) -> bool {
        let inner = self.inner.borrow();
        inner.state == PoolState::Run && inner.startup_failures == 0 && !inner.slots.is_empty()
    }

    fn state(&self) -> PoolState {
        self.inner.borrow().state
    }

    fn num_processes(&self) -> usize {
        self.inner.borrow().slots.len()
    }
}
