//! Asynchronous pool engine.
//!
//! [`AsyncPool`] writes jobs to workers without waiting for them. Results
//! come back through the [`ResultHandler`], driven either by
//! [`AsyncPool::poll_once`] or by an [`EventLoop`] the pool registered
//! with. A periodic maintenance pass reaps exited workers, enforces time
//! limits and spawns replacements.
//!
//! Engine state lives in one `Rc` shared with the callbacks handed to the
//! result handler and the event loop. Those hold weak references only, and
//! no `RefCell` borrow is held while a job callback runs, so callbacks may
//! call back into the pool.

use super::boot::process_destructor;
use super::hub::{EventLoop, Interest, TimerId};
use super::mux::{FdSet, Multiplexer, Poller, SysPoller};
use super::proc::WorkerProc;
use super::promise::Promise;
use super::protocol::{Args, Job, JobId, JobOutcome, Kwargs};
use super::result::{Callbacks, FilenoMap, JobReady, ResultHandler};
use super::signals::TerminationReason;
use super::spawn::{SpawnContext, Spawned};
use super::{Callback, PoolBackend, PoolState};
use crate::error::{JobFailure, PoolError, Result};
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use serde::Serialize;
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::os::unix::io::RawFd;
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, instrument, trace, warn};

/// Longest single wait inside blocking engine operations.
const POLL_SLICE: Duration = Duration::from_millis(50);

/// Jobs written to one worker ahead of its results. Writes to the inbound
/// pipe block, so a worker is only written to while it is not producing
/// results the pool has yet to read.
const MAX_IN_FLIGHT: usize = 1;

/// Counters kept by the engine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub jobs_dispatched: u64,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    pub workers_spawned: u64,
    pub workers_lost: u64,
    pub restarts: u64,
}

/// Bookkeeping for a job that has not produced an outcome yet.
struct Pending {
    promise: Promise<JobOutcome>,
    /// Worker that acknowledged the job.
    pid: Option<Pid>,
    accepted_at: Option<Instant>,
    soft_warned: bool,
    /// Outcome forced by the pool (hard time limit), reported instead of
    /// whatever the worker says.
    failure: Option<JobFailure>,
}

impl Pending {
    fn new(promise: Promise<JobOutcome>) -> Self {
        Self {
            promise,
            pid: None,
            accepted_at: None,
            soft_warned: false,
            failure: None,
        }
    }
}

struct Core {
    state: PoolState,
    /// Fixed spawn order; the round-robin list is derived from it.
    workers: Vec<WorkerProc>,
    /// Index into the current list of dispatchable workers.
    cursor: usize,
    /// Worker count maintenance spawns towards.
    target: usize,
    max_tasks: Option<usize>,
    cache: HashMap<JobId, Pending>,
    /// Jobs accepted while every worker was busy or gone.
    buffer: VecDeque<Job>,
    next_job_id: JobId,
    stats: PoolStats,
    /// Workers that exited before announcing themselves.
    early_deaths: usize,
}

impl Core {
    fn new(target: usize, max_tasks: Option<usize>) -> Self {
        Self {
            state: PoolState::Run,
            workers: Vec::new(),
            cursor: 0,
            target,
            max_tasks,
            cache: HashMap::new(),
            buffer: VecDeque::new(),
            next_job_id: 0,
            stats: PoolStats::default(),
            early_deaths: 0,
        }
    }

    fn can_take(&self, worker: &WorkerProc) -> bool {
        worker.is_dispatchable()
            && self
                .max_tasks
                .is_none_or(|max| worker.tasks_done() + worker.jobs().len() < max)
    }

    fn live_pids(&self) -> Vec<Pid> {
        self.workers
            .iter()
            .filter(|w| self.can_take(w))
            .map(WorkerProc::pid)
            .collect()
    }

    /// Workers counted towards the pool size.
    fn active_count(&self) -> usize {
        self.workers
            .iter()
            .filter(|w| !w.is_retiring() && !w.is_reaped())
            .count()
    }

    fn retiring_count(&self) -> usize {
        self.workers.iter().filter(|w| w.is_retiring()).count()
    }

    fn worker_mut(&mut self, pid: Pid) -> Option<&mut WorkerProc> {
        self.workers.iter_mut().find(|w| w.pid() == pid)
    }

    /// Smallest index not used by an active worker.
    fn free_index(&self) -> usize {
        (0..)
            .find(|i| {
                !self
                    .workers
                    .iter()
                    .any(|w| !w.is_retiring() && w.index() == *i)
            })
            .unwrap_or(0)
    }

    /// Point the cursor back at the worker it pointed at before the live
    /// list changed, or at the next survivor if that worker is gone.
    fn rederive_cursor(&mut self, before: &[Pid]) {
        let live = self.live_pids();
        if live.is_empty() || before.is_empty() {
            self.cursor = 0;
            return;
        }
        let start = self.cursor % before.len();
        self.cursor = (0..before.len())
            .map(|k| before[(start + k) % before.len()])
            .find_map(|pid| live.iter().position(|p| *p == pid))
            .unwrap_or(0);
    }

    /// First worker with room at or after the cursor. Busy workers keep
    /// their place in the rotation.
    fn next_worker(&mut self) -> Option<usize> {
        let live: Vec<usize> = (0..self.workers.len())
            .filter(|&i| self.can_take(&self.workers[i]))
            .collect();
        if live.is_empty() {
            return None;
        }
        let start = self.cursor % live.len();
        let i = (0..live.len())
            .map(|k| (start + k) % live.len())
            .find(|&i| self.workers[live[i]].jobs().len() < MAX_IN_FLIGHT)?;
        self.cursor = (i + 1) % live.len();
        Some(live[i])
    }

    /// Write `job` to the next live worker with room. Hands the job back
    /// when every worker is busy or gone.
    fn dispatch(&mut self, job: Job) -> Option<Job> {
        loop {
            let before = self.live_pids();
            let i = self.next_worker()?;
            let worker = &mut self.workers[i];
            match worker.send_job(&job) {
                Ok(()) => {
                    trace!(id = job.id, pid = worker.pid().as_raw(), "Dispatched job");
                    self.stats.jobs_dispatched += 1;
                    self.rederive_cursor(&before);
                    return None;
                }
                Err(e) => {
                    warn!(pid = worker.pid().as_raw(), error = %e, "Worker unreachable");
                    worker.mark_unreachable();
                    self.rederive_cursor(&before);
                }
            }
        }
    }

    /// Dispatch buffered jobs in order while workers can take them.
    fn flush(&mut self) {
        while let Some(job) = self.buffer.pop_front() {
            if let Some(job) = self.dispatch(job) {
                self.buffer.push_front(job);
                break;
            }
        }
        if self.state == PoolState::Close && self.buffer.is_empty() {
            for worker in &mut self.workers {
                worker.send_exit();
            }
        }
    }

    /// Queue behind anything already buffered, then flush.
    fn queue(&mut self, job: Job) {
        self.buffer.push_back(job);
        self.flush();
        if !self.buffer.is_empty() {
            trace!(buffered = self.buffer.len(), "No free worker, jobs buffered");
        }
    }

    /// Remove every outstanding job, oldest first.
    fn drain_pending(&mut self) -> Vec<Pending> {
        self.buffer.clear();
        let mut pending: Vec<(JobId, Pending)> = self.cache.drain().collect();
        pending.sort_unstable_by_key(|(id, _)| *id);
        pending.into_iter().map(|(_, p)| p).collect()
    }
}

struct Attached {
    event_loop: Rc<dyn EventLoop>,
    timer: TimerId,
}

struct Shared {
    core: RefCell<Core>,
    results: Rc<RefCell<ResultHandler>>,
    fileno_to_outq: FilenoMap,
    attached: RefCell<Option<Attached>>,
    mux: RefCell<Multiplexer<Box<dyn Poller>>>,
    ctx: SpawnContext,
}

fn forward<A: 'static>(weak: &Weak<Shared>, f: fn(&Shared, A)) -> Box<dyn FnMut(A)> {
    let weak = weak.clone();
    Box::new(move |arg| {
        if let Some(shared) = weak.upgrade() {
            f(&shared, arg)
        }
    })
}

impl Shared {
    fn on_process_alive(&self, pid: Pid) {
        let mut core = self.core.borrow_mut();
        let before = core.live_pids();
        let Some(worker) = core.worker_mut(pid) else {
            debug!(pid = pid.as_raw(), "Liveness frame from unknown worker");
            return;
        };
        worker.mark_alive();
        debug!(pid = pid.as_raw(), index = worker.index(), "Worker up");
        core.rederive_cursor(&before);
        core.flush();
    }

    fn on_job_accepted(&self, id: JobId, pid: Pid) {
        let mut core = self.core.borrow_mut();
        if let Some(pending) = core.cache.get_mut(&id) {
            pending.pid = Some(pid);
            pending.accepted_at = Some(Instant::now());
        }
    }

    fn on_job_ready(&self, ready: JobReady) {
        let resolved = {
            let mut core = self.core.borrow_mut();
            let id = match ready.id {
                Some(id) => id,
                None => match core.worker_mut(ready.pid).and_then(|w| w.current_job()) {
                    Some(id) => id,
                    None => {
                        warn!(pid = ready.pid.as_raw(), "Corrupt frame with no job in flight");
                        return;
                    }
                },
            };
            if let Some(worker) = core.worker_mut(ready.pid) {
                worker.finish_job(id);
            }
            let Some(pending) = core.cache.remove(&id) else {
                debug!(id, "Result for unknown job");
                return;
            };
            let outcome = match pending.failure {
                Some(failure) => Err(failure),
                None => ready.outcome,
            };
            if outcome.is_ok() {
                core.stats.jobs_completed += 1;
            } else {
                core.stats.jobs_failed += 1;
            }
            core.flush();
            (pending.promise, outcome)
        };

        let (mut promise, outcome) = resolved;
        promise.call(outcome);
    }

    fn on_channel_closed(&self, pid: Pid) {
        let mut core = self.core.borrow_mut();
        let before = core.live_pids();
        if let Some(worker) = core.worker_mut(pid) {
            debug!(pid = pid.as_raw(), "Worker channel closed");
            worker.mark_unreachable();
        }
        core.rederive_cursor(&before);
    }

    fn spawn_worker(&self, core: &mut Core) -> Result<()> {
        let inherited: Vec<RawFd> = core
            .workers
            .iter()
            .flat_map(|w| [w.inbound_fd(), w.outbound_fd()])
            .collect();
        let index = core.free_index();
        let Spawned { proc, outbound } = self.ctx.spawn(index, &inherited)?;
        let fd = outbound.fd();
        self.fileno_to_outq.borrow_mut().insert(fd, outbound);
        core.workers.push(proc);
        core.stats.workers_spawned += 1;
        if let Some(attached) = self.attached.borrow().as_ref() {
            attached
                .event_loop
                .add_reader(fd, ResultHandler::reader(&self.results));
        }
        Ok(())
    }

    /// Read whatever an exited worker left in its channel.
    fn drain_channel(&self, fd: RawFd) {
        let Ok(mut results) = self.results.try_borrow_mut() else {
            return;
        };
        while self.fileno_to_outq.borrow().contains_key(&fd) {
            let mut readers: FdSet = [fd].into();
            let ready = self
                .mux
                .borrow_mut()
                .select(
                    &mut readers,
                    &mut FdSet::new(),
                    &mut FdSet::new(),
                    Some(Duration::ZERO),
                )
                .is_ok_and(|s| s.readable.contains(&fd));
            if !ready || results.handle_event(fd) == Interest::Remove {
                break;
            }
        }
    }

    /// Unregister and close an outbound channel.
    fn forget_channel(&self, fd: RawFd) {
        if let Some(attached) = self.attached.borrow().as_ref() {
            attached.event_loop.remove_reader(fd);
        }
        self.fileno_to_outq.borrow_mut().remove(&fd);
    }

    /// Drop channels whose descriptors the multiplexer found invalid.
    fn drop_stale(&self, valid: &FdSet) {
        let stale: Vec<RawFd> = self
            .fileno_to_outq
            .borrow()
            .keys()
            .filter(|fd| !valid.contains(fd))
            .copied()
            .collect();
        for fd in stale {
            warn!(fd, "Dropping stale outbound channel");
            if let Some(attached) = self.attached.borrow().as_ref() {
                attached.event_loop.remove_reader(fd);
            }
            if let Some(channel) = self.fileno_to_outq.borrow_mut().remove(&fd) {
                channel.abandon();
            }
        }
    }

    fn detach(&self) {
        let Some(attached) = self.attached.borrow_mut().take() else {
            return;
        };
        attached.event_loop.cancel_timer(attached.timer);
        for fd in self.fileno_to_outq.borrow().keys() {
            attached.event_loop.remove_reader(*fd);
        }
    }

    fn maintain(&self) -> Result<()> {
        self.reap()?;
        self.enforce_time_limits();
        self.respawn()?;
        self.core.borrow_mut().flush();
        Ok(())
    }

    fn reap(&self) -> Result<()> {
        let exited: Vec<(Pid, RawFd, TerminationReason)> = {
            let mut core = self.core.borrow_mut();
            let mut exited = Vec::new();
            for worker in core.workers.iter_mut() {
                if let Some(reason) = worker.try_wait()? {
                    exited.push((worker.pid(), worker.outbound_fd(), reason));
                }
            }
            exited
        };
        for (pid, fd, reason) in exited {
            self.on_worker_exit(pid, fd, reason);
        }
        Ok(())
    }

    fn on_worker_exit(&self, pid: Pid, fd: RawFd, reason: TerminationReason) {
        self.drain_channel(fd);
        self.forget_channel(fd);

        let exit_code = reason.exit_code();
        let failed: Vec<(Promise<JobOutcome>, JobFailure)> = {
            let mut core = self.core.borrow_mut();
            let before = core.live_pids();
            let Some(pos) = core.workers.iter().position(|w| w.pid() == pid) else {
                return;
            };
            let mut worker = core.workers.remove(pos);
            core.rederive_cursor(&before);

            if !worker.is_alive() && !worker.is_retiring() && core.state == PoolState::Run {
                core.early_deaths += 1;
            }
            let jobs = worker.take_jobs();
            if reason.is_success() && jobs.is_empty() {
                debug!(pid = pid.as_raw(), tasks = worker.tasks_done(), "Worker exited");
            } else {
                core.stats.workers_lost += 1;
                warn!(
                    pid = pid.as_raw(),
                    %reason,
                    lost_jobs = jobs.len(),
                    uptime_ms = worker.uptime().as_millis() as u64,
                    "Worker died"
                );
            }

            let mut failed = Vec::new();
            for id in jobs {
                if let Some(pending) = core.cache.remove(&id) {
                    core.stats.jobs_failed += 1;
                    let failure = pending
                        .failure
                        .unwrap_or(JobFailure::WorkerLost { exit_code });
                    failed.push((pending.promise, failure));
                }
            }
            failed
        };

        process_destructor(pid, exit_code, self.ctx.destructor.as_ref());
        for (mut promise, failure) in failed {
            promise.call(Err(failure));
        }
    }

    fn enforce_time_limits(&self) {
        let soft = self.ctx.config.soft_timeout;
        let hard = self.ctx.config.hard_timeout;
        if soft.is_none() && hard.is_none() {
            return;
        }

        let mut core = self.core.borrow_mut();
        let now = Instant::now();
        let mut warned = Vec::new();
        let mut killed = Vec::new();
        for (id, pending) in core.cache.iter_mut() {
            let (Some(pid), Some(started)) = (pending.pid, pending.accepted_at) else {
                continue;
            };
            let elapsed = now.duration_since(started);
            if let Some(hard) = hard
                && elapsed >= hard
                && pending.failure.is_none()
            {
                pending.failure = Some(JobFailure::TimeLimit {
                    millis: hard.as_millis() as u64,
                });
                killed.push((*id, pid));
            } else if let Some(soft) = soft
                && elapsed >= soft
                && !pending.soft_warned
            {
                pending.soft_warned = true;
                warned.push((*id, pid));
            }
        }

        for (id, pid) in warned {
            if let Some(worker) = core.worker_mut(pid)
                && worker.current_job() == Some(id)
            {
                warn!(id, pid = pid.as_raw(), "Soft time limit exceeded");
                if let Err(e) = worker.signal(Signal::SIGUSR1) {
                    debug!(pid = pid.as_raw(), error = %e, "Failed to signal worker");
                }
            }
        }
        for (id, pid) in killed {
            if let Some(worker) = core.worker_mut(pid)
                && worker.current_job() == Some(id)
            {
                error!(id, pid = pid.as_raw(), "Hard time limit exceeded, killing worker");
                if let Err(e) = worker.signal(Signal::SIGKILL) {
                    debug!(pid = pid.as_raw(), error = %e, "Failed to signal worker");
                }
            }
        }
    }

    fn respawn(&self) -> Result<()> {
        let mut core = self.core.borrow_mut();
        if core.state != PoolState::Run {
            return Ok(());
        }
        while core.active_count() < core.target {
            self.spawn_worker(&mut core)?;
        }
        Ok(())
    }
}

/// The event-driven pool engine.
///
/// Cloning yields another handle to the same pool.
#[derive(Clone)]
pub struct AsyncPool {
    shared: Rc<Shared>,
}

impl std::fmt::Debug for AsyncPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let core = self.shared.core.borrow();
        f.debug_struct("AsyncPool")
            .field("state", &core.state)
            .field("workers", &core.workers.len())
            .field("pending", &core.cache.len())
            .finish()
    }
}

impl AsyncPool {
    pub fn new(ctx: SpawnContext) -> Self {
        Self::with_poller(ctx, SysPoller)
    }

    /// Engine polling through `poller` instead of `poll(2)`.
    pub fn with_poller(ctx: SpawnContext, poller: impl Poller + 'static) -> Self {
        let poller: Box<dyn Poller> = Box::new(poller);
        let fileno_to_outq: FilenoMap = Rc::default();
        let shared = Rc::new_cyclic(|weak: &Weak<Shared>| {
            let accepted = weak.clone();
            let callbacks = Callbacks {
                on_process_alive: forward(weak, Shared::on_process_alive),
                on_job_accepted: Box::new(move |id, pid| {
                    if let Some(shared) = accepted.upgrade() {
                        shared.on_job_accepted(id, pid)
                    }
                }),
                on_job_ready: forward(weak, Shared::on_job_ready),
                on_channel_closed: forward(weak, Shared::on_channel_closed),
            };
            Shared {
                core: RefCell::new(Core::new(
                    ctx.config.concurrency,
                    ctx.config.max_tasks_per_child,
                )),
                results: Rc::new(RefCell::new(ResultHandler::new(
                    fileno_to_outq.clone(),
                    callbacks,
                ))),
                fileno_to_outq,
                attached: RefCell::new(None),
                mux: RefCell::new(Multiplexer::with_poller(poller)),
                ctx,
            }
        });
        Self { shared }
    }

    /// Spawn the configured number of workers and wait for them to
    /// announce themselves.
    #[instrument(skip(self))]
    pub fn start(&self) -> Result<()> {
        {
            let mut core = self.shared.core.borrow_mut();
            if core.state != PoolState::Run {
                return Err(PoolError::InvalidState {
                    op: "start",
                    state: core.state,
                });
            }
            if !core.workers.is_empty() {
                return Ok(());
            }
            for _ in 0..core.target {
                self.shared.spawn_worker(&mut core)?;
            }
        }

        let deadline = Instant::now() + self.shared.ctx.config.startup_timeout;
        loop {
            {
                let core = self.shared.core.borrow();
                if core.early_deaths > 0 {
                    warn!(early_deaths = core.early_deaths, "Workers died during startup");
                    break;
                }
                if core.workers.iter().all(WorkerProc::is_alive) {
                    break;
                }
            }
            let now = Instant::now();
            if now >= deadline {
                warn!("Timed out waiting for workers to start");
                break;
            }
            self.poll_once(Some(POLL_SLICE.min(deadline - now)))?;
        }

        info!(workers = self.num_processes(), "Pool started");
        Ok(())
    }

    /// Wait up to `timeout` for results and run one maintenance pass.
    ///
    /// Returns the number of channels that had data. A fatal error
    /// terminates the pool before it is returned.
    pub fn poll_once(&self, timeout: Option<Duration>) -> Result<usize> {
        match self.step(timeout) {
            Ok(handled) => Ok(handled),
            Err(e) => {
                error!(error = %e, "Pool engine failed, terminating");
                if let Err(term) = self.terminate() {
                    warn!(error = %term, "Terminate after failure also failed");
                }
                Err(e)
            }
        }
    }

    fn step(&self, timeout: Option<Duration>) -> Result<usize> {
        let mut readers: FdSet = self.shared.fileno_to_outq.borrow().keys().copied().collect();
        let selected = self.shared.mux.borrow_mut().select(
            &mut readers,
            &mut FdSet::new(),
            &mut FdSet::new(),
            timeout,
        )?;

        let mut handled = 0;
        if selected.again {
            self.shared.drop_stale(&readers);
        } else if let Ok(mut results) = self.shared.results.try_borrow_mut() {
            for fd in selected.readable {
                results.handle_event(fd);
                handled += 1;
            }
        }

        self.shared.maintain()?;
        Ok(handled)
    }

    /// Reap exited workers, enforce time limits, spawn replacements.
    pub fn maintain(&self) -> Result<()> {
        self.shared.maintain()
    }

    pub fn apply_async(
        &self,
        action: &str,
        args: Args,
        kwargs: Kwargs,
        callback: Callback,
    ) -> Result<JobId> {
        let mut core = self.shared.core.borrow_mut();
        if core.state != PoolState::Run {
            return Err(PoolError::InvalidState {
                op: "apply_async",
                state: core.state,
            });
        }
        if core.target == 0 {
            return Err(PoolError::NoWorkers);
        }
        core.next_job_id += 1;
        let id = core.next_job_id;
        core.cache.insert(id, Pending::new(Promise::new(callback)));
        core.queue(Job::new(id, action, args, kwargs));
        Ok(id)
    }

    /// Stop accepting jobs. Workers exit once the queue has drained.
    pub fn close(&self) -> Result<()> {
        let mut core = self.shared.core.borrow_mut();
        if core.state != PoolState::Run {
            debug!(state = %core.state, "Close ignored");
            return Ok(());
        }
        info!("Closing pool");
        core.state = PoolState::Close;
        core.flush();
        Ok(())
    }

    /// Wait until every worker has exited. Requires `close` or `terminate`
    /// first.
    pub fn join(&self) -> Result<()> {
        let state = self.state();
        if state == PoolState::Run {
            return Err(PoolError::InvalidState { op: "join", state });
        }
        while !self.shared.core.borrow().workers.is_empty() {
            self.poll_once(Some(POLL_SLICE))?;
        }

        let leftovers = {
            let mut core = self.shared.core.borrow_mut();
            core.state = PoolState::Terminate;
            core.drain_pending()
        };
        for mut pending in leftovers {
            pending.promise.call(Err(JobFailure::Terminated));
        }
        self.shared.detach();
        info!("Pool joined");
        Ok(())
    }

    /// Stop every worker now and fail all outstanding jobs.
    pub fn terminate(&self) -> Result<()> {
        let workers = {
            let mut core = self.shared.core.borrow_mut();
            if core.state == PoolState::Terminate
                && core.workers.is_empty()
                && core.cache.is_empty()
            {
                return Ok(());
            }
            core.state = PoolState::Terminate;
            core.cursor = 0;
            std::mem::take(&mut core.workers)
        };
        info!(workers = workers.len(), "Terminating pool");

        for worker in &workers {
            let _ = worker.terminate();
        }
        let grace = self.shared.ctx.config.shutdown_grace;
        let mut exits = Vec::with_capacity(workers.len());
        for mut worker in workers {
            let reason = worker.stop(grace).unwrap_or_else(|e| {
                warn!(pid = worker.pid().as_raw(), error = %e, "Failed to stop worker");
                TerminationReason::Unknown
            });
            self.shared.drain_channel(worker.outbound_fd());
            self.shared.forget_channel(worker.outbound_fd());
            exits.push((worker.pid(), reason));
        }
        for (pid, reason) in exits {
            process_destructor(pid, reason.exit_code(), self.shared.ctx.destructor.as_ref());
        }

        let pending = self.shared.core.borrow_mut().drain_pending();
        for mut pending in pending {
            pending.promise.call(Err(JobFailure::Terminated));
        }
        self.shared.detach();
        Ok(())
    }

    /// Replace every worker. Running jobs finish on the old workers.
    pub fn restart(&self) -> Result<()> {
        {
            let mut core = self.shared.core.borrow_mut();
            if core.state != PoolState::Run {
                return Err(PoolError::InvalidState {
                    op: "restart",
                    state: core.state,
                });
            }
            let before = core.live_pids();
            for worker in core.workers.iter_mut().filter(|w| !w.is_reaped()) {
                worker.mark_retiring();
                worker.send_exit();
            }
            core.rederive_cursor(&before);
            core.stats.restarts += 1;
        }
        info!("Restarting pool");
        self.shared.maintain()?;

        let grace = self.shared.ctx.config.shutdown_grace;
        if !self.wait_for_retired(grace)? {
            let core = self.shared.core.borrow();
            for worker in core.workers.iter().filter(|w| w.is_retiring()) {
                warn!(pid = worker.pid().as_raw(), "Worker ignored exit request, killing");
                let _ = worker.signal(Signal::SIGKILL);
            }
            drop(core);
            if !self.wait_for_retired(grace)? {
                warn!("Some retired workers could not be reaped");
            }
        }
        Ok(())
    }

    fn wait_for_retired(&self, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.shared.core.borrow().retiring_count() == 0 {
                return Ok(true);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            self.poll_once(Some(POLL_SLICE.min(deadline - now)))?;
        }
    }

    /// Add `n` workers.
    pub fn grow(&self, n: usize) -> Result<()> {
        let mut core = self.shared.core.borrow_mut();
        if core.state != PoolState::Run {
            return Err(PoolError::InvalidState {
                op: "grow",
                state: core.state,
            });
        }
        core.target += n;
        for _ in 0..n {
            self.shared.spawn_worker(&mut core)?;
        }
        info!(by = n, size = core.active_count(), "Pool grown");
        Ok(())
    }

    /// Retire `n` workers, idle ones first, then ones that have not come up
    /// yet. At least one worker always stays.
    pub fn shrink(&self, n: usize) -> Result<()> {
        let mut core = self.shared.core.borrow_mut();
        if core.state != PoolState::Run {
            return Err(PoolError::InvalidState {
                op: "shrink",
                state: core.state,
            });
        }
        if n == 0 {
            return Ok(());
        }
        let size = core.active_count();
        if n >= size {
            return Err(PoolError::CannotShrink { size, by: n });
        }

        let before = core.live_pids();
        let mut candidates: Vec<usize> = (0..core.workers.len())
            .filter(|&i| !core.workers[i].is_retiring() && !core.workers[i].is_reaped())
            .collect();
        candidates.sort_by_key(|&i| {
            let worker = &core.workers[i];
            match (worker.is_alive(), worker.is_idle()) {
                (true, true) => 0,
                (false, _) => 1,
                (true, false) => 2,
            }
        });
        for &i in candidates.iter().take(n) {
            let worker = &mut core.workers[i];
            debug!(pid = worker.pid().as_raw(), "Retiring worker");
            worker.mark_retiring();
            worker.send_exit();
        }
        core.target = core.target.saturating_sub(n);
        core.rederive_cursor(&before);
        info!(by = n, size = core.active_count(), "Pool shrunk");
        Ok(())
    }

    /// SIGTERM the worker running `id`. A job that has not been written to
    /// a worker yet is dropped and fails as terminated.
    pub fn terminate_job(&self, id: JobId) -> Result<()> {
        let dropped = {
            let mut core = self.shared.core.borrow_mut();
            if let Some(pos) = core.buffer.iter().position(|job| job.id == id) {
                core.buffer.remove(pos);
                core.cache.remove(&id)
            } else {
                if let Some(worker) = core
                    .workers
                    .iter()
                    .find(|w| w.current_job() == Some(id))
                {
                    info!(id, pid = worker.pid().as_raw(), "Terminating job");
                    worker.terminate()?;
                }
                None
            }
        };
        if let Some(mut pending) = dropped {
            pending.promise.call(Err(JobFailure::Terminated));
        }
        Ok(())
    }

    /// Collect results and run maintenance from `event_loop` instead of
    /// [`poll_once`](Self::poll_once). Replaces any earlier registration.
    pub fn register_with_event_loop(&self, event_loop: Rc<dyn EventLoop>) {
        self.shared.detach();
        ResultHandler::register_with_event_loop(&self.shared.results, event_loop.as_ref());

        let weak = Rc::downgrade(&self.shared);
        let timer = event_loop.call_repeatedly(
            self.shared.ctx.config.maintenance_interval,
            Box::new(move || {
                let Some(shared) = weak.upgrade() else {
                    return;
                };
                if let Err(e) = shared.maintain() {
                    error!(error = %e, "Pool maintenance failed");
                    if e.is_fatal() {
                        let _ = AsyncPool { shared }.terminate();
                    }
                }
            }),
        );
        *self.shared.attached.borrow_mut() = Some(Attached { event_loop, timer });
    }

    pub fn did_start_ok(&self) -> bool {
        let core = self.shared.core.borrow();
        core.state == PoolState::Run && core.early_deaths == 0
    }

    pub fn state(&self) -> PoolState {
        self.shared.core.borrow().state
    }

    pub fn num_processes(&self) -> usize {
        self.shared.core.borrow().active_count()
    }

    /// Position of the next worker in the round-robin list.
    pub fn cursor(&self) -> usize {
        self.shared.core.borrow().cursor
    }

    /// Pids of the workers counted towards the pool size, in spawn order.
    pub fn pids(&self) -> Vec<Pid> {
        self.shared
            .core
            .borrow()
            .workers
            .iter()
            .filter(|w| !w.is_retiring() && !w.is_reaped())
            .map(WorkerProc::pid)
            .collect()
    }

    /// Jobs that have not produced an outcome yet.
    pub fn pending(&self) -> usize {
        self.shared.core.borrow().cache.len()
    }

    pub fn stats(&self) -> PoolStats {
        self.shared.core.borrow().stats.clone()
    }
}

impl PoolBackend for AsyncPool {
    fn start(&self) -> Result<()> {
        AsyncPool::start(self)
    }

    fn close(&self) -> Result<()> {
        AsyncPool::close(self)
    }

    fn join(&self) -> Result<()> {
        AsyncPool::join(self)
    }

    fn terminate(&self) -> Result<()> {
        AsyncPool::terminate(self)
    }

    fn restart(&self) -> Result<()> {
        AsyncPool::restart(self)
    }

    fn apply_async(
        &self,
        action: &str,
        args: Args,
        kwargs: Kwargs,
        callback: Callback,
    ) -> Result<JobId> {
        AsyncPool::apply_async(self, action, args, kwargs, callback)
    }

    fn terminate_job(&self, id: JobId) -> Result<()> {
        AsyncPool::terminate_job(self, id)
    }

    fn grow(&self, n: usize) -> Result<()> {
        AsyncPool::grow(self, n)
    }

    fn shrink(&self, n: usize) -> Result<()> {
        AsyncPool::shrink(self, n)
    }

    fn register_with_event_loop(&self, event_loop: Rc<dyn EventLoop>) {
        AsyncPool::register_with_event_loop(self, event_loop)
    }

    fn poll_once(&self, timeout: Option<Duration>) -> Result<usize> {
        AsyncPool::poll_once(self, timeout)
    }

    fn did_start_ok(&self) -> bool {
        AsyncPool::did_start_ok(self)
    }

    fn state(&self) -> PoolState {
        AsyncPool::state(self)
    }

    fn num_processes(&self) -> usize {
        AsyncPool::num_processes(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::ipc::{FrameReader, pipe};
    use crate::pool::protocol::Inbound;
    use nix::errno::Errno;

    /// A handle around a `sleep` child with an inspectable inbound pipe.
    fn fake_worker(index: usize) -> (WorkerProc, FrameReader) {
        let child = std::process::Command::new("sleep")
            .arg("30")
            .spawn()
            .expect("Failed to spawn sleep");
        let pid = Pid::from_raw(child.id() as i32);
        std::mem::forget(child);
        let (in_r, in_w) = pipe().unwrap();
        (WorkerProc::new(index, pid, in_w, -1), FrameReader::new(in_r))
    }

    fn core_with(n: usize, max_tasks: Option<usize>) -> (Core, Vec<FrameReader>) {
        let mut core = Core::new(n, max_tasks);
        let mut inbound = Vec::new();
        for i in 0..n {
            let (mut worker, reader) = fake_worker(i);
            worker.mark_alive();
            core.workers.push(worker);
            inbound.push(reader);
        }
        (core, inbound)
    }

    fn job(id: JobId) -> Job {
        Job::new(id, "noop", vec![], Kwargs::new())
    }

    fn received(reader: &mut FrameReader) -> JobId {
        match reader.recv::<Inbound>().unwrap().unwrap().unwrap() {
            Inbound::Job(job) => job.id,
            other => panic!("Expected Job frame, got {:?}", other),
        }
    }

    fn kill_all(core: &mut Core) {
        for worker in &mut core.workers {
            let _ = worker.kill();
        }
    }

    #[test]
    fn test_round_robin_advances_cursor() {
        let (mut core, mut inbound) = core_with(3, None);
        for id in 1..=3 {
            assert!(core.dispatch(job(id)).is_none());
        }
        assert_eq!(core.cursor, 0);
        // Every worker holds a job.
        assert_eq!(core.dispatch(job(4)), Some(job(4)));

        assert!(core.workers[0].finish_job(1));
        assert!(core.dispatch(job(4)).is_none());
        assert_eq!(core.cursor, 1);
        assert_eq!(received(&mut inbound[0]), 1);
        assert_eq!(received(&mut inbound[1]), 2);
        assert_eq!(received(&mut inbound[2]), 3);
        assert_eq!(received(&mut inbound[0]), 4);
        assert_eq!(core.stats.jobs_dispatched, 4);
        kill_all(&mut core);
    }

    #[test]
    fn test_busy_worker_keeps_its_turn() {
        let (mut core, mut inbound) = core_with(3, None);
        for id in 1..=3 {
            core.dispatch(job(id));
        }
        assert!(core.workers[1].finish_job(2));
        // The cursor points at the busy first worker, so the second goes next.
        assert!(core.dispatch(job(4)).is_none());
        assert_eq!(core.cursor, 2);
        assert_eq!(received(&mut inbound[0]), 1);
        assert_eq!(received(&mut inbound[1]), 2);
        assert_eq!(received(&mut inbound[1]), 4);
        assert_eq!(received(&mut inbound[2]), 3);
        kill_all(&mut core);
    }

    #[test]
    fn test_buffered_jobs_wait_for_a_free_worker() {
        let (mut core, mut inbound) = core_with(1, None);
        for id in 1..=3 {
            core.queue(job(id));
        }
        assert_eq!(core.buffer.len(), 2);
        assert_eq!(core.workers[0].jobs().len(), 1);

        core.workers[0].finish_job(1);
        core.flush();
        assert_eq!(core.buffer.iter().map(|j| j.id).collect::<Vec<_>>(), vec![3]);
        assert_eq!(received(&mut inbound[0]), 1);
        assert_eq!(received(&mut inbound[0]), 2);
        kill_all(&mut core);
    }

    #[test]
    fn test_cursor_skips_removed_worker() {
        let (mut core, mut inbound) = core_with(3, None);
        core.dispatch(job(1));
        assert_eq!(core.cursor, 1);

        // The worker the cursor points at goes away.
        let before = core.live_pids();
        core.workers[1].mark_retiring();
        core.rederive_cursor(&before);
        assert_eq!(core.cursor, 1);

        core.dispatch(job(2));
        assert_eq!(received(&mut inbound[0]), 1);
        assert_eq!(received(&mut inbound[2]), 2);
        kill_all(&mut core);
    }

    #[test]
    fn test_no_live_worker_hands_job_back() {
        let (mut core, _inbound) = core_with(2, None);
        for worker in &mut core.workers {
            worker.mark_retiring();
        }
        assert_eq!(core.dispatch(job(1)), Some(job(1)));

        core.queue(job(1));
        core.queue(job(2));
        assert_eq!(core.buffer.len(), 2);
        kill_all(&mut core);
    }

    #[test]
    fn test_task_cap_limits_dispatch() {
        let (mut core, _inbound) = core_with(1, Some(2));
        assert!(core.dispatch(job(1)).is_none());
        core.workers[0].finish_job(1);
        assert!(core.dispatch(job(2)).is_none());
        core.workers[0].finish_job(2);
        assert_eq!(core.dispatch(job(3)), Some(job(3)));
        assert_eq!(core.active_count(), 1);
        kill_all(&mut core);
    }

    #[test]
    fn test_free_index_reuses_gaps() {
        let (mut core, _inbound) = core_with(3, None);
        assert_eq!(core.free_index(), 3);
        core.workers[1].mark_retiring();
        assert_eq!(core.free_index(), 1);
        kill_all(&mut core);
    }

    #[test]
    fn test_drain_pending_is_ordered() {
        let mut core = Core::new(1, None);
        let order: Rc<RefCell<Vec<JobId>>> = Rc::default();
        for id in [3, 1, 2] {
            let sink = order.clone();
            core.cache.insert(
                id,
                Pending::new(Promise::new(move |_: JobOutcome| sink.borrow_mut().push(id))),
            );
        }
        core.buffer.push_back(job(3));
        for mut pending in core.drain_pending() {
            pending.promise.call(Err(JobFailure::Terminated));
        }
        assert_eq!(*order.borrow(), vec![1, 2, 3]);
        assert!(core.buffer.is_empty());
    }

    /// Poller whose every call fails with the same errno.
    struct FailingPoller(Errno);

    impl Poller for FailingPoller {
        fn poll(
            &mut self,
            _readers: &FdSet,
            _writers: &FdSet,
            _errors: &FdSet,
            _timeout: Option<Duration>,
        ) -> std::result::Result<(FdSet, FdSet), Errno> {
            Err(self.0)
        }

        fn probe(&mut self, _fd: RawFd) -> std::result::Result<(), Errno> {
            Err(self.0)
        }
    }

    #[test]
    fn test_exhausted_poll_terminates_pool() {
        let pool = AsyncPool::with_poller(
            SpawnContext::new(
                crate::config::PoolConfig::new(1),
                crate::pool::ActionRegistry::new(),
            ),
            FailingPoller(Errno::ENOMEM),
        );
        let outcomes: Rc<RefCell<Vec<JobOutcome>>> = Rc::default();
        let sink = outcomes.clone();
        pool.apply_async(
            "noop",
            vec![],
            Kwargs::new(),
            Box::new(move |outcome| sink.borrow_mut().push(outcome)),
        )
        .unwrap();
        assert_eq!(pool.pending(), 1);

        let err = pool.poll_once(Some(Duration::ZERO)).unwrap_err();
        assert!(matches!(err, PoolError::ResourceExhausted(Errno::ENOMEM)));
        assert_eq!(pool.state(), PoolState::Terminate);
        assert_eq!(pool.pending(), 0);
        assert_eq!(*outcomes.borrow(), vec![Err(JobFailure::Terminated)]);
    }

    #[test]
    fn test_apply_async_requires_run() {
        let pool = AsyncPool::new(SpawnContext::new(
            crate::config::PoolConfig::new(1),
            crate::pool::ActionRegistry::new(),
        ));
        pool.close().unwrap();
        let err = pool
            .apply_async("noop", vec![], Kwargs::new(), Box::new(|_| {}))
            .unwrap_err();
        assert!(matches!(
            err,
            PoolError::InvalidState {
                op: "apply_async",
                state: PoolState::Close
            }
        ));
        assert!(!pool.did_start_ok());
    }
}
