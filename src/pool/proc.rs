//! Pool-side handle for one worker process.

use super::frame::FrameParser;
use super::ipc::{FrameWriter, PipeFd};
use super::protocol::{Inbound, Job, JobId};
use super::signals::TerminationReason;
use crate::error::{PoolError, Result};
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{WaitPidFlag, waitpid};
use nix::unistd::Pid;
use std::collections::VecDeque;
use std::os::unix::io::{AsRawFd, IntoRawFd, RawFd};
use std::time::{Duration, Instant};

/// Handle to a worker process.
///
/// Owns the write end of the worker's inbound pipe. The read end of the
/// outbound pipe lives in the pool's fileno map as an [`OutboundChannel`];
/// the handle only remembers its descriptor number.
#[derive(Debug)]
pub struct WorkerProc {
    index: usize,
    pid: Pid,
    inbound: FrameWriter,
    outbound_fd: RawFd,
    /// Set once the worker's `WorkerUp` frame was observed.
    alive: bool,
    /// Being removed by shrink/restart; no longer counted or dispatched to.
    retiring: bool,
    exit_sent: bool,
    reaped: bool,
    /// Jobs written to this worker and not yet answered, oldest first.
    jobs: VecDeque<JobId>,
    tasks_done: usize,
    spawned_at: Instant,
}

impl WorkerProc {
    pub fn new(index: usize, pid: Pid, inbound: PipeFd, outbound_fd: RawFd) -> Self {
        Self {
            index,
            pid,
            inbound: FrameWriter::new(inbound),
            outbound_fd,
            alive: false,
            retiring: false,
            exit_sent: false,
            reaped: false,
            jobs: VecDeque::new(),
            tasks_done: 0,
            spawned_at: Instant::now(),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn inbound_fd(&self) -> RawFd {
        self.inbound.as_raw_fd()
    }

    pub fn outbound_fd(&self) -> RawFd {
        self.outbound_fd
    }

    pub fn is_alive(&self) -> bool {
        self.alive
    }

    pub fn mark_alive(&mut self) {
        self.alive = true;
    }

    pub fn is_retiring(&self) -> bool {
        self.retiring
    }

    pub fn mark_retiring(&mut self) {
        self.retiring = true;
    }

    /// Stop dispatching to a worker whose channel broke.
    pub fn mark_unreachable(&mut self) {
        self.exit_sent = true;
    }

    pub fn is_reaped(&self) -> bool {
        self.reaped
    }

    /// Can receive new jobs.
    pub fn is_dispatchable(&self) -> bool {
        self.alive && !self.retiring && !self.exit_sent && !self.reaped
    }

    pub fn jobs(&self) -> &VecDeque<JobId> {
        &self.jobs
    }

    pub fn is_idle(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn tasks_done(&self) -> usize {
        self.tasks_done
    }

    pub fn uptime(&self) -> Duration {
        self.spawned_at.elapsed()
    }

    /// Write a job frame and record it as in flight.
    pub fn send_job(&mut self, job: &Job) -> Result<()> {
        self.inbound
            .send(&Inbound::Job(job.clone()))
            .map_err(|e| PoolError::Worker(format!("Failed to send to worker {}: {}", self.pid, e)))?;
        self.jobs.push_back(job.id);
        Ok(())
    }

    /// Forget an in-flight job. Returns false if it was not ours.
    pub fn finish_job(&mut self, id: JobId) -> bool {
        match self.jobs.iter().position(|j| *j == id) {
            Some(pos) => {
                self.jobs.remove(pos);
                self.tasks_done += 1;
                true
            }
            None => false,
        }
    }

    /// Oldest in-flight job, which is the one the worker is running.
    pub fn current_job(&self) -> Option<JobId> {
        self.jobs.front().copied()
    }

    /// Drain every in-flight job id.
    pub fn take_jobs(&mut self) -> Vec<JobId> {
        self.jobs.drain(..).collect()
    }

    /// Ask the worker to exit once its queue is empty. Sent at most once.
    pub fn send_exit(&mut self) {
        if self.exit_sent || self.reaped {
            return;
        }
        self.exit_sent = true;
        // A worker that already went away will be reaped anyway.
        let _ = self.inbound.send(&Inbound::Exit);
    }

    pub fn signal(&self, sig: Signal) -> Result<()> {
        if self.reaped {
            return Ok(());
        }
        signal::kill(self.pid, sig).map_err(PoolError::from_errno)
    }

    /// Send SIGTERM to the process.
    pub fn terminate(&self) -> Result<()> {
        self.signal(Signal::SIGTERM)
    }

    /// Try to reap the process (non-blocking).
    ///
    /// Returns `None` while it is still running.
    pub fn try_wait(&mut self) -> Result<Option<TerminationReason>> {
        if self.reaped {
            return Ok(None);
        }
        match waitpid(self.pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(status) => {
                let reason = TerminationReason::from_wait(status);
                self.reaped = reason.is_some();
                Ok(reason)
            }
            Err(nix::errno::Errno::ECHILD) => {
                self.reaped = true;
                Ok(Some(TerminationReason::Unknown))
            }
            Err(e) => Err(PoolError::from_errno(e)),
        }
    }

    /// Send SIGKILL to the process and wait for it to exit.
    pub fn kill(&mut self) -> Result<TerminationReason> {
        if self.reaped {
            return Ok(TerminationReason::Unknown);
        }
        let _ = signal::kill(self.pid, Signal::SIGKILL);
        loop {
            match waitpid(self.pid, None) {
                Ok(status) => {
                    if let Some(reason) = TerminationReason::from_wait(status) {
                        self.reaped = true;
                        return Ok(reason);
                    }
                }
                Err(nix::errno::Errno::EINTR) => continue,
                Err(nix::errno::Errno::ECHILD) => {
                    self.reaped = true;
                    return Ok(TerminationReason::Unknown);
                }
                Err(e) => return Err(PoolError::from_errno(e)),
            }
        }
    }

    /// Wait up to `grace` for the process to exit, then escalate to
    /// SIGTERM and finally SIGKILL.
    pub fn stop(&mut self, grace: Duration) -> Result<TerminationReason> {
        if self.reaped {
            return Ok(TerminationReason::Unknown);
        }
        let start = Instant::now();
        while start.elapsed() < grace {
            if let Some(reason) = self.try_wait()? {
                return Ok(reason);
            }
            std::thread::sleep(Duration::from_millis(10));
        }

        let _ = self.terminate();
        std::thread::sleep(Duration::from_millis(100));
        if let Some(reason) = self.try_wait()? {
            return Ok(reason);
        }

        self.kill()
    }
}

impl Drop for WorkerProc {
    fn drop(&mut self) {
        if !self.reaped {
            let _ = self.terminate();
            std::thread::sleep(Duration::from_millis(10));
            if let Ok(Some(_)) = self.try_wait() {
                return;
            }
            let _ = signal::kill(self.pid, Signal::SIGKILL);
            let _ = waitpid(self.pid, None);
            self.reaped = true;
        }
    }
}

/// Read side of a worker's outbound pipe plus its frame parser.
#[derive(Debug)]
pub struct OutboundChannel {
    pid: Pid,
    reader: PipeFd,
    parser: FrameParser,
}

impl OutboundChannel {
    pub fn new(pid: Pid, reader: PipeFd) -> Self {
        Self {
            pid,
            reader,
            parser: FrameParser::new(),
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn fd(&self) -> RawFd {
        self.reader.as_raw_fd()
    }

    pub fn reader_mut(&mut self) -> &mut PipeFd {
        &mut self.reader
    }

    pub fn parser_mut(&mut self) -> &mut FrameParser {
        &mut self.parser
    }

    pub fn parser(&self) -> &FrameParser {
        &self.parser
    }

    pub fn into_reader(self) -> PipeFd {
        self.reader
    }

    /// Give up a descriptor the OS already reported as invalid, without
    /// closing whatever may now be using that number.
    pub fn abandon(self) {
        let _ = self.reader.into_raw_fd();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::ipc::{FrameReader, pipe};
    use crate::pool::protocol::Kwargs;

    fn handle_for_sleep() -> (WorkerProc, FrameReader) {
        let child = std::process::Command::new("sleep")
            .arg("60")
            .spawn()
            .expect("Failed to spawn sleep");
        let pid = Pid::from_raw(child.id() as i32);
        std::mem::forget(child);
        let (in_r, in_w) = pipe().unwrap();
        (WorkerProc::new(0, pid, in_w, -1), FrameReader::new(in_r))
    }

    #[test]
    fn test_job_bookkeeping() {
        let (mut proc, mut inbound) = handle_for_sleep();
        assert!(!proc.is_dispatchable());
        proc.mark_alive();
        assert!(proc.is_dispatchable());

        proc.send_job(&Job::new(1, "noop", vec![], Kwargs::new())).unwrap();
        proc.send_job(&Job::new(2, "noop", vec![], Kwargs::new())).unwrap();
        assert_eq!(proc.current_job(), Some(1));
        assert!(proc.finish_job(1));
        assert!(!proc.finish_job(1));
        assert_eq!(proc.tasks_done(), 1);
        assert_eq!(proc.take_jobs(), vec![2]);
        assert!(proc.is_idle());

        match inbound.recv::<Inbound>().unwrap().unwrap().unwrap() {
            Inbound::Job(job) => assert_eq!(job.id, 1),
            other => panic!("Expected Job frame, got {:?}", other),
        }

        proc.send_exit();
        assert!(!proc.is_dispatchable());
        proc.kill().unwrap();
    }

    #[test]
    fn test_stop_escalates() {
        let (mut proc, _inbound) = handle_for_sleep();
        let reason = proc.stop(Duration::from_millis(50)).unwrap();
        assert!(matches!(
            reason,
            TerminationReason::Signaled(Signal::SIGTERM) | TerminationReason::Signaled(Signal::SIGKILL)
        ));
        assert!(proc.is_reaped());
        assert!(proc.try_wait().unwrap().is_none());
    }

    #[test]
    fn test_retiring_is_not_dispatchable() {
        let (mut proc, _inbound) = handle_for_sleep();
        proc.mark_alive();
        proc.mark_retiring();
        assert!(!proc.is_dispatchable());
        proc.kill().unwrap();
    }
}
