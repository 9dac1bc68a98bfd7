//! Result demultiplexing.
//!
//! Every worker writes its frames to its own outbound pipe. The
//! [`ResultHandler`] turns readiness on those pipes into decoded frames and
//! routes each frame to the callback that owns it.

use super::hub::{EventLoop, Interest, ReadHandler};
use super::ipc::READ_CHUNK;
use super::proc::OutboundChannel;
use super::protocol::{JobId, JobOutcome, Outbound};
use crate::error::JobFailure;
use nix::unistd::Pid;
use std::cell::RefCell;
use std::collections::HashMap;
use std::io::{self, Read};
use std::os::unix::io::RawFd;
use std::rc::Rc;
use tracing::{debug, trace, warn};

/// Outbound descriptor to the channel it belongs to.
pub type FilenoMap = Rc<RefCell<HashMap<RawFd, OutboundChannel>>>;

/// A result reported by a worker.
#[derive(Debug, Clone, PartialEq)]
pub struct JobReady {
    /// `None` when the frame was too damaged to tell which job it was for.
    pub id: Option<JobId>,
    pub pid: Pid,
    pub outcome: JobOutcome,
}

/// Something that happened on an outbound channel.
#[derive(Debug, Clone, PartialEq)]
pub enum StateEvent {
    Message(Outbound),
    Corrupt { pid: Pid, reason: String },
    Closed { pid: Pid },
}

/// Receivers for demultiplexed events.
pub struct Callbacks {
    pub on_process_alive: Box<dyn FnMut(Pid)>,
    pub on_job_accepted: Box<dyn FnMut(JobId, Pid)>,
    pub on_job_ready: Box<dyn FnMut(JobReady)>,
    pub on_channel_closed: Box<dyn FnMut(Pid)>,
}

impl Default for Callbacks {
    fn default() -> Self {
        Self {
            on_process_alive: Box::new(|_| {}),
            on_job_accepted: Box::new(|_, _| {}),
            on_job_ready: Box::new(|_| {}),
            on_channel_closed: Box::new(|_| {}),
        }
    }
}

pub struct ResultHandler {
    fileno_to_outq: FilenoMap,
    callbacks: Callbacks,
    chunk: Box<[u8]>,
}

impl std::fmt::Debug for ResultHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultHandler")
            .field("channels", &self.fileno_to_outq.borrow().len())
            .finish()
    }
}

impl ResultHandler {
    pub fn new(fileno_to_outq: FilenoMap, callbacks: Callbacks) -> Self {
        Self {
            fileno_to_outq,
            callbacks,
            chunk: vec![0u8; READ_CHUNK].into_boxed_slice(),
        }
    }

    /// Watch every known outbound descriptor on `event_loop`.
    pub fn register_with_event_loop(this: &Rc<RefCell<Self>>, event_loop: &dyn EventLoop) {
        let fds: Vec<RawFd> = this.borrow().fileno_to_outq.borrow().keys().copied().collect();
        for fd in fds {
            event_loop.add_reader(fd, Self::reader(this));
        }
    }

    /// Read handler bound to this result handler.
    ///
    /// Holds only a weak reference; once the handler is gone the interest
    /// removes itself. A handler that is already busy (a callback drove
    /// the loop recursively) keeps the interest and retries next round.
    pub fn reader(this: &Rc<RefCell<Self>>) -> ReadHandler {
        let weak = Rc::downgrade(this);
        Box::new(move |fd| match weak.upgrade() {
            Some(handler) => match handler.try_borrow_mut() {
                Ok(mut handler) => handler.handle_event(fd),
                Err(_) => Interest::Keep,
            },
            None => Interest::Remove,
        })
    }

    /// Process readiness on `fd`.
    ///
    /// Performs one read. Every complete frame is dispatched in order and
    /// a partial frame stays buffered for the next call. A descriptor with
    /// no channel is ignored.
    pub fn handle_event(&mut self, fd: RawFd) -> Interest {
        let mut events = Vec::new();
        let interest = {
            let mut map = self.fileno_to_outq.borrow_mut();
            let Some(channel) = map.get_mut(&fd) else {
                trace!(fd, "Readiness for unknown descriptor");
                return Interest::Remove;
            };
            let pid = channel.pid();

            let closed = match channel.reader_mut().read(&mut self.chunk) {
                Ok(0) => Some(false),
                Ok(n) => {
                    channel.parser_mut().feed(&self.chunk[..n]);
                    while let Some(frame) = channel.parser_mut().next_frame::<Outbound>() {
                        events.push(match frame {
                            Ok(msg) => StateEvent::Message(msg),
                            Err(e) => StateEvent::Corrupt {
                                pid,
                                reason: e.to_string(),
                            },
                        });
                    }
                    None
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => None,
                Err(e) => {
                    warn!(fd, pid = pid.as_raw(), error = %e, "Outbound channel failed");
                    Some(e.raw_os_error() == Some(nix::libc::EBADF))
                }
            };

            match closed {
                None => Interest::Keep,
                Some(stale) => {
                    if let Some(channel) = map.remove(&fd) {
                        if channel.parser().in_progress() {
                            events.push(StateEvent::Corrupt {
                                pid,
                                reason: "channel closed mid-frame".to_string(),
                            });
                        }
                        if stale {
                            channel.abandon();
                        }
                    }
                    debug!(fd, pid = pid.as_raw(), "Outbound channel closed");
                    events.push(StateEvent::Closed { pid });
                    Interest::Remove
                }
            }
        };

        for event in events {
            self.on_state_change(event);
        }
        interest
    }

    /// Route one event to its callback.
    pub fn on_state_change(&mut self, event: StateEvent) {
        match event {
            StateEvent::Message(Outbound::WorkerUp { pid }) => {
                (self.callbacks.on_process_alive)(Pid::from_raw(pid))
            }
            StateEvent::Message(Outbound::Ack { id, pid }) => {
                (self.callbacks.on_job_accepted)(id, Pid::from_raw(pid))
            }
            StateEvent::Message(Outbound::Ready { id, pid, outcome }) => {
                (self.callbacks.on_job_ready)(JobReady {
                    id: Some(id),
                    pid: Pid::from_raw(pid),
                    outcome,
                })
            }
            StateEvent::Message(Outbound::Rejected { id, pid, reason }) => {
                warn!(pid, ?id, %reason, "Worker rejected a job frame");
                (self.callbacks.on_job_ready)(JobReady {
                    id,
                    pid: Pid::from_raw(pid),
                    outcome: Err(JobFailure::Corrupt { reason }),
                })
            }
            StateEvent::Corrupt { pid, reason } => {
                warn!(pid = pid.as_raw(), %reason, "Corrupt frame from worker");
                (self.callbacks.on_job_ready)(JobReady {
                    id: None,
                    pid,
                    outcome: Err(JobFailure::Corrupt { reason }),
                })
            }
            StateEvent::Closed { pid } => (self.callbacks.on_channel_closed)(pid),
        }
    }
}
