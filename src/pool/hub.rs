//! Event loop integration.
//!
//! The pool does not own a loop. It plugs read interests and a repeating
//! maintenance timer into whatever implements [`EventLoop`]. [`Hub`] is a
//! small single-threaded implementation driven by the [`Multiplexer`].

use super::mux::{FdSet, Multiplexer, Poller, SysPoller};
use crate::error::Result;
use std::cell::RefCell;
use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// What a read handler wants after it ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    /// Keep watching the descriptor.
    Keep,
    /// Stop watching the descriptor.
    Remove,
}

/// Called with the descriptor that became readable.
pub type ReadHandler = Box<dyn FnMut(RawFd) -> Interest>;

/// Called every time a repeating timer fires.
pub type TimerHandler = Box<dyn FnMut()>;

/// Identifies a timer registered with [`EventLoop::call_repeatedly`].
pub type TimerId = u64;

/// The operations the pool needs from a host event loop.
///
/// Methods take `&self` because handlers registered with the loop call
/// back into code that itself registers or removes interests.
pub trait EventLoop {
    /// Watch `fd` for readability, replacing any previous handler.
    fn add_reader(&self, fd: RawFd, handler: ReadHandler);

    /// Stop watching `fd`. Unknown descriptors are ignored.
    fn remove_reader(&self, fd: RawFd);

    /// Run `handler` every `interval` until cancelled.
    fn call_repeatedly(&self, interval: Duration, handler: TimerHandler) -> TimerId;

    fn cancel_timer(&self, id: TimerId);
}

struct Timer {
    id: TimerId,
    interval: Duration,
    due: Instant,
    /// Taken out while the handler runs.
    handler: Option<TimerHandler>,
}

#[derive(Default)]
struct HubState {
    readers: HashMap<RawFd, ReadHandler>,
    /// Descriptor whose handler is currently running, and whether it was
    /// removed while running.
    dispatching: Option<(RawFd, bool)>,
    timers: Vec<Timer>,
    next_timer: TimerId,
}

/// Single-threaded event loop.
pub struct Hub<P: Poller = SysPoller> {
    state: RefCell<HubState>,
    mux: RefCell<Multiplexer<P>>,
}

impl Default for Hub<SysPoller> {
    fn default() -> Self {
        Self::new()
    }
}

impl Hub<SysPoller> {
    pub fn new() -> Self {
        Self::with_poller(SysPoller)
    }
}

impl<P: Poller> std::fmt::Debug for Hub<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.borrow();
        let mut readers: Vec<RawFd> = state.readers.keys().copied().collect();
        readers.sort_unstable();
        f.debug_struct("Hub")
            .field("readers", &readers)
            .field("timers", &state.timers.len())
            .finish()
    }
}

impl<P: Poller> Hub<P> {
    pub fn with_poller(poller: P) -> Self {
        Self {
            state: RefCell::new(HubState::default()),
            mux: RefCell::new(Multiplexer::with_poller(poller)),
        }
    }

    /// Descriptors currently watched.
    pub fn readers(&self) -> FdSet {
        self.state.borrow().readers.keys().copied().collect()
    }

    pub fn timer_count(&self) -> usize {
        self.state.borrow().timers.len()
    }

    /// Wait up to `timeout` (shortened to the next timer) for readiness,
    /// dispatch ready readers, then run due timers.
    pub fn run_once(&self, timeout: Option<Duration>) -> Result<()> {
        let timeout = self.clamp_to_timers(timeout);
        let mut readers = self.readers();
        let mut writers = FdSet::new();
        let mut errors = FdSet::new();

        let selected = self
            .mux
            .borrow_mut()
            .select(&mut readers, &mut writers, &mut errors, timeout)?;

        if selected.again {
            // Anything the multiplexer pruned is gone for good.
            let mut state = self.state.borrow_mut();
            let stale: Vec<RawFd> = state
                .readers
                .keys()
                .filter(|fd| !readers.contains(fd))
                .copied()
                .collect();
            for fd in stale {
                debug!(fd, "Removing stale reader");
                state.readers.remove(&fd);
            }
        } else {
            for fd in selected.readable {
                self.dispatch(fd);
            }
        }

        self.run_timers();
        Ok(())
    }

    /// Run until `done` returns true or `deadline` passes. Returns `done()`.
    pub fn run_until(&self, deadline: Instant, mut done: impl FnMut() -> bool) -> Result<bool> {
        while !done() {
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            self.run_once(Some((deadline - now).min(Duration::from_millis(50))))?;
        }
        Ok(true)
    }

    fn clamp_to_timers(&self, timeout: Option<Duration>) -> Option<Duration> {
        let state = self.state.borrow();
        let now = Instant::now();
        let next = state
            .timers
            .iter()
            .map(|t| t.due.saturating_duration_since(now))
            .min();
        match (timeout, next) {
            (Some(t), Some(n)) => Some(t.min(n)),
            (None, n) => n,
            (t, None) => t,
        }
    }

    fn dispatch(&self, fd: RawFd) {
        let handler = {
            let mut state = self.state.borrow_mut();
            let Some(handler) = state.readers.remove(&fd) else {
                return;
            };
            state.dispatching = Some((fd, false));
            handler
        };

        let mut handler = handler;
        let interest = handler(fd);

        let mut state = self.state.borrow_mut();
        let removed = matches!(state.dispatching.take(), Some((_, true)));
        if interest == Interest::Keep && !removed && !state.readers.contains_key(&fd) {
            state.readers.insert(fd, handler);
        } else {
            trace!(fd, ?interest, removed, "Reader dropped after dispatch");
        }
    }

    fn run_timers(&self) {
        let now = Instant::now();
        let due: Vec<TimerId> = self
            .state
            .borrow()
            .timers
            .iter()
            .filter(|t| t.due <= now)
            .map(|t| t.id)
            .collect();

        for id in due {
            let handler = {
                let mut state = self.state.borrow_mut();
                state
                    .timers
                    .iter_mut()
                    .find(|t| t.id == id)
                    .and_then(|t| t.handler.take())
            };
            let Some(mut handler) = handler else {
                continue;
            };
            handler();

            let mut state = self.state.borrow_mut();
            if let Some(timer) = state.timers.iter_mut().find(|t| t.id == id) {
                timer.handler = Some(handler);
                timer.due = Instant::now() + timer.interval;
            }
        }
    }
}

impl<P: Poller> EventLoop for Hub<P> {
    fn add_reader(&self, fd: RawFd, handler: ReadHandler) {
        let mut state = self.state.borrow_mut();
        if let Some((dispatching, removed)) = state.dispatching.as_mut()
            && *dispatching == fd
        {
            // Re-registration from inside its own handler wins over Remove.
            *removed = false;
        }
        state.readers.insert(fd, handler);
    }

    fn remove_reader(&self, fd: RawFd) {
        let mut state = self.state.borrow_mut();
        state.readers.remove(&fd);
        if let Some((dispatching, removed)) = state.dispatching.as_mut()
            && *dispatching == fd
        {
            *removed = true;
        }
    }

    fn call_repeatedly(&self, interval: Duration, handler: TimerHandler) -> TimerId {
        let mut state = self.state.borrow_mut();
        state.next_timer += 1;
        let id = state.next_timer;
        state.timers.push(Timer {
            id,
            interval,
            due: Instant::now() + interval,
            handler: Some(handler),
        });
        id
    }

    fn cancel_timer(&self, id: TimerId) {
        self.state.borrow_mut().timers.retain(|t| t.id != id);
    }
}
