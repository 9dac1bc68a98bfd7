//! Descriptor readiness multiplexing with error recovery.
//!
//! [`Multiplexer::select`] polls three descriptor sets at once and absorbs
//! the two races a pool hits in normal operation: a signal interrupting the
//! poll, and a worker pipe being closed while it was still registered.
//! Both come back as a retry. Resource exhaustion and unknown OS errors
//! are propagated untouched.

use crate::error::{PoolError, Result, is_exhaustion};
use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout};
use std::collections::BTreeSet;
use std::os::unix::io::{BorrowedFd, RawFd};
use std::time::Duration;
use tracing::{debug, trace};

/// A set of raw descriptor identities.
pub type FdSet = BTreeSet<RawFd>;

/// Outcome of one [`Multiplexer::select`] call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selected {
    pub readable: FdSet,
    pub writable: FdSet,
    /// Nothing was polled; the caller should simply try again.
    pub again: bool,
}

impl Selected {
    fn retry() -> Self {
        Self {
            again: true,
            ..Self::default()
        }
    }
}

/// The OS readiness primitive behind the multiplexer.
pub trait Poller {
    /// Poll every descriptor in the three sets once and return the ready
    /// readers and writers.
    fn poll(
        &mut self,
        readers: &FdSet,
        writers: &FdSet,
        errors: &FdSet,
        timeout: Option<Duration>,
    ) -> std::result::Result<(FdSet, FdSet), Errno>;

    /// Check a single descriptor without waiting. `Err(EBADF)` means the
    /// descriptor is no longer valid.
    fn probe(&mut self, fd: RawFd) -> std::result::Result<(), Errno>;
}

impl<P: Poller + ?Sized> Poller for Box<P> {
    fn poll(
        &mut self,
        readers: &FdSet,
        writers: &FdSet,
        errors: &FdSet,
        timeout: Option<Duration>,
    ) -> std::result::Result<(FdSet, FdSet), Errno> {
        (**self).poll(readers, writers, errors, timeout)
    }

    fn probe(&mut self, fd: RawFd) -> std::result::Result<(), Errno> {
        (**self).probe(fd)
    }
}

/// [`Poller`] backed by `poll(2)`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SysPoller;

fn poll_timeout(timeout: Option<Duration>) -> PollTimeout {
    match timeout {
        None => PollTimeout::NONE,
        Some(d) => {
            let ms = d.as_millis().min(i32::MAX as u128) as i32;
            PollTimeout::try_from(ms).unwrap_or(PollTimeout::NONE)
        }
    }
}

impl Poller for SysPoller {
    fn poll(
        &mut self,
        readers: &FdSet,
        writers: &FdSet,
        errors: &FdSet,
        timeout: Option<Duration>,
    ) -> std::result::Result<(FdSet, FdSet), Errno> {
        let all: FdSet = readers | &(writers | errors);
        let mut fds: Vec<PollFd<'_>> = all
            .iter()
            .map(|&fd| {
                let mut events = PollFlags::empty();
                if readers.contains(&fd) {
                    events |= PollFlags::POLLIN;
                }
                if writers.contains(&fd) {
                    events |= PollFlags::POLLOUT;
                }
                if errors.contains(&fd) {
                    events |= PollFlags::POLLPRI;
                }
                // Safety: poll(2) only reads the number; a closed descriptor
                // is reported through POLLNVAL, never dereferenced.
                let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
                PollFd::new(borrowed, events)
            })
            .collect();

        nix::poll::poll(&mut fds, poll_timeout(timeout))?;

        let mut readable = FdSet::new();
        let mut writable = FdSet::new();
        for (fd, pfd) in all.iter().zip(fds.iter()) {
            let Some(revents) = pfd.revents() else {
                continue;
            };
            if revents.contains(PollFlags::POLLNVAL) {
                return Err(Errno::EBADF);
            }
            let failed = revents.intersects(PollFlags::POLLERR | PollFlags::POLLHUP);
            if readers.contains(fd) && (revents.contains(PollFlags::POLLIN) || failed) {
                readable.insert(*fd);
            }
            if writers.contains(fd) && (revents.contains(PollFlags::POLLOUT) || failed) {
                writable.insert(*fd);
            }
            if errors.contains(fd) && (revents.contains(PollFlags::POLLPRI) || failed) {
                readable.insert(*fd);
            }
        }
        Ok((readable, writable))
    }

    fn probe(&mut self, fd: RawFd) -> std::result::Result<(), Errno> {
        // Safety: see `poll` above.
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        let mut fds = [PollFd::new(borrowed, PollFlags::empty())];
        match nix::poll::poll(&mut fds, PollTimeout::ZERO) {
            Ok(_) => match fds[0].revents() {
                Some(revents) if revents.contains(PollFlags::POLLNVAL) => Err(Errno::EBADF),
                _ => Ok(()),
            },
            Err(e) => Err(e),
        }
    }
}

/// Hardened wrapper over a [`Poller`].
#[derive(Debug, Default)]
pub struct Multiplexer<P = SysPoller> {
    poller: P,
}

impl Multiplexer<SysPoller> {
    pub fn new() -> Self {
        Self { poller: SysPoller }
    }
}

impl<P: Poller> Multiplexer<P> {
    pub fn with_poller(poller: P) -> Self {
        Self { poller }
    }

    pub fn poller_mut(&mut self) -> &mut P {
        &mut self.poller
    }

    /// Wait for readiness on the given sets.
    ///
    /// On a stale descriptor every descriptor confirmed invalid is removed
    /// from all three sets in place before the retry is returned. An
    /// interrupted poll leaves the sets untouched.
    pub fn select(
        &mut self,
        readers: &mut FdSet,
        writers: &mut FdSet,
        errors: &mut FdSet,
        timeout: Option<Duration>,
    ) -> Result<Selected> {
        match self.poller.poll(readers, writers, errors, timeout) {
            Ok((readable, writable)) => Ok(Selected {
                readable,
                writable,
                again: false,
            }),
            Err(e) if is_exhaustion(e) => Err(PoolError::ResourceExhausted(e)),
            Err(Errno::EINTR) => {
                trace!("poll interrupted, retrying");
                Ok(Selected::retry())
            }
            Err(Errno::EBADF) => {
                self.prune_stale(readers, writers, errors)?;
                Ok(Selected::retry())
            }
            Err(e) => Err(PoolError::Os(e)),
        }
    }

    /// Probe descriptors one by one and drop the invalid ones.
    fn prune_stale(
        &mut self,
        readers: &mut FdSet,
        writers: &mut FdSet,
        errors: &mut FdSet,
    ) -> Result<()> {
        let all: FdSet = &*readers | &(&*writers | &*errors);
        for fd in all {
            match self.poller.probe(fd) {
                Ok(()) => {}
                Err(Errno::EBADF) => {
                    debug!(fd, "dropping stale descriptor");
                    readers.remove(&fd);
                    writers.remove(&fd);
                    errors.remove(&fd);
                }
                Err(Errno::EINTR) => {}
                Err(e) => return Err(PoolError::from_errno(e)),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, VecDeque};
    use std::io::Write;

    /// Poller that replays scripted results.
    #[derive(Default)]
    struct ScriptedPoller {
        polls: VecDeque<std::result::Result<(FdSet, FdSet), Errno>>,
        probes: HashMap<RawFd, Errno>,
        probe_all: Option<Errno>,
        probed: Vec<RawFd>,
    }

    impl Poller for ScriptedPoller {
        fn poll(
            &mut self,
            _readers: &FdSet,
            _writers: &FdSet,
            _errors: &FdSet,
            _timeout: Option<Duration>,
        ) -> std::result::Result<(FdSet, FdSet), Errno> {
            self.polls.pop_front().unwrap_or(Ok((FdSet::new(), FdSet::new())))
        }

        fn probe(&mut self, fd: RawFd) -> std::result::Result<(), Errno> {
            self.probed.push(fd);
            if let Some(e) = self.probe_all {
                return Err(e);
            }
            match self.probes.get(&fd) {
                Some(e) => Err(*e),
                None => Ok(()),
            }
        }
    }

    fn set(fds: &[RawFd]) -> FdSet {
        fds.iter().copied().collect()
    }

    fn mux_with(polls: Vec<std::result::Result<(FdSet, FdSet), Errno>>) -> Multiplexer<ScriptedPoller> {
        Multiplexer::with_poller(ScriptedPoller {
            polls: polls.into(),
            ..Default::default()
        })
    }

    #[test]
    fn test_ready_sets_pass_through() {
        let mut mux = mux_with(vec![Ok((set(&[3]), FdSet::new()))]);
        let mut readers = set(&[3]);
        let selected = mux
            .select(&mut readers, &mut FdSet::new(), &mut FdSet::new(), None)
            .unwrap();
        assert_eq!(
            selected,
            Selected {
                readable: set(&[3]),
                writable: FdSet::new(),
                again: false
            }
        );
    }

    #[test]
    fn test_error_set_only_descriptor() {
        let mut mux = mux_with(vec![Ok((set(&[3]), FdSet::new()))]);
        let selected = mux
            .select(&mut set(&[3]), &mut FdSet::new(), &mut set(&[3]), None)
            .unwrap();
        assert_eq!(selected.readable, set(&[3]));
        assert!(!selected.again);
    }

    #[test]
    fn test_interrupted_poll_keeps_readers() {
        let mut mux = mux_with(vec![Err(Errno::EINTR)]);
        let mut readers = set(&[3]);
        let selected = mux
            .select(&mut readers, &mut FdSet::new(), &mut FdSet::new(), None)
            .unwrap();
        assert_eq!(selected, Selected::retry());
        assert!(readers.contains(&3));
        assert!(mux.poller_mut().probed.is_empty());
    }

    #[test]
    fn test_stale_descriptor_is_pruned() {
        let mut mux = mux_with(vec![Err(Errno::EBADF)]);
        mux.poller_mut().probes.insert(3, Errno::EBADF);
        let mut readers = set(&[3, 4]);
        let mut writers = set(&[3]);
        let mut errors = set(&[3, 5]);
        let selected = mux
            .select(&mut readers, &mut writers, &mut errors, None)
            .unwrap();
        assert_eq!(selected, Selected::retry());
        assert_eq!(readers, set(&[4]));
        assert!(writers.is_empty());
        assert_eq!(errors, set(&[5]));
    }

    #[test]
    fn test_exhaustion_from_poll_propagates() {
        let mut mux = mux_with(vec![Err(Errno::ENOMEM)]);
        let err = mux
            .select(&mut set(&[1]), &mut FdSet::new(), &mut FdSet::new(), None)
            .unwrap_err();
        assert!(matches!(err, PoolError::ResourceExhausted(Errno::ENOMEM)));
    }

    #[test]
    fn test_exhaustion_from_fallback_propagates() {
        let mut mux = mux_with(vec![Err(Errno::EBADF)]);
        mux.poller_mut().probe_all = Some(Errno::ENOMEM);
        let mut readers = set(&[3]);
        let err = mux
            .select(&mut readers, &mut FdSet::new(), &mut FdSet::new(), None)
            .unwrap_err();
        assert!(matches!(err, PoolError::ResourceExhausted(Errno::ENOMEM)));
    }

    #[test]
    fn test_unknown_error_from_fallback_propagates() {
        let mut mux = mux_with(vec![Err(Errno::EBADF)]);
        mux.poller_mut().probe_all = Some(Errno::EIO);
        let err = mux
            .select(&mut set(&[3]), &mut FdSet::new(), &mut FdSet::new(), None)
            .unwrap_err();
        assert!(matches!(err, PoolError::Os(Errno::EIO)));
    }

    #[test]
    fn test_unknown_error_from_poll_propagates() {
        let mut mux = mux_with(vec![Err(Errno::EINVAL)]);
        let err = mux
            .select(&mut set(&[3]), &mut FdSet::new(), &mut FdSet::new(), None)
            .unwrap_err();
        assert!(matches!(err, PoolError::Os(Errno::EINVAL)));
    }

    #[test]
    fn test_sys_poller_reports_readable_pipe() {
        let (read_fd, mut write_fd) = crate::pool::ipc::pipe().unwrap();
        use std::os::unix::io::AsRawFd;
        let fd = read_fd.as_raw_fd();

        let mut mux = Multiplexer::new();
        let mut readers = set(&[fd]);
        let selected = mux
            .select(
                &mut readers,
                &mut FdSet::new(),
                &mut FdSet::new(),
                Some(Duration::ZERO),
            )
            .unwrap();
        assert!(selected.readable.is_empty());

        write_fd.write_all(b"x").unwrap();
        let selected = mux
            .select(
                &mut readers,
                &mut FdSet::new(),
                &mut FdSet::new(),
                Some(Duration::from_secs(1)),
            )
            .unwrap();
        assert_eq!(selected.readable, set(&[fd]));
    }

    #[test]
    fn test_sys_poller_prunes_unopened_descriptor() {
        // Far above anything the test process opens.
        let bogus: RawFd = 4000;
        let mut mux = Multiplexer::new();
        let mut readers = set(&[bogus]);
        let selected = mux
            .select(
                &mut readers,
                &mut FdSet::new(),
                &mut FdSet::new(),
                Some(Duration::ZERO),
            )
            .unwrap();
        assert!(selected.again);
        assert!(!readers.contains(&bogus));
    }
}
