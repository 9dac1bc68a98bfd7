//! How a worker process ended.

use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;
use std::fmt;

/// Final status of a reaped worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    Exited(i32),
    Signaled(Signal),
    /// Reaped elsewhere; the status is lost.
    Unknown,
}

impl TerminationReason {
    /// Terminal reason for a wait status, `None` while the process lives
    /// (still running, stopped or continued).
    pub fn from_wait(status: WaitStatus) -> Option<Self> {
        match status {
            WaitStatus::Exited(_, code) => Some(Self::Exited(code)),
            WaitStatus::Signaled(_, sig, _) => Some(Self::Signaled(sig)),
            _ => None,
        }
    }

    /// Exit code as handed to the shutdown hook. Signal deaths are the
    /// negated signal number.
    pub fn exit_code(&self) -> i32 {
        match *self {
            Self::Exited(code) => code,
            Self::Signaled(sig) => -(sig as i32),
            Self::Unknown => 0,
        }
    }

    pub fn is_success(&self) -> bool {
        *self == Self::Exited(0)
    }
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exited(code) => write!(f, "exit code {}", code),
            Self::Signaled(sig) => write!(f, "signal {}", sig.as_str()),
            Self::Unknown => write!(f, "unknown status"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::Pid;

    #[test]
    fn test_exit_codes() {
        assert_eq!(TerminationReason::Exited(3).exit_code(), 3);
        assert_eq!(TerminationReason::Signaled(Signal::SIGKILL).exit_code(), -9);
        assert_eq!(TerminationReason::Signaled(Signal::SIGQUIT).exit_code(), -3);
        assert_eq!(TerminationReason::Unknown.exit_code(), 0);
        assert!(TerminationReason::Exited(0).is_success());
        assert!(!TerminationReason::Signaled(Signal::SIGTERM).is_success());
    }

    #[test]
    fn test_from_wait_ignores_live_states() {
        let pid = Pid::from_raw(1);
        assert_eq!(
            TerminationReason::from_wait(WaitStatus::Signaled(pid, Signal::SIGTERM, false)),
            Some(TerminationReason::Signaled(Signal::SIGTERM))
        );
        assert_eq!(TerminationReason::from_wait(WaitStatus::StillAlive), None);
        assert_eq!(
            TerminationReason::from_wait(WaitStatus::Stopped(pid, Signal::SIGSTOP)),
            None
        );
    }

    #[test]
    fn test_display() {
        assert_eq!(TerminationReason::Exited(2).to_string(), "exit code 2");
        assert_eq!(
            TerminationReason::Signaled(Signal::SIGKILL).to_string(),
            "signal SIGKILL"
        );
    }
}
