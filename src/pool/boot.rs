//! Worker boot and shutdown hooks.
//!
//! Every forked worker runs [`process_initializer`] exactly once before it
//! announces itself. The pool runs [`process_destructor`] whenever it reaps
//! a worker, no matter how the worker ended.

use crate::logging::LogConfig;
use nix::sys::signal::{self, SigHandler, Signal};
use nix::unistd::Pid;
use std::rc::Rc;
use tracing::{debug, warn};

/// Signals a worker ignores so that terminal interrupts only reach the
/// pool process.
pub const WORKER_SIGIGNORE: &[Signal] = &[Signal::SIGINT];

/// Signals a worker resets to their default disposition.
pub const WORKER_SIGRESET: &[Signal] = &[
    Signal::SIGTERM,
    Signal::SIGHUP,
    Signal::SIGTTIN,
    Signal::SIGTTOU,
    Signal::SIGUSR1,
];

/// One-shot process setup applied in every worker.
#[derive(Debug, Clone)]
pub struct BootConfig {
    pub ignore_signals: Vec<Signal>,
    pub reset_signals: Vec<Signal>,
    /// Worker logging; `None` keeps whatever the pool process installed.
    pub log: Option<LogConfig>,
    /// Process name prefix; workers show up as `<prefix>-<index>`.
    pub title_prefix: String,
}

impl Default for BootConfig {
    fn default() -> Self {
        Self {
            ignore_signals: WORKER_SIGIGNORE.to_vec(),
            reset_signals: WORKER_SIGRESET.to_vec(),
            log: None,
            title_prefix: "prefork".to_string(),
        }
    }
}

impl BootConfig {
    pub fn with_log(mut self, log: LogConfig) -> Self {
        self.log = Some(log);
        self
    }

    pub fn with_title_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.title_prefix = prefix.into();
        self
    }
}

/// Identity and setup handed to the boot hook.
#[derive(Debug, Clone)]
pub struct WorkerBoot {
    /// Position of the worker in the pool at spawn time.
    pub index: usize,
    pub pid: Pid,
    pub hostname: String,
    pub config: BootConfig,
}

impl WorkerBoot {
    /// Name the worker process is given, e.g. `prefork-3`.
    pub fn process_title(&self) -> String {
        format!("{}-{}", self.config.title_prefix, self.index)
    }
}

/// User hook run inside each worker after the built-in setup.
pub type Initializer = Rc<dyn Fn(&WorkerBoot)>;

/// User hook run in the pool process with `(pid, exit_code)`.
pub type Destructor = Rc<dyn Fn(Pid, i32)>;

/// Rename the calling thread, which for a worker is the whole process.
/// The kernel keeps the first 15 bytes.
#[cfg(target_os = "linux")]
pub fn set_process_title(title: &str) -> nix::Result<()> {
    let name = std::ffi::CString::new(title).map_err(|_| nix::errno::Errno::EINVAL)?;
    nix::sys::prctl::set_name(&name)
}

#[cfg(not(target_os = "linux"))]
pub fn set_process_title(_title: &str) -> nix::Result<()> {
    Ok(())
}

/// Set up a freshly forked worker.
pub fn process_initializer(boot: &WorkerBoot, hook: Option<&Initializer>) {
    for &sig in &boot.config.ignore_signals {
        // Safety: installing SIG_IGN runs no handler code.
        if let Err(e) = unsafe { signal::signal(sig, SigHandler::SigIgn) } {
            warn!(signal = ?sig, error = %e, "Failed to ignore signal");
        }
    }
    for &sig in &boot.config.reset_signals {
        // Safety: restoring SIG_DFL runs no handler code.
        if let Err(e) = unsafe { signal::signal(sig, SigHandler::SigDfl) } {
            warn!(signal = ?sig, error = %e, "Failed to reset signal");
        }
    }

    let title = boot.process_title();
    if let Err(e) = set_process_title(&title) {
        debug!(%title, error = %e, "Failed to set process title");
    }

    if let Some(log) = &boot.config.log {
        crate::logging::init(log.for_worker(boot.index));
    }

    debug!(
        index = boot.index,
        pid = boot.pid.as_raw(),
        hostname = %boot.hostname,
        "Worker process initialized"
    );

    if let Some(hook) = hook {
        hook(boot);
    }
}

/// Report a reaped worker.
pub fn process_destructor(pid: Pid, exit_code: i32, hook: Option<&Destructor>) {
    debug!(pid = pid.as_raw(), exit_code, "Worker process shut down");
    if let Some(hook) = hook {
        hook(pid, exit_code);
    }
}
